//! Fixed-capacity frame ring for lock-free, single-writer frame streaming.
//!
//! This module implements the slotted ring buffer that carries frame payloads
//! between the source, the dispatcher and the consumers. Each ring holds the
//! `capacity` most recent fixed-size payloads in one contiguous, pre-allocated
//! block.
//!
//! # Thread Safety
//!
//! - **Writes**: exactly one writer at a time. The writer discipline is
//!   structural: the source owns its camera ring, the dispatcher owns the
//!   display and processing rings. Writes publish with Release ordering.
//! - **Reads**: lock-free atomic loads with Acquire ordering. Readers of the
//!   newest slot accept racy contents (the dispatcher copies a slot into an
//!   owned buffer before notifying consumers, so consumers never race the
//!   source).
//! - **Sequence-validated reads**: [`FrameRing::push`] returns a monotone
//!   sequence number. [`FrameRing::read_seq`] copies the slot for a sequence
//!   number and then re-checks that the slot was not overwritten during the
//!   copy, in the manner of a seqlock. A failed re-check reports
//!   [`RingError::Overwritten`] instead of returning torn data.
//!
//! # Addressing
//!
//! Offset addressing counts back from the newest slot: `get(0)` is the most
//! recent payload, `get(size() - 1)` the oldest still held.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("ring index {index} out of bounds ({len} valid slots)")]
    OutOfBounds { index: usize, len: usize },

    #[error("payload is {got} bytes but ring slots are {want} bytes")]
    SlotSizeMismatch { got: usize, want: usize },

    #[error("frame sequence {seq} has not been published yet")]
    NotYetWritten { seq: u64 },

    #[error("frame sequence {seq} was overwritten by newer frames")]
    Overwritten { seq: u64 },
}

/// Fixed-capacity ring of fixed-size frame payloads.
pub struct FrameRing {
    /// Backing storage; kept alive for the lifetime of the ring.
    ///
    /// The boxed slice never reallocates, so `data` stays valid.
    #[expect(dead_code, reason = "storage must be kept alive; data points into it")]
    storage: UnsafeCell<Box<[u8]>>,
    /// Pointer to the start of `storage`.
    /// SAFETY: valid as long as `storage` exists; the box is never resized.
    data: *mut u8,
    slot_bytes: usize,
    capacity: usize,
    /// Next slot to write, `< capacity`.
    head: AtomicUsize,
    /// Valid slot count, saturating at `capacity`.
    len: AtomicUsize,
    /// Total completed pushes since creation (monotone, never wraps).
    pushes: AtomicU64,
}

// SAFETY: all cross-thread access goes through atomic head/len/pushes with
// Acquire/Release ordering; the raw data pointer is only written by the single
// writer and read by readers that either tolerate racy newest-slot contents or
// validate with read_seq.
#[allow(unsafe_code)]
unsafe impl Send for FrameRing {}

// SAFETY: see Send. The single-writer discipline is documented on `push`.
#[allow(unsafe_code)]
unsafe impl Sync for FrameRing {}

impl std::fmt::Debug for FrameRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRing")
            .field("capacity", &self.capacity)
            .field("slot_bytes", &self.slot_bytes)
            .field("len", &self.len())
            .field("pushes", &self.pushes())
            .finish()
    }
}

impl FrameRing {
    /// Allocate a ring of `capacity` slots of `slot_bytes` each.
    ///
    /// The full `capacity * slot_bytes` block is allocated up front; pushes
    /// never allocate.
    pub fn new(capacity: usize, slot_bytes: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        assert!(slot_bytes > 0, "ring slot size must be non-zero");
        let mut storage = vec![0u8; capacity * slot_bytes].into_boxed_slice();
        let data = storage.as_mut_ptr();
        Self {
            storage: UnsafeCell::new(storage),
            data,
            slot_bytes,
            capacity,
            head: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            pushes: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    /// Count of valid slots, `<= capacity`. Non-decreasing until full.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Total completed pushes since creation.
    pub fn pushes(&self) -> u64 {
        self.pushes.load(Ordering::Acquire)
    }

    /// Copy `src` into the oldest slot and publish it as the newest.
    ///
    /// Returns the monotone sequence number of this push (0-based).
    ///
    /// # Writer discipline
    ///
    /// Exactly one thread may call `push` on a given ring. This is not
    /// enforced by the type; the pipeline enforces it structurally (one
    /// producer per ring).
    #[allow(unsafe_code)]
    pub fn push(&self, src: &[u8]) -> Result<u64, RingError> {
        if src.len() != self.slot_bytes {
            return Err(RingError::SlotSizeMismatch {
                got: src.len(),
                want: self.slot_bytes,
            });
        }
        let head = self.head.load(Ordering::Relaxed);
        // SAFETY: head < capacity, so the destination range
        // [data + head*slot_bytes, data + (head+1)*slot_bytes) lies inside the
        // backing allocation. `src` cannot alias the destination because
        // callers pass either an external buffer or a slot of a *different*
        // ring.
        unsafe {
            let dst = self.data.add(head * self.slot_bytes);
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, self.slot_bytes);
        }
        self.head
            .store((head + 1) % self.capacity, Ordering::Release);
        let len = self.len.load(Ordering::Relaxed);
        self.len
            .store((len + 1).min(self.capacity), Ordering::Release);
        // fetch_add returns the pre-increment count, which is this push's
        // 0-based sequence number.
        Ok(self.pushes.fetch_add(1, Ordering::Release))
    }

    fn slot_index_for_offset(&self, offset: usize) -> Result<usize, RingError> {
        let len = self.len();
        if offset >= len {
            return Err(RingError::OutOfBounds { index: offset, len });
        }
        let head = self.head.load(Ordering::Acquire);
        Ok((head + self.capacity - 1 - offset) % self.capacity)
    }

    /// Copy of the payload at logical offset `offset` (0 = newest).
    pub fn get(&self, offset: usize) -> Result<Vec<u8>, RingError> {
        let mut out = vec![0u8; self.slot_bytes];
        self.copy_into(offset, &mut out)?;
        Ok(out)
    }

    /// Copy the payload at logical offset `offset` into `dst` without
    /// allocating.
    #[allow(unsafe_code)]
    pub fn copy_into(&self, offset: usize, dst: &mut [u8]) -> Result<(), RingError> {
        if dst.len() != self.slot_bytes {
            return Err(RingError::SlotSizeMismatch {
                got: dst.len(),
                want: self.slot_bytes,
            });
        }
        let slot = self.slot_index_for_offset(offset)?;
        // SAFETY: slot < capacity, so the source range lies inside the backing
        // allocation. The newest slot may be concurrently rewritten; callers
        // of offset-addressed reads accept that race (see module docs).
        unsafe {
            let src = self.data.add(slot * self.slot_bytes);
            std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), self.slot_bytes);
        }
        Ok(())
    }

    /// Borrow the payload at logical offset `offset` (0 = newest).
    ///
    /// The borrow is only meaningful until the writer's next `push`
    /// completes: after `capacity` further pushes the slot is rewritten.
    /// Callers must either copy before yielding or hold an external guarantee
    /// that no writer is active (e.g. a paused run).
    #[allow(unsafe_code)]
    pub fn pointer(&self, offset: usize) -> Result<&[u8], RingError> {
        let slot = self.slot_index_for_offset(offset)?;
        // SAFETY: slot < capacity; the returned slice stays inside the backing
        // allocation, which lives as long as `self`.
        Ok(unsafe {
            std::slice::from_raw_parts(self.data.add(slot * self.slot_bytes), self.slot_bytes)
        })
    }

    /// Borrow the slot holding sequence number `seq`.
    ///
    /// Fails when `seq` has not been published or has already been
    /// overwritten. The same validity caveat as [`FrameRing::pointer`]
    /// applies to the contents.
    #[allow(unsafe_code)]
    pub fn slot_for_seq(&self, seq: u64) -> Result<&[u8], RingError> {
        let pushes = self.pushes();
        if seq >= pushes {
            return Err(RingError::NotYetWritten { seq });
        }
        // `>=` rather than `>`: a push that is lapping this slot right now has
        // not been counted yet, so the oldest live slot must be treated as
        // already gone.
        if pushes - seq >= self.capacity as u64 {
            return Err(RingError::Overwritten { seq });
        }
        let slot = (seq % self.capacity as u64) as usize;
        // SAFETY: slot < capacity; see `pointer`.
        Ok(unsafe {
            std::slice::from_raw_parts(self.data.add(slot * self.slot_bytes), self.slot_bytes)
        })
    }

    /// Copy the slot holding sequence number `seq` into `dst`, detecting
    /// overwrites that race the copy.
    #[allow(unsafe_code)]
    pub fn read_seq(&self, seq: u64, dst: &mut [u8]) -> Result<(), RingError> {
        if dst.len() != self.slot_bytes {
            return Err(RingError::SlotSizeMismatch {
                got: dst.len(),
                want: self.slot_bytes,
            });
        }
        let pushes = self.pushes();
        if seq >= pushes {
            return Err(RingError::NotYetWritten { seq });
        }
        if pushes - seq >= self.capacity as u64 {
            return Err(RingError::Overwritten { seq });
        }
        let slot = (seq % self.capacity as u64) as usize;
        // SAFETY: slot < capacity; see `copy_into`.
        unsafe {
            let src = self.data.add(slot * self.slot_bytes);
            std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), self.slot_bytes);
        }
        // Re-check after the copy: if the writer lapped (or is lapping) this
        // slot while we were reading, the copy may be torn and must be
        // discarded.
        if self.pushes() - seq >= self.capacity as u64 {
            return Err(RingError::Overwritten { seq });
        }
        Ok(())
    }
}
