//! Pixel-level preprocessing: blur, contrast, background subtraction,
//! thresholding and morphology.
//!
//! All per-frame buffers live in [`Scratch`], allocated once per processor
//! thread from the frame geometry and reused for every frame. ROI-sized slabs
//! are resized only when the ROI dimensions change (a rare, operator-driven
//! event), so the steady state performs no heap allocation.
//!
//! The primitives reproduce the semantics of the classic library routines the
//! parameters were tuned against: the Gaussian kernel is derived from the
//! kernel size (sigma = 0.3·((k−1)/2 − 1) + 0.8) with reflect-101 borders,
//! morphology uses a cross structuring element, and CLOSE runs before OPEN.

use crate::config::ProcessingConfig;
use crate::frame::{ImageParams, Roi};
use image::GrayImage;

/// Per-thread scratch buffers for the segmentation pipeline.
pub struct Scratch {
    /// Owned copy of the frame being processed, full resolution.
    pub input: Vec<u8>,
    /// Output binary mask, full resolution; zero outside the ROI.
    pub mask: GrayImage,
    pub width: usize,
    pub height: usize,

    roi_w: usize,
    roi_h: usize,
    roi_src: Vec<u8>,
    blurred: Vec<u8>,
    enhanced: Vec<u8>,
    /// ROI crop of the prepared background, copied under the background lock.
    pub bg_roi: Vec<u8>,
    bg_sub: Vec<u8>,
    binary: Vec<u8>,
    morph_a: Vec<u8>,
    morph_b: Vec<u8>,
    htmp: Vec<f32>,

    kernel: Vec<f32>,
    kernel_size: u32,
}

impl Scratch {
    pub fn new(params: &ImageParams) -> Self {
        let full = params.width * params.height;
        Self {
            input: vec![0u8; full],
            mask: GrayImage::new(params.width as u32, params.height as u32),
            width: params.width,
            height: params.height,
            roi_w: 0,
            roi_h: 0,
            roi_src: Vec::new(),
            blurred: Vec::new(),
            enhanced: Vec::new(),
            bg_roi: Vec::new(),
            bg_sub: Vec::new(),
            binary: Vec::new(),
            morph_a: Vec::new(),
            morph_b: Vec::new(),
            htmp: Vec::new(),
            kernel: Vec::new(),
            kernel_size: 0,
        }
    }

    /// Resize the ROI-sized slabs when the ROI dimensions change.
    pub fn ensure_roi(&mut self, roi: Roi) {
        let (w, h) = (roi.width as usize, roi.height as usize);
        if w == self.roi_w && h == self.roi_h {
            return;
        }
        let len = w * h;
        self.roi_w = w;
        self.roi_h = h;
        for buf in [
            &mut self.roi_src,
            &mut self.blurred,
            &mut self.enhanced,
            &mut self.bg_roi,
            &mut self.bg_sub,
            &mut self.binary,
            &mut self.morph_a,
            &mut self.morph_b,
        ] {
            buf.resize(len, 0);
        }
        self.htmp.resize(len, 0.0);
    }

    fn ensure_kernel(&mut self, size: u32) {
        if self.kernel_size != size {
            self.kernel = gaussian_kernel(size);
            self.kernel_size = size;
        }
    }
}

/// Normalized 1-D Gaussian kernel for a given odd size, with the sigma the
/// tuning parameters assume for sigma = 0.
pub fn gaussian_kernel(size: u32) -> Vec<f32> {
    let k = size.max(1) as i32;
    let sigma = 0.3 * ((k - 1) as f32 * 0.5 - 1.0) + 0.8;
    let half = k / 2;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (-half..=half)
        .map(|i| (-(i * i) as f32 / denom).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}

/// Reflect-101 border index (`dcb|abcdefgh|gfe`).
fn mirror(mut i: i32, n: i32) -> usize {
    if n == 1 {
        return 0;
    }
    while i < 0 || i >= n {
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * n - 2 - i;
        }
    }
    i as usize
}

/// Separable Gaussian blur of a `w`×`h` grayscale buffer.
pub fn gaussian_blur(
    src: &[u8],
    dst: &mut [u8],
    w: usize,
    h: usize,
    kernel: &[f32],
    htmp: &mut [f32],
) {
    let half = (kernel.len() / 2) as i32;
    for y in 0..h {
        let row = y * w;
        for x in 0..w as i32 {
            let mut acc = 0.0f32;
            for (t, &kv) in kernel.iter().enumerate() {
                let sx = mirror(x + t as i32 - half, w as i32);
                acc += kv * f32::from(src[row + sx]);
            }
            htmp[row + x as usize] = acc;
        }
    }
    for y in 0..h as i32 {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (t, &kv) in kernel.iter().enumerate() {
                let sy = mirror(y + t as i32 - half, h as i32);
                acc += kv * htmp[sy * w + x];
            }
            dst[y as usize * w + x] = acc.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Pixelwise `new = alpha·old + beta`, saturated to 0..=255.
pub fn apply_contrast(src: &[u8], dst: &mut [u8], alpha: f64, beta: i32) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = (alpha * f64::from(s) + f64::from(beta)).round().clamp(0.0, 255.0) as u8;
    }
}

/// `dst = bg − target`, saturating at zero.
pub fn subtract_saturating(bg: &[u8], target: &[u8], dst: &mut [u8]) {
    for ((d, &b), &t) in dst.iter_mut().zip(bg).zip(target) {
        *d = b.saturating_sub(t);
    }
}

/// Binary threshold: `src >= threshold` → 255, else 0.
pub fn threshold_binary(src: &[u8], dst: &mut [u8], threshold: u8) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = if s >= threshold { 255 } else { 0 };
    }
}

fn dilate_cross(src: &[u8], dst: &mut [u8], w: usize, h: usize, radius: usize) {
    for y in 0..h {
        for x in 0..w {
            let mut m = src[y * w + x];
            for d in 1..=radius {
                if x >= d {
                    m = m.max(src[y * w + x - d]);
                }
                if x + d < w {
                    m = m.max(src[y * w + x + d]);
                }
                if y >= d {
                    m = m.max(src[(y - d) * w + x]);
                }
                if y + d < h {
                    m = m.max(src[(y + d) * w + x]);
                }
            }
            dst[y * w + x] = m;
        }
    }
}

fn erode_cross(src: &[u8], dst: &mut [u8], w: usize, h: usize, radius: usize) {
    for y in 0..h {
        for x in 0..w {
            let mut m = src[y * w + x];
            for d in 1..=radius {
                if x >= d {
                    m = m.min(src[y * w + x - d]);
                }
                if x + d < w {
                    m = m.min(src[y * w + x + d]);
                }
                if y >= d {
                    m = m.min(src[(y - d) * w + x]);
                }
                if y + d < h {
                    m = m.min(src[(y + d) * w + x]);
                }
            }
            dst[y * w + x] = m;
        }
    }
}

/// Morphological CLOSE then OPEN with a cross structuring element of
/// `kernel_size`, each applied `iterations` times. The result is left in `a`.
pub fn morph_close_open(
    binary: &[u8],
    w: usize,
    h: usize,
    kernel_size: u32,
    iterations: u32,
    a: &mut Vec<u8>,
    b: &mut Vec<u8>,
) {
    a.copy_from_slice(binary);
    let radius = (kernel_size / 2) as usize;
    if radius == 0 || iterations == 0 {
        return;
    }
    let mut step = |dilate: bool, a: &mut Vec<u8>, b: &mut Vec<u8>| {
        if dilate {
            dilate_cross(a, b, w, h, radius);
        } else {
            erode_cross(a, b, w, h, radius);
        }
        std::mem::swap(a, b);
    };
    // CLOSE: dilate^n then erode^n
    for _ in 0..iterations {
        step(true, a, b);
    }
    for _ in 0..iterations {
        step(false, a, b);
    }
    // OPEN: erode^n then dilate^n
    for _ in 0..iterations {
        step(false, a, b);
    }
    for _ in 0..iterations {
        step(true, a, b);
    }
}

/// Copy the ROI region of a full-resolution buffer into a packed ROI buffer.
pub fn copy_roi(src: &[u8], src_width: usize, roi: Roi, dst: &mut [u8]) {
    let (x, y) = (roi.x as usize, roi.y as usize);
    let (w, h) = (roi.width as usize, roi.height as usize);
    for row in 0..h {
        let src_off = (y + row) * src_width + x;
        dst[row * w..(row + 1) * w].copy_from_slice(&src[src_off..src_off + w]);
    }
}

/// Write a packed ROI mask back into a zeroed full-resolution mask.
pub fn write_roi_mask(mask: &mut [u8], full_width: usize, roi: Roi, roi_mask: &[u8]) {
    mask.fill(0);
    let (x, y) = (roi.x as usize, roi.y as usize);
    let (w, h) = (roi.width as usize, roi.height as usize);
    for row in 0..h {
        let dst_off = (y + row) * full_width + x;
        mask[dst_off..dst_off + w].copy_from_slice(&roi_mask[row * w..(row + 1) * w]);
    }
}

/// Run the full preprocessing chain on `scratch.input` within `roi`.
///
/// `scratch.bg_roi` must already hold the matching crop of the prepared
/// background. The result mask lands in `scratch.mask`, zero outside the ROI.
pub fn process_frame(roi: Roi, cfg: &ProcessingConfig, scratch: &mut Scratch) {
    scratch.ensure_roi(roi);
    scratch.ensure_kernel(cfg.gaussian_blur_size);
    let (w, h) = (roi.width as usize, roi.height as usize);

    copy_roi(&scratch.input, scratch.width, roi, &mut scratch.roi_src);
    gaussian_blur(
        &scratch.roi_src,
        &mut scratch.blurred,
        w,
        h,
        &scratch.kernel,
        &mut scratch.htmp,
    );
    let target: &[u8] = if cfg.enable_contrast_enhancement {
        apply_contrast(
            &scratch.blurred,
            &mut scratch.enhanced,
            cfg.contrast_alpha,
            cfg.contrast_beta,
        );
        &scratch.enhanced
    } else {
        &scratch.blurred
    };
    subtract_saturating(&scratch.bg_roi, target, &mut scratch.bg_sub);
    threshold_binary(&scratch.bg_sub, &mut scratch.binary, cfg.bg_subtract_threshold);
    morph_close_open(
        &scratch.binary,
        w,
        h,
        cfg.morph_kernel_size,
        cfg.morph_iterations,
        &mut scratch.morph_a,
        &mut scratch.morph_b,
    );
    write_roi_mask(&mut scratch.mask, scratch.width, roi, &scratch.morph_a);
}

/// Copy a raw grayscale buffer into a freshly allocated image.
pub fn gray_image_from(buf: &[u8], width: u32, height: u32) -> GrayImage {
    let mut img = GrayImage::new(width, height);
    (*img).copy_from_slice(buf);
    img
}

/// Blur and (when enabled) contrast-enhance a clean background capture with
/// the same parameters applied to every target frame.
pub fn prepare_background(clean: &GrayImage, cfg: &ProcessingConfig) -> GrayImage {
    let (w, h) = clean.dimensions();
    let len = (w * h) as usize;
    let kernel = gaussian_kernel(cfg.gaussian_blur_size);
    let mut htmp = vec![0.0f32; len];
    let mut blurred = vec![0u8; len];
    gaussian_blur(
        clean.as_raw(),
        &mut blurred,
        w as usize,
        h as usize,
        &kernel,
        &mut htmp,
    );
    let mut prepared = GrayImage::new(w, h);
    if cfg.enable_contrast_enhancement {
        apply_contrast(&blurred, &mut prepared, cfg.contrast_alpha, cfg.contrast_beta);
    } else {
        (*prepared).copy_from_slice(&blurred);
    }
    prepared
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_is_normalized_and_symmetric() {
        for size in [3u32, 5, 7, 9] {
            let k = gaussian_kernel(size);
            assert_eq!(k.len(), size as usize);
            let sum: f32 = k.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            for i in 0..k.len() / 2 {
                assert!((k[i] - k[k.len() - 1 - i]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn blur_preserves_uniform_fields() {
        let src = vec![77u8; 16 * 8];
        let mut dst = vec![0u8; 16 * 8];
        let mut htmp = vec![0.0f32; 16 * 8];
        gaussian_blur(&src, &mut dst, 16, 8, &gaussian_kernel(5), &mut htmp);
        assert!(dst.iter().all(|&v| v == 77));
    }

    #[test]
    fn contrast_saturates() {
        let src = [0u8, 100, 200, 250];
        let mut dst = [0u8; 4];
        apply_contrast(&src, &mut dst, 1.2, 10);
        assert_eq!(dst, [10, 130, 250, 255]);
    }

    #[test]
    fn subtraction_saturates_at_zero() {
        let bg = [50u8, 100, 10];
        let target = [20u8, 150, 10];
        let mut dst = [0u8; 3];
        subtract_saturating(&bg, &target, &mut dst);
        assert_eq!(dst, [30, 0, 0]);
    }

    #[test]
    fn threshold_is_inclusive() {
        let src = [9u8, 10, 11];
        let mut dst = [0u8; 3];
        threshold_binary(&src, &mut dst, 10);
        assert_eq!(dst, [0, 255, 255]);
    }

    #[test]
    fn open_removes_isolated_pixels() {
        // A single foreground pixel cannot survive OPEN.
        let mut binary = vec![0u8; 9 * 9];
        binary[4 * 9 + 4] = 255;
        let mut a = vec![0u8; 81];
        let mut b = vec![0u8; 81];
        morph_close_open(&binary, 9, 9, 3, 1, &mut a, &mut b);
        assert!(a.iter().all(|&v| v == 0));
    }

    #[test]
    fn close_fills_single_pixel_holes() {
        // A filled 5x5 block with a one-pixel hole: CLOSE fills the hole and
        // the block is large enough to survive OPEN.
        let mut binary = vec![0u8; 9 * 9];
        for y in 2..7 {
            for x in 2..7 {
                binary[y * 9 + x] = 255;
            }
        }
        binary[4 * 9 + 4] = 0;
        let mut a = vec![0u8; 81];
        let mut b = vec![0u8; 81];
        morph_close_open(&binary, 9, 9, 3, 1, &mut a, &mut b);
        assert_eq!(a[4 * 9 + 4], 255);
    }

    #[test]
    fn zero_iterations_is_identity() {
        let binary = vec![255u8; 16];
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        morph_close_open(&binary, 4, 4, 3, 0, &mut a, &mut b);
        assert_eq!(a, binary);
    }

    #[test]
    fn roi_mask_is_zero_outside_roi() {
        let mut mask = vec![9u8; 8 * 8];
        let roi = Roi::new(2, 2, 3, 3);
        let roi_mask = vec![255u8; 9];
        write_roi_mask(&mut mask, 8, roi, &roi_mask);
        for y in 0..8usize {
            for x in 0..8usize {
                let inside = (2..5).contains(&x) && (2..5).contains(&y);
                assert_eq!(mask[y * 8 + x], if inside { 255 } else { 0 });
            }
        }
    }

    #[test]
    fn process_frame_segments_dark_disc() {
        // Bright background, dark disc inside the ROI.
        let params = ImageParams::mono8(64, 48, 8);
        let mut scratch = Scratch::new(&params);
        let cfg = ProcessingConfig::default();
        let roi = Roi::full(64, 48);

        for v in scratch.input.iter_mut() {
            *v = 200;
        }
        for y in 0..48i32 {
            for x in 0..64i32 {
                if (x - 32).pow(2) + (y - 24).pow(2) <= 64 {
                    scratch.input[(y * 64 + x) as usize] = 80;
                }
            }
        }
        // Prepared background: uniform bright field through the same chain.
        let clean = GrayImage::from_pixel(64, 48, image::Luma([200u8]));
        let prepared = prepare_background(&clean, &cfg);
        scratch.ensure_roi(roi);
        copy_roi(prepared.as_raw(), 64, roi, &mut scratch.bg_roi);

        process_frame(roi, &cfg, &mut scratch);

        let mask = scratch.mask.as_raw();
        assert_eq!(mask[24 * 64 + 32], 255, "disc center");
        assert_eq!(mask[0], 0, "far corner");
        let area: usize = mask.iter().filter(|&&v| v == 255).count();
        assert!(area > 100 && area < 400, "disc area {area}");
    }
}
