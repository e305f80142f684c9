//! Offline readers for saved batches and the binary→TIFF converter.
//!
//! `images.bin` is a concatenation of records, each a three-`i32`
//! little-endian header (rows, cols, type) followed by the row-major payload.
//! Reading a batch back yields byte-identical images to the ones persisted.

use crate::config::ImageProcessingConfig;
use crate::error::{AppResult, EngineError};
use crate::frame::Roi;
use image::GrayImage;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::Path;

/// One decoded `images.bin` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinRecord {
    pub rows: i32,
    pub cols: i32,
    pub type_code: i32,
    pub data: Vec<u8>,
}

impl BinRecord {
    pub fn element_size(type_code: i32) -> AppResult<usize> {
        match type_code {
            0 => Ok(1), // single-channel 8-bit gray
            other => Err(EngineError::Persistence(format!(
                "unsupported image type code {other}"
            ))),
        }
    }
}

/// Read every record of an `images.bin` file.
pub fn read_image_records(path: &Path) -> AppResult<Vec<BinRecord>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    loop {
        let mut header = [0u8; 12];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let rows = i32::from_le_bytes(header[0..4].try_into().unwrap_or_default());
        let cols = i32::from_le_bytes(header[4..8].try_into().unwrap_or_default());
        let type_code = i32::from_le_bytes(header[8..12].try_into().unwrap_or_default());
        if rows <= 0 || cols <= 0 {
            return Err(EngineError::Persistence(format!(
                "corrupt record header: rows={rows} cols={cols}"
            )));
        }
        let len = rows as usize * cols as usize * BinRecord::element_size(type_code)?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        records.push(BinRecord {
            rows,
            cols,
            type_code,
            data,
        });
    }
    Ok(records)
}

/// Convert an `images.bin` file into numbered TIFFs under `out_dir`.
///
/// Returns the number of images written.
pub fn convert_to_tiff(bin_path: &Path, out_dir: &Path) -> AppResult<usize> {
    std::fs::create_dir_all(out_dir)?;
    let records = read_image_records(bin_path)?;
    for (index, record) in records.iter().enumerate() {
        let path = out_dir.join(format!("image_{index}.tiff"));
        let file = File::create(&path)?;
        let writer = BufWriter::new(file);
        let encoder = image::codecs::tiff::TiffEncoder::new(writer);
        encoder.encode(
            &record.data,
            record.cols as u32,
            record.rows as u32,
            image::ExtendedColorType::L8,
        )?;
    }
    tracing::info!(
        count = records.len(),
        dir = %out_dir.display(),
        "converted images to TIFF"
    );
    Ok(records.len())
}

/// One `batch_data.csv` row.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    pub condition: String,
    pub timestamp_us: i64,
    pub deformability: f64,
    pub area: f64,
}

/// Everything a saved batch directory contains.
pub struct BatchData {
    pub rows: Vec<BatchRow>,
    pub images: Vec<BinRecord>,
    pub roi: Roi,
    pub processing: ImageProcessingConfig,
    pub background: GrayImage,
}

/// Load a complete `batch_<N>/` directory back into memory.
pub fn read_batch(dir: &Path) -> AppResult<BatchData> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(dir.join("batch_data.csv"))?;
    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        if record.len() < 4 {
            return Err(EngineError::Persistence(format!(
                "short CSV row in {}",
                dir.display()
            )));
        }
        let parse_err = |field: &str| {
            EngineError::Persistence(format!("bad {field} in {}", dir.display()))
        };
        rows.push(BatchRow {
            condition: record[0].to_string(),
            timestamp_us: record[1].parse().map_err(|_| parse_err("timestamp"))?,
            deformability: record[2].parse().map_err(|_| parse_err("deformability"))?,
            area: record[3].parse().map_err(|_| parse_err("area"))?,
        });
    }

    let images = read_image_records(&dir.join("images.bin"))?;

    let mut roi_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(dir.join("roi.csv"))?;
    let roi_record = roi_reader
        .records()
        .next()
        .ok_or_else(|| EngineError::Persistence(format!("empty roi.csv in {}", dir.display())))??;
    let roi_field = |i: usize| -> AppResult<i32> {
        roi_record
            .get(i)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| EngineError::Persistence(format!("bad roi.csv in {}", dir.display())))
    };
    let roi = Roi::new(roi_field(0)?, roi_field(1)?, roi_field(2)?, roi_field(3)?);

    let config_text = std::fs::read_to_string(dir.join("processing_config.json"))?;
    let processing: ImageProcessingConfig = serde_json::from_str(&config_text)?;

    let background = image::open(dir.join("background_clean.tiff"))?.into_luma8();

    Ok(BatchData {
        rows,
        images,
        roi,
        processing,
        background,
    })
}
