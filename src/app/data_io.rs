use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use image::ImageFormat;
use serde::{Deserialize, Serialize};

use super::error::{Result, ScrapeError};
use super::types::{DataFormat, ImageRecord};

const CSV_HEADERS: [&str; 11] = [
    "site",
    "page",
    "item",
    "image",
    "source_url",
    "image_url",
    "path",
    "status",
    "bytes",
    "error",
    "saved_at",
];

/// How downloaded bytes land on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Bytes are written exactly as served.
    Raw,
    /// Decoded, flattened to RGB and re-encoded as JPEG.
    RgbJpeg,
}

pub fn listing_image_filename(name: &str, page: u32, item: usize, image: usize) -> String {
    format!("{name}_{page}_{item}_{image}.jpg")
}

pub fn plate_image_filename(emirate: &str, plate_text: &str) -> String {
    format!("UAE_{emirate}_{plate_text}.png")
}

/// Creates `{save_dir}/{name}` (and parents) if needed.
pub fn ensure_output_dir(save_dir: &Path, name: &str) -> io::Result<PathBuf> {
    let dir = save_dir.join(name);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub struct ImageDownloader {
    client: reqwest::Client,
}

impl ImageDownloader {
    pub fn new(verify_tls: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let res = self.client.get(url).send().await?;
        let status = res.status();
        if !status.is_success() {
            return Err(ScrapeError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(res.bytes().await?.to_vec())
    }

    /// Downloads `url` into `path`, returning the size of the written file.
    pub async fn save(&self, url: &str, path: &Path, mode: SaveMode) -> Result<usize> {
        let bytes = self.fetch(url).await?;
        let path = path.to_path_buf();
        match mode {
            SaveMode::Raw => persist_image(bytes, &path, mode),
            SaveMode::RgbJpeg => {
                tokio::task::spawn_blocking(move || persist_image(bytes, &path, mode)).await?
            }
        }
    }
}

pub fn persist_image(bytes: Vec<u8>, path: &Path, mode: SaveMode) -> Result<usize> {
    match mode {
        SaveMode::Raw => {
            fs::write(path, &bytes)?;
            Ok(bytes.len())
        }
        SaveMode::RgbJpeg => {
            let rgb = image::load_from_memory(&bytes)?.to_rgb8();
            rgb.save_with_format(path, ImageFormat::Jpeg)?;
            Ok(fs::metadata(path)?.len() as usize)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExportRecord {
    site: String,
    page: u32,
    item: usize,
    image: usize,
    source_url: String,
    image_url: String,
    path: String,
    status: String,
    bytes: usize,
    error: String,
    saved_at: String,
}

fn record_to_export(record: &ImageRecord) -> ExportRecord {
    ExportRecord {
        site: record.site.clone(),
        page: record.page,
        item: record.item,
        image: record.image,
        source_url: record.source_url.clone(),
        image_url: record.image_url.clone(),
        path: record.path.to_string_lossy().to_string(),
        status: record.status.label().to_string(),
        bytes: record.bytes,
        error: record.error.clone(),
        saved_at: record.saved_at.clone(),
    }
}

pub struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    fn new(output_path: &Path) -> io::Result<Self> {
        let file = File::create(output_path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(CSV_HEADERS)?;
        Ok(Self { writer })
    }

    fn write_record(&mut self, record: &ImageRecord) -> io::Result<()> {
        let rec = record_to_export(record);
        self.writer.write_record([
            rec.site,
            rec.page.to_string(),
            rec.item.to_string(),
            rec.image.to_string(),
            rec.source_url,
            rec.image_url,
            rec.path,
            rec.status,
            rec.bytes.to_string(),
            rec.error,
            rec.saved_at,
        ])?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

pub struct JsonSink {
    file: File,
    first: bool,
    closed: bool,
}

impl JsonSink {
    fn new(output_path: &Path) -> io::Result<Self> {
        let mut file = File::create(output_path)?;
        file.write_all(b"[\n")?;
        Ok(Self {
            file,
            first: true,
            closed: false,
        })
    }

    fn write_record(&mut self, record: &ImageRecord) -> io::Result<()> {
        let rec = record_to_export(record);
        if !self.first {
            self.file.write_all(b",\n")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.file, &rec).map_err(io::Error::other)?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn finalize(&mut self) -> io::Result<()> {
        if !self.closed {
            if self.first {
                self.file.write_all(b"]\n")?;
            } else {
                self.file.write_all(b"\n]\n")?;
            }
            self.closed = true;
        }
        self.file.flush()
    }
}

impl Drop for JsonSink {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

/// Append-only manifest of every download attempt in a run.
pub enum ManifestSink {
    Csv(CsvSink),
    Json(JsonSink),
}

impl ManifestSink {
    pub fn new(output_path: &Path, format: DataFormat) -> io::Result<Self> {
        match format {
            DataFormat::Csv => Ok(ManifestSink::Csv(CsvSink::new(output_path)?)),
            DataFormat::Json => Ok(ManifestSink::Json(JsonSink::new(output_path)?)),
        }
    }

    pub fn write_record(&mut self, record: &ImageRecord) -> io::Result<()> {
        match self {
            ManifestSink::Csv(sink) => sink.write_record(record),
            ManifestSink::Json(sink) => sink.write_record(record),
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self {
            ManifestSink::Csv(sink) => sink.flush(),
            ManifestSink::Json(sink) => sink.flush(),
        }
    }

    pub fn finalize(&mut self) -> io::Result<()> {
        match self {
            ManifestSink::Csv(sink) => sink.flush(),
            ManifestSink::Json(sink) => sink.finalize(),
        }
    }
}

pub fn detect_data_format(path: &Path, fallback: DataFormat) -> DataFormat {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("json") => DataFormat::Json,
        Some("csv") => DataFormat::Csv,
        _ => fallback,
    }
}

/// Manifest beside the run directory, so `{save_dir}/{name}` holds only images.
pub fn default_manifest_path(save_dir: &Path, name: &str, format: DataFormat) -> PathBuf {
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    match format {
        DataFormat::Csv => save_dir.join(format!("{name}_manifest_{ts}.csv")),
        DataFormat::Json => save_dir.join(format!("{name}_manifest_{ts}.json")),
    }
}

pub fn run_log_path(save_dir: &Path, name: &str) -> PathBuf {
    save_dir.join(format!("{name}_reaper.log"))
}
