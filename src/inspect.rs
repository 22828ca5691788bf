use crate::{Result, UpsizerError};
use image::{ImageFormat, ImageReader};
use serde::Serialize;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    Jpeg,
    Png,
    Webp,
    Other,
}

impl Codec {
    pub fn from_format(format: ImageFormat) -> Self {
        match format {
            ImageFormat::Jpeg => Codec::Jpeg,
            ImageFormat::Png => Codec::Png,
            ImageFormat::WebP => Codec::Webp,
            _ => Codec::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Codec::Jpeg => "jpeg",
            Codec::Png => "png",
            Codec::Webp => "webp",
            Codec::Other => "other",
        }
    }

    /// File extension for persisted images, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            Codec::Jpeg => "jpg",
            Codec::Png => "png",
            Codec::Webp => "webp",
            Codec::Other => "img",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An image flowing through the pipeline. Area and byte size are derived
/// from the content and cannot be set directly.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    source_url: String,
    bytes: Option<Vec<u8>>,
    codec: Codec,
    width: u32,
    height: u32,
    byte_size: u64,
    local_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub source_url: String,
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    pub area: u64,
    pub byte_size: u64,
    pub local_path: Option<String>,
}

impl ImageRecord {
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn area(&self) -> u64 {
        pixel_area(self.width, self.height)
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn local_path(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }

    /// Writes the owned bytes to `path` and hands them off; the returned
    /// record only points at the file.
    pub fn persist_to(mut self, path: &Path) -> Result<ImageRecord> {
        let Some(bytes) = self.bytes.take() else {
            return Err(UpsizerError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "image record has no bytes to persist",
            )));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &bytes)?;
        self.local_path = Some(path.to_path_buf());
        Ok(self)
    }

    pub(crate) fn with_source_url(mut self, source_url: &str) -> ImageRecord {
        self.source_url = source_url.to_string();
        self
    }

    pub fn summary(&self) -> ImageSummary {
        ImageSummary {
            source_url: self.source_url.clone(),
            codec: self.codec,
            width: self.width,
            height: self.height,
            area: self.area(),
            byte_size: self.byte_size,
            local_path: self
                .local_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        }
    }
}

/// Pixel area as a 64-bit product; never overflows for u32 sides.
pub fn pixel_area(width: u32, height: u32) -> u64 {
    u64::from(width) * u64::from(height)
}

/// Decodes only the container header of an in-memory image.
pub fn inspect_bytes(source_url: &str, bytes: Vec<u8>) -> Result<ImageRecord> {
    let label = if source_url.is_empty() {
        "<memory>"
    } else {
        source_url
    };
    let reader = ImageReader::new(Cursor::new(bytes.as_slice()))
        .with_guessed_format()
        .map_err(|e| decode_error(label, e.to_string()))?;
    let codec = supported_codec(label, reader.format())?;
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| decode_error(label, e.to_string()))?;

    Ok(ImageRecord {
        source_url: source_url.to_string(),
        byte_size: bytes.len() as u64,
        bytes: Some(bytes),
        codec,
        width,
        height,
        local_path: None,
    })
}

/// Decodes only the container header of a file on disk; bytes stay on disk.
pub fn inspect_file(path: &Path) -> Result<ImageRecord> {
    let label = path.to_string_lossy().to_string();
    let file = std::fs::File::open(path)?;
    let byte_size = file.metadata()?.len();
    let reader = ImageReader::new(BufReader::new(file))
        .with_guessed_format()
        .map_err(|e| decode_error(&label, e.to_string()))?;
    let codec = supported_codec(&label, reader.format())?;
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| decode_error(&label, e.to_string()))?;

    Ok(ImageRecord {
        source_url: String::new(),
        bytes: None,
        codec,
        width,
        height,
        byte_size,
        local_path: Some(path.to_path_buf()),
    })
}

fn supported_codec(label: &str, format: Option<ImageFormat>) -> Result<Codec> {
    match format.map(Codec::from_format) {
        Some(codec @ (Codec::Jpeg | Codec::Png | Codec::Webp)) => Ok(codec),
        Some(Codec::Other) => Err(decode_error(label, "unsupported container format")),
        None => Err(decode_error(label, "unrecognized image container")),
    }
}

fn decode_error(label: &str, detail: impl Into<String>) -> UpsizerError {
    UpsizerError::Decode {
        source_name: label.to_string(),
        detail: detail.into(),
    }
}

#[cfg(test)]
pub(crate) mod test_images {
    use image::{DynamicImage, ImageFormat, RgbImage, RgbaImage};
    use std::io::Cursor;

    pub fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = if format == ImageFormat::Png {
            DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
                image::Rgba([(x % 256) as u8, (y % 256) as u8, 90, 255])
            }))
        } else {
            DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
                image::Rgb([(x % 256) as u8, (y % 256) as u8, 90])
            }))
        };
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), format)
            .expect("encode test image");
        buf
    }
}
