use crate::inspect::Codec;
use crate::{Result, UpsizerError};
use image::codecs::jpeg::JpegEncoder;
use image::ImageReader;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};

const JPEG_QUALITY: u8 = 85;

/// Re-encodes a persisted png/webp as JPEG next to the original and removes
/// the original. JPEG input is left untouched. Returns the resulting path and
/// the codec detected from the content (not the file name).
pub fn normalize_to_jpeg(path: &Path) -> Result<(PathBuf, Codec)> {
    let file = std::fs::File::open(path)?;
    let reader = ImageReader::new(BufReader::new(file)).with_guessed_format()?;
    let codec = reader
        .format()
        .map(Codec::from_format)
        .ok_or_else(|| UpsizerError::Decode {
            source_name: path.to_string_lossy().to_string(),
            detail: "unrecognized image container".to_string(),
        })?;

    if codec == Codec::Jpeg {
        return Ok((path.to_path_buf(), Codec::Jpeg));
    }

    let decoded = reader.decode()?;
    let rgb = decoded.to_rgb8();
    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(Cursor::new(&mut encoded), JPEG_QUALITY).encode_image(&rgb)?;

    let target = path.with_extension("jpg");
    std::fs::remove_file(path)?;
    std::fs::write(&target, &encoded)?;
    Ok((target, codec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::{inspect_file, test_images::encode};
    use image::ImageFormat;

    #[test]
    fn jpeg_is_returned_byte_identical() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shot.jpg");
        let bytes = encode(20, 10, ImageFormat::Jpeg);
        std::fs::write(&path, &bytes).expect("write");

        let (out, codec) = normalize_to_jpeg(&path).expect("normalize");
        assert_eq!(codec, Codec::Jpeg);
        assert_eq!(out, path);
        assert_eq!(std::fs::read(&out).expect("read"), bytes);
    }

    #[test]
    fn png_is_reencoded_and_original_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shot.png");
        std::fs::write(&path, encode(24, 12, ImageFormat::Png)).expect("write");

        let (out, codec) = normalize_to_jpeg(&path).expect("normalize");
        assert_eq!(codec, Codec::Png);
        assert_eq!(out, dir.path().join("shot.jpg"));
        assert!(!path.exists());
        let record = inspect_file(&out).expect("inspect");
        assert_eq!(record.codec(), Codec::Jpeg);
        assert_eq!((record.width(), record.height()), (24, 12));
    }

    #[test]
    fn misnamed_png_is_detected_by_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("actually_png.jpg");
        std::fs::write(&path, encode(8, 8, ImageFormat::Png)).expect("write");

        let (out, codec) = normalize_to_jpeg(&path).expect("normalize");
        assert_eq!(codec, Codec::Png);
        assert_eq!(out, path);
        assert_eq!(inspect_file(&out).expect("inspect").codec(), Codec::Jpeg);
    }

    #[test]
    fn extensionless_files_gain_jpg() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("noext");
        std::fs::write(&path, encode(8, 8, ImageFormat::Png)).expect("write");
        let (out, _) = normalize_to_jpeg(&path).expect("normalize");
        assert_eq!(out, dir.path().join("noext.jpg"));
    }
}
