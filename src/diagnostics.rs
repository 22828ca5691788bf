use crate::extract::{ALL_SIZES_PAGE, LARGEST_PAGE, SOURCE_PAGE};
use crate::{Result, UpsizerError};
use std::path::{Path, PathBuf};

/// Fixed dump file name per page, overwritten on each failure.
pub fn dump_file_name(page: &str) -> &'static str {
    match page {
        ALL_SIZES_PAGE => "all_sizes.html",
        LARGEST_PAGE => "largest_image.html",
        SOURCE_PAGE => "image_source.html",
        _ => "unknown_page.html",
    }
}

pub fn dump_html(dir: &Path, page: &str, html: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(dump_file_name(page));
    std::fs::write(&path, html)?;
    Ok(path)
}

/// Preserves the page behind an extraction failure and records where it went.
/// Other errors pass through untouched.
pub fn attach_dump(err: UpsizerError, dir: &Path, html: &str) -> UpsizerError {
    match err {
        UpsizerError::Extraction {
            page,
            reason,
            dump_path: None,
        } => match dump_html(dir, page, html) {
            Ok(path) => UpsizerError::Extraction {
                page,
                reason,
                dump_path: Some(path),
            },
            Err(dump_err) => UpsizerError::Extraction {
                page,
                reason: format!("{reason}; could not dump html: {dump_err}"),
                dump_path: None,
            },
        },
        other => other,
    }
}
