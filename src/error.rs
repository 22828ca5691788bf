use crate::discover::Stage;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpsizerError {
    #[error("not a supported image ({source_name}): {detail}")]
    Decode { source_name: String, detail: String },

    #[error("request to {url} failed: {detail}")]
    Network { url: String, detail: String },

    #[error("{url} answered with status {status}")]
    Upstream { url: String, status: u16 },

    #[error("expected image content from {url}, got {content_type}")]
    UnexpectedContentType { url: String, content_type: String },

    #[error("no redirect url found in the upload response")]
    NoRedirectFound,

    #[error("no {page} link found in rendered page")]
    LinkNotFound { page: &'static str },

    #[error("could not extract {page} link: {reason}{}", dump_suffix(.dump_path))]
    Extraction {
        page: &'static str,
        reason: String,
        dump_path: Option<PathBuf>,
    },

    #[error("No other sizes of this image found.")]
    NoOtherSizes,

    #[error("no matches for this image")]
    NoMatches,

    #[error("no images found")]
    NoResults,

    #[error("response was a captcha page")]
    CaptchaDetected,

    #[error("rendering {url} did not finish within {timeout_secs}s")]
    ScrapeTimeout { url: String, timeout_secs: u64 },

    #[error("render session failed: {0}")]
    Render(String),

    #[error("canceled")]
    Canceled,

    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<UpsizerError>,
    },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),
}

fn dump_suffix(dump_path: &Option<PathBuf>) -> String {
    match dump_path {
        Some(path) => format!(" (html dumped to {})", path.display()),
        None => String::new(),
    }
}

/// What a batch driver should do after a single image ended with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAction {
    ContinueBatch,
    SkipImage,
    HaltBatch,
}

impl UpsizerError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            UpsizerError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The error underneath any stage wrapping.
    pub fn root(&self) -> &UpsizerError {
        match self {
            UpsizerError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Expected "no larger image" stops. These are outcomes, not failures.
    pub fn is_normal_stop(&self) -> bool {
        matches!(
            self.root(),
            UpsizerError::NoOtherSizes | UpsizerError::NoMatches | UpsizerError::NoResults
        )
    }

    /// Markup drift on the search side; worth reporting loudly.
    pub fn is_markup_drift(&self) -> bool {
        matches!(
            self.root(),
            UpsizerError::NoRedirectFound
                | UpsizerError::LinkNotFound { .. }
                | UpsizerError::Extraction { .. }
        )
    }

    pub fn batch_action(&self) -> BatchAction {
        match self.root() {
            UpsizerError::NoOtherSizes | UpsizerError::NoMatches | UpsizerError::NoResults => {
                BatchAction::ContinueBatch
            }
            UpsizerError::CaptchaDetected | UpsizerError::Canceled => BatchAction::HaltBatch,
            _ => BatchAction::SkipImage,
        }
    }

    pub(crate) fn at(self, stage: Stage) -> UpsizerError {
        match self {
            already @ UpsizerError::Stage { .. } => already,
            other => UpsizerError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, UpsizerError>;
