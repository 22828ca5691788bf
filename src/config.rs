use crate::paths::AppPaths;
use crate::{Result, UpsizerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_UPLOAD_URL: &str = "https://images.google.com/searchbyimage/upload";
pub const DEFAULT_ORIGIN: &str = "https://images.google.com/";
pub const DEFAULT_UPLOAD_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/101.0.4951.54 Safari/537.36";
pub const DEFAULT_FETCH_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:101.0) Gecko/20100101 Firefox/101.0";
const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 15;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_IMAGE_BYTES: u64 = 64 * 1024 * 1024;
const MAX_TIMEOUT_SECS: u64 = 600;

/// Which generation of the search backend's result flow to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchBackend {
    /// Upload redirects to script-rendered pages walked with a headless browser.
    Rendered,
    /// Upload answers with a "large sizes" link whose page embeds candidate triples.
    Legacy,
}

impl SearchBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rendered" => Some(Self::Rendered),
            "legacy" => Some(Self::Legacy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpsizerConfig {
    pub backend: SearchBackend,
    pub upload_url: String,
    /// Sent as both Origin and Referer on the upload.
    pub origin: String,
    pub upload_user_agent: String,
    pub fetch_user_agent: String,
    pub render_timeout_secs: u64,
    pub http_timeout_secs: u64,
    /// The image CDN is often served with certificates that do not validate.
    pub accept_invalid_certs: bool,
    pub max_image_bytes: u64,
}

impl Default for UpsizerConfig {
    fn default() -> Self {
        Self {
            backend: SearchBackend::Rendered,
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            upload_user_agent: DEFAULT_UPLOAD_USER_AGENT.to_string(),
            fetch_user_agent: DEFAULT_FETCH_USER_AGENT.to_string(),
            render_timeout_secs: DEFAULT_RENDER_TIMEOUT_SECS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            accept_invalid_certs: true,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

impl UpsizerConfig {
    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("upload_url", &self.upload_url), ("origin", &self.origin)] {
            let parsed = url::Url::parse(value.trim())
                .map_err(|e| UpsizerError::Config(format!("{name} is not a url: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(UpsizerError::Config(format!(
                    "{name} must be http(s), got {}",
                    parsed.scheme()
                )));
            }
        }
        for (name, secs) in [
            ("render_timeout_secs", self.render_timeout_secs),
            ("http_timeout_secs", self.http_timeout_secs),
        ] {
            if secs == 0 || secs > MAX_TIMEOUT_SECS {
                return Err(UpsizerError::Config(format!(
                    "{name} must be between 1 and {MAX_TIMEOUT_SECS}, got {secs}"
                )));
            }
        }
        if self.max_image_bytes == 0 {
            return Err(UpsizerError::Config(
                "max_image_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn load_config(paths: &AppPaths) -> Result<UpsizerConfig> {
    let path = paths.config_path();
    if !path.exists() {
        return Ok(UpsizerConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: UpsizerConfig = serde_json::from_slice(&bytes).map_err(|e| {
        UpsizerError::Config(format!(
            "failed to parse config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn save_config(paths: &AppPaths, config: &UpsizerConfig) -> Result<()> {
    config.validate()?;
    let path = paths.config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
