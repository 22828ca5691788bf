use crate::config::UpsizerConfig;
use crate::http::{header_string, read_body_limited, transport_error};
use crate::inspect::{inspect_bytes, ImageRecord};
use crate::{Result, UpsizerError};

const MAX_PAGE_BYTES: u64 = 8 * 1024 * 1024;

/// Downloads a fully resolved image URL and decodes its header.
pub fn fetch_image(agent: &ureq::Agent, url: &str, max_bytes: u64) -> Result<ImageRecord> {
    let mut response = agent.get(url).call().map_err(|e| transport_error(url, e))?;

    // Status and content type decide before any of the body is read.
    let status = response.status().as_u16();
    if !(200..=299).contains(&status) {
        return Err(UpsizerError::Upstream {
            url: url.to_string(),
            status,
        });
    }
    let content_type = header_string(&response, "content-type");
    check_image_content_type(url, &content_type)?;

    let body = read_body_limited(&mut response, url, max_bytes)?;
    inspect_bytes(url, body)
}

/// An HTML answer from the CDN is an interstitial or error page, never image bytes.
pub fn check_image_content_type(url: &str, content_type: &str) -> Result<()> {
    if content_type.starts_with("text/html") {
        return Err(UpsizerError::UnexpectedContentType {
            url: url.to_string(),
            content_type: content_type.to_string(),
        });
    }
    Ok(())
}

/// GET of a search results page with the same browser headers as the upload.
pub fn fetch_page(agent: &ureq::Agent, config: &UpsizerConfig, url: &str) -> Result<String> {
    let mut response = agent
        .get(url)
        .header("Origin", config.origin.as_str())
        .header("Referer", config.origin.as_str())
        .header("User-Agent", config.upload_user_agent.as_str())
        .call()
        .map_err(|e| transport_error(url, e))?;

    let status = response.status().as_u16();
    if !(200..=299).contains(&status) {
        return Err(UpsizerError::Upstream {
            url: url.to_string(),
            status,
        });
    }
    let body = read_body_limited(&mut response, url, MAX_PAGE_BYTES)?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}
