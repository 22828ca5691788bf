use crate::config::UpsizerConfig;
use crate::extract::url_regex;
use crate::select::is_challenge_page;
use crate::{Result, UpsizerError};
use regex::Regex;
use reqwest::blocking::multipart::{Form, Part};
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;
use url::Url;

const IMAGE_FIELD: &str = "encoded_image";
const MAX_UPLOAD_RESPONSE_BYTES: u64 = 8 * 1024 * 1024;
const LEGACY_ORIGIN: &str = "https://google.com";

/// The search form: raw image bytes plus the empty/locale fields the
/// endpoint expects alongside them.
pub fn build_upload_form(file_name: &str, image: Vec<u8>) -> Result<Form> {
    let part = Part::bytes(image)
        .file_name(file_name.to_string())
        .mime_str("application/octet-stream")
        .map_err(|e| UpsizerError::Config(format!("upload form: {e}")))?;
    Ok(Form::new()
        .part(IMAGE_FIELD, part)
        .text("image_url", "")
        .text("filename", "")
        .text("hl", "en"))
}

/// POSTs the image to the search endpoint and returns the raw response.
pub fn upload_image(
    client: &reqwest::blocking::Client,
    config: &UpsizerConfig,
    path: &Path,
) -> Result<Vec<u8>> {
    let image = std::fs::read(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    let form = build_upload_form(&file_name, image)?;

    let url = config.upload_url.as_str();
    let response = client
        .post(url)
        .header("Origin", config.origin.as_str())
        .header("Referer", config.origin.as_str())
        .header("User-Agent", config.upload_user_agent.as_str())
        .multipart(form)
        .send()
        .map_err(|e| UpsizerError::Network {
            url: url.to_string(),
            detail: e.to_string(),
        })?;

    let status = response.status().as_u16();
    if !response.status().is_success() {
        return Err(UpsizerError::Upstream {
            url: url.to_string(),
            status,
        });
    }

    let mut buf = Vec::new();
    response
        .take(MAX_UPLOAD_RESPONSE_BYTES.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| UpsizerError::Network {
            url: url.to_string(),
            detail: format!("reading body: {e}"),
        })?;
    if buf.len() as u64 > MAX_UPLOAD_RESPONSE_BYTES {
        return Err(UpsizerError::Network {
            url: url.to_string(),
            detail: format!("body larger than {MAX_UPLOAD_RESPONSE_BYTES} bytes"),
        });
    }
    Ok(buf)
}

/// First well-formed http(s) URL embedded in the upload response.
pub fn resolve_redirect(body: &[u8]) -> Result<Url> {
    let text = String::from_utf8_lossy(body).replace("&amp;", "&");
    url_regex()
        .find_iter(&text)
        .filter_map(|m| Url::parse(m.as_str()).ok())
        .find(|u| matches!(u.scheme(), "http" | "https"))
        .ok_or(UpsizerError::NoRedirectFound)
}

/// Legacy backend: the "large sizes" results link in the upload response.
pub fn resolve_large_sizes_link(body: &[u8]) -> Result<Url> {
    static SIMG_RE: OnceLock<Regex> = OnceLock::new();
    let re =
        SIMG_RE.get_or_init(|| Regex::new(r#"(/search\?.*?simg:.*?)">"#).expect("simg regex"));

    let text = String::from_utf8_lossy(body);
    let link = re
        .captures_iter(&text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .find(|link| link.contains(",isz:l"));

    match link {
        Some(link) => {
            let full = format!("{LEGACY_ORIGIN}{}", unescape_html_entities(link));
            Url::parse(&full).map_err(|_| UpsizerError::NoRedirectFound)
        }
        None if is_challenge_page(&text) => Err(UpsizerError::CaptchaDetected),
        None => Err(UpsizerError::NoResults),
    }
}

fn unescape_html_entities(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
