use crate::inspect::pixel_area;
use crate::{Result, UpsizerError};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

const CHALLENGE_MARKERS: &[&str] = &["captcha", "unusual traffic from your computer network"];

/// An unfetched result proposed as a possibly larger image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub area: u64,
}

impl Candidate {
    pub fn new(url: String, width: u32, height: u32) -> Self {
        Self {
            url,
            width,
            height,
            area: pixel_area(width, height),
        }
    }

    /// A link whose dimensions are only known once it has been fetched.
    pub fn unmeasured(url: String) -> Self {
        Self::new(url, 0, 0)
    }

    pub fn is_measured(&self) -> bool {
        self.area > 0
    }
}

/// True when the text is the search engine's anti-automation challenge.
pub fn is_challenge_page(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Every well-formed `["https://…",height,width]` triple in the blob.
/// Malformed entries are skipped.
pub fn parse_candidates(blob: &str) -> Vec<Candidate> {
    static TRIPLE_RE: OnceLock<Regex> = OnceLock::new();
    let re = TRIPLE_RE
        .get_or_init(|| {
            Regex::new(r#"\["(https://(?:[^"\\]|\\.)+)",(\d+),(\d+)\]"#).expect("triple regex")
        });

    let mut out = Vec::new();
    for caps in re.captures_iter(blob) {
        let (Some(raw_url), Some(raw_h), Some(raw_w)) = (caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };
        let Some(url) = unescape_js_string(raw_url.as_str()) else {
            continue;
        };
        if url::Url::parse(&url).is_err() {
            continue;
        }
        let (Ok(height), Ok(width)) = (raw_h.as_str().parse::<u32>(), raw_w.as_str().parse::<u32>())
        else {
            continue;
        };
        out.push(Candidate::new(url, width, height));
    }
    out
}

/// The candidate with the largest pixel area; the first one wins ties.
pub fn select_largest(blob: &str) -> Result<Candidate> {
    let mut best: Option<Candidate> = None;
    for candidate in parse_candidates(blob) {
        let replace = match &best {
            None => true,
            Some(current) => candidate.area > current.area,
        };
        if replace {
            best = Some(candidate);
        }
    }

    match best {
        Some(candidate) => Ok(candidate),
        None if is_challenge_page(blob) => Err(UpsizerError::CaptchaDetected),
        None => Err(UpsizerError::NoResults),
    }
}

/// Undoes JS/JSON string escaping (`\u003d`, `\/`); `None` unless the capture
/// is a well-formed string literal body.
fn unescape_js_string(raw: &str) -> Option<String> {
    serde_json::from_str::<String>(&format!("\"{raw}\"")).ok()
}
