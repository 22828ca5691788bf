//! Pattern matchers for the rendered search pages.
//!
//! Each page's markup is unversioned and shifts over time, so every matcher
//! first casts a wide pattern over the page and only then narrows in on the
//! link inside that region. All functions here are pure: HTML in, URL or a
//! typed outcome out.

use crate::select::is_challenge_page;
use crate::{Result, UpsizerError};
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::OnceLock;
use url::Url;

pub const SEARCH_ORIGIN: &str = "https://www.google.com";
pub const NO_OTHER_SIZES_MESSAGE: &str = "No other sizes of this image found.";
pub const NO_MATCHES_MESSAGE: &str = "Looks like there aren\u{2019}t any matches for your search";

pub const SOURCE_PAGE: &str = "image source";
pub const ALL_SIZES_PAGE: &str = "all sizes";
pub const LARGEST_PAGE: &str = "largest image";

pub(crate) fn url_regex() -> &'static Regex {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    URL_RE.get_or_init(|| {
        Regex::new(
            r"(http|ftp|https)://([\w_-]+(?:(?:\.[\w_-]+)+))([\w.,@?^=%&:/~+#-]*[\w@?^=%&/~+#-])",
        )
        .expect("url regex")
    })
}

/// The "search by image source" link on the page the upload redirects to.
pub fn find_source_link(html: &str) -> Result<Url> {
    static SOURCE_RE: OnceLock<Regex> = OnceLock::new();
    let re = SOURCE_RE.get_or_init(|| {
        Regex::new(r"https://www\.google\.com/search\?tbs=sbi:[a-zA-Z0-9_-]*")
            .expect("source link regex")
    });

    match re.find(html).and_then(|m| Url::parse(m.as_str()).ok()) {
        Some(url) => Ok(url),
        None if is_challenge_page(html) => Err(UpsizerError::CaptchaDetected),
        None => Err(UpsizerError::LinkNotFound { page: SOURCE_PAGE }),
    }
}

/// The "All sizes" link on the image source page.
pub fn find_all_sizes_link(html: &str) -> Result<Url> {
    static WIDE_RE: OnceLock<Regex> = OnceLock::new();
    let wide_re = WIDE_RE.get_or_init(|| {
        Regex::new(r"/search\?tbs=simg:.*>All sizes").expect("all sizes wide regex")
    });

    let narrowed = wide_re.find(html).and_then(|wide| {
        let region = wide.as_str();
        let end = region.find('"')?;
        Some(region[..end].replace("&amp;", "&"))
    });
    if let Some(url) = narrowed.and_then(|link| absolutize(&link)) {
        return Ok(url);
    }
    if let Some(url) = find_all_sizes_anchor(html) {
        return Ok(url);
    }

    if html.contains(NO_OTHER_SIZES_MESSAGE) {
        return Err(UpsizerError::NoOtherSizes);
    }
    if is_challenge_page(html) {
        return Err(UpsizerError::CaptchaDetected);
    }
    Err(UpsizerError::Extraction {
        page: ALL_SIZES_PAGE,
        reason: "no anchor labelled \"All sizes\"".to_string(),
        dump_path: None,
    })
}

/// Structural fallback for when attribute order or whitespace defeats the
/// wide pattern.
fn find_all_sizes_anchor(html: &str) -> Option<Url> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("anchor selector");
    document
        .select(&selector)
        .filter(|a| a.text().collect::<String>().trim() == "All sizes")
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| href.contains("simg:"))
        .find_map(absolutize)
}

/// The full-size link on the "All sizes" results page: the identifier next
/// to "Image Results" brackets script blocks, and the second URL of the
/// second block is the full-size image (the first is its thumbnail).
pub fn find_largest_image_link(html: &str) -> Result<Url> {
    static WIDE_RE: OnceLock<Regex> = OnceLock::new();
    static DATA_ID_RE: OnceLock<Regex> = OnceLock::new();
    let wide_re = WIDE_RE.get_or_init(|| {
        Regex::new(r#"Image Results.*data-id="[a-zA-Z0-9_-]*""#).expect("image results regex")
    });
    let data_id_re = DATA_ID_RE
        .get_or_init(|| Regex::new(r#"data-id="([a-zA-Z0-9_-]*)""#).expect("data-id regex"));

    let data_id = wide_re
        .find(html)
        .and_then(|wide| data_id_re.captures(wide.as_str()))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|id| !id.is_empty());

    let Some(data_id) = data_id else {
        return Err(largest_failure(html, "no data-id near \"Image Results\""));
    };

    let id = regex::escape(&data_id);
    let block_re = Regex::new(&format!("{id}.*{id}")).map_err(|e| UpsizerError::Extraction {
        page: LARGEST_PAGE,
        reason: format!("bad block pattern: {e}"),
        dump_path: None,
    })?;
    let blocks: Vec<&str> = block_re.find_iter(html).take(2).map(|m| m.as_str()).collect();
    if blocks.len() < 2 {
        return Err(largest_failure(html, "did not find enough script blocks"));
    }

    let urls: Vec<&str> = url_regex()
        .find_iter(blocks[1])
        .take(2)
        .map(|m| m.as_str())
        .collect();
    if urls.len() < 2 {
        return Err(largest_failure(html, "did not find enough urls"));
    }

    Url::parse(urls[1]).map_err(|e| UpsizerError::Extraction {
        page: LARGEST_PAGE,
        reason: format!("full-size link is not a url: {e}"),
        dump_path: None,
    })
}

fn largest_failure(html: &str, reason: &str) -> UpsizerError {
    if html.contains(NO_MATCHES_MESSAGE) {
        return UpsizerError::NoMatches;
    }
    if is_challenge_page(html) {
        return UpsizerError::CaptchaDetected;
    }
    UpsizerError::Extraction {
        page: LARGEST_PAGE,
        reason: reason.to_string(),
        dump_path: None,
    }
}

fn absolutize(link: &str) -> Option<Url> {
    let base = Url::parse(SEARCH_ORIGIN).ok()?;
    let joined = base.join(link.trim()).ok()?;
    matches!(joined.scheme(), "http" | "https").then_some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_link_is_found() {
        let html = r#"<a href="https://www.google.com/search?tbs=sbi:AMhZZit_9-x&amp;hl=en">Find image source</a>"#;
        let url = find_source_link(html).expect("source");
        assert_eq!(
            url.as_str(),
            "https://www.google.com/search?tbs=sbi:AMhZZit_9-x"
        );
    }

    #[test]
    fn missing_source_link_is_link_not_found() {
        let err = find_source_link("<html><body>Visually similar</body></html>").expect_err("none");
        assert!(
            matches!(err, UpsizerError::LinkNotFound { page: SOURCE_PAGE }),
            "{err}"
        );
    }

    #[test]
    fn all_sizes_wide_match_is_narrowed_and_unescaped() {
        let html = r#"<div class="x"><a class="gl" href="/search?tbs=simg:CAQSlwEJ&amp;hl=en&amp;sa=X" data-ved="0ah">All sizes</a></div>"#;
        let url = find_all_sizes_link(html).expect("all sizes");
        assert_eq!(
            url.as_str(),
            "https://www.google.com/search?tbs=simg:CAQSlwEJ&hl=en&sa=X"
        );
    }

    #[test]
    fn all_sizes_falls_back_to_anchor_text_across_lines() {
        let html = "<div>\n<a\n  data-ved=\"1\"\n  href=\"/search?q=x&amp;tbs=simg:ZZZ\">\n  All sizes\n</a>\n</div>";
        let url = find_all_sizes_link(html).expect("all sizes");
        assert_eq!(
            url.as_str(),
            "https://www.google.com/search?q=x&tbs=simg:ZZZ"
        );
    }

    #[test]
    fn no_other_sizes_message_is_a_normal_stop() {
        let html = "<div><span>No other sizes of this image found.</span></div>";
        let err = find_all_sizes_link(html).expect_err("no sizes");
        assert!(matches!(err, UpsizerError::NoOtherSizes), "{err}");
    }

    #[test]
    fn missing_all_sizes_anchor_is_extraction_error() {
        let err = find_all_sizes_link("<div>Pages that include matching images</div>")
            .expect_err("drift");
        assert!(
            matches!(err, UpsizerError::Extraction { page: ALL_SIZES_PAGE, .. }),
            "{err}"
        );
    }

    #[test]
    fn challenge_page_is_captcha_for_every_extractor() {
        let html = "<html><div id=\"recaptcha\"></div></html>";
        assert!(matches!(
            find_source_link(html),
            Err(UpsizerError::CaptchaDetected)
        ));
        assert!(matches!(
            find_all_sizes_link(html),
            Err(UpsizerError::CaptchaDetected)
        ));
        assert!(matches!(
            find_largest_image_link(html),
            Err(UpsizerError::CaptchaDetected)
        ));
    }

    const LARGEST_FIXTURE: &str = concat!(
        "<div role=\"heading\">Image Results</div><div jsname=\"r\" data-id=\"lw_9-Q\" class=\"c\">\n",
        "<script>lw_9-Q;(function(){var s='https://encrypted-tbn0.example.com/a.jpg';})();lw_9-Q</script>\n",
        "<script>lw_9-Q;AF_dataServiceRequests([\"https://encrypted-tbn1.example.com/thumb?q=1\",",
        "\"https://upload.example.org/wiki/full_size.jpg\",\"https://other.example.com/x.png\"]);lw_9-Q</script>\n",
    );

    #[test]
    fn largest_link_is_second_url_of_second_block() {
        let url = find_largest_image_link(LARGEST_FIXTURE).expect("largest");
        assert_eq!(url.as_str(), "https://upload.example.org/wiki/full_size.jpg");
    }

    #[test]
    fn largest_with_no_matches_message_is_normal_stop() {
        let html = "<div>Looks like there aren\u{2019}t any matches for your search</div>";
        let err = find_largest_image_link(html).expect_err("no matches");
        assert!(matches!(err, UpsizerError::NoMatches), "{err}");
    }

    #[test]
    fn largest_with_short_block_is_extraction_error() {
        let html = "<div>Image Results</div><div data-id=\"abc\"></div>\n<script>abc ok abc</script>\n";
        let err = find_largest_image_link(html).expect_err("short");
        assert!(
            matches!(err, UpsizerError::Extraction { page: LARGEST_PAGE, .. }),
            "{err}"
        );
    }

    #[test]
    fn url_regex_requires_a_dotted_host() {
        let found: Vec<&str> = url_regex()
            .find_iter("see http://localhost/x and https://a.example.com/p?q=1.")
            .map(|m| m.as_str())
            .collect();
        assert_eq!(found, vec!["https://a.example.com/p?q=1"]);
    }
}
