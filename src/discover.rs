//! The discovery state machine.
//!
//! One run walks `Start` to `Decided`, calling exactly one collaborator per
//! transition. A failure is tagged with the stage that was being entered.
//! Expected stops (no other sizes, no matches, no results, not larger,
//! placeholder) end in `Outcome::NoLarger`; everything else is an error.

use crate::config::{SearchBackend, UpsizerConfig};
use crate::convert::normalize_to_jpeg;
use crate::corpus::ErrorImageCorpus;
use crate::diagnostics::attach_dump;
use crate::extract::{find_all_sizes_link, find_largest_image_link, find_source_link};
use crate::http::{HttpTransport, SearchTransport};
use crate::inspect::{inspect_file, ImageRecord};
use crate::logs::redact_url_for_log;
use crate::paths::AppPaths;
use crate::render::{CancelToken, ChromeRenderer, PageRenderer};
use crate::select::{select_largest, Candidate};
use crate::upload::{resolve_large_sizes_link, resolve_redirect};
use crate::{Result, UpsizerError};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

const MAX_FILE_STEM_CHARS: usize = 100;
const RESERVED_NAME_RAND_CHARS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Start,
    Uploaded,
    Redirected,
    SourceFound,
    AllSizesFound,
    LargestUrlFound,
    CandidateFetched,
    Decided,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Uploaded => "uploaded",
            Stage::Redirected => "redirected",
            Stage::SourceFound => "source_found",
            Stage::AllSizesFound => "all_sizes_found",
            Stage::LargestUrlFound => "largest_url_found",
            Stage::CandidateFetched => "candidate_fetched",
            Stage::Decided => "decided",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended without a larger image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NoLargerReason {
    NotLarger { candidate_area: u64, original_area: u64 },
    NoOtherSizes,
    NoMatches,
    NoResults,
    PlaceholderRejected,
}

impl NoLargerReason {
    /// Maps the expected "nothing larger" stops; `None` for real failures.
    pub fn from_error(err: &UpsizerError) -> Option<Self> {
        match err.root() {
            UpsizerError::NoOtherSizes => Some(Self::NoOtherSizes),
            UpsizerError::NoMatches => Some(Self::NoMatches),
            UpsizerError::NoResults => Some(Self::NoResults),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotLarger { .. } => "not_larger",
            Self::NoOtherSizes => "no_other_sizes",
            Self::NoMatches => "no_matches",
            Self::NoResults => "no_results",
            Self::PlaceholderRejected => "placeholder_rejected",
        }
    }
}

impl std::fmt::Display for NoLargerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLarger {
                candidate_area,
                original_area,
            } => write!(
                f,
                "candidate area {candidate_area} is not larger than {original_area}"
            ),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Found(T),
    NoLarger(NoLargerReason),
}

impl<T> Outcome<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Outcome::Found(value) => Some(value),
            Outcome::NoLarger(_) => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Outcome::Found(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Found(value) => Outcome::Found(f(value)),
            Outcome::NoLarger(reason) => Outcome::NoLarger(reason),
        }
    }
}

/// A fetched candidate that beat the original, before it is persisted.
struct Discovery {
    original: ImageRecord,
    candidate: ImageRecord,
}

/// Tracks the current stage and tags failures with the stage being entered.
struct StageWalk<'a, F> {
    current: Stage,
    cancel: &'a CancelToken,
    label: &'a str,
    log: &'a mut F,
}

impl<'a, F> StageWalk<'a, F>
where
    F: FnMut(&str, &str, serde_json::Value) -> Result<()>,
{
    fn new(label: &'a str, cancel: &'a CancelToken, log: &'a mut F) -> Self {
        Self {
            current: Stage::Start,
            cancel,
            label,
            log,
        }
    }

    fn enter<T>(&mut self, next: Stage, step: impl FnOnce() -> Result<T>) -> Result<T> {
        debug_assert!(next >= self.current, "stages only move forward");
        self.cancel.check().map_err(|e| e.at(next))?;
        let value = step().map_err(|e| e.at(next))?;
        self.current = next;
        (self.log)(
            "debug",
            "stage_reached",
            serde_json::json!({ "image": self.label, "stage": next.as_str() }),
        )?;
        Ok(value)
    }

    fn note_url(&mut self, event: &str, url: &Url) -> Result<()> {
        (self.log)(
            "debug",
            event,
            serde_json::json!({
                "image": self.label,
                "stage": self.current.as_str(),
                "url": redact_url_for_log(url.as_str()),
            }),
        )
    }
}

/// Runs the discovery pipeline for one image at a time. Cheap to clone;
/// clones share transport, renderer, corpus and cancel flag.
#[derive(Clone)]
pub struct Upsizer {
    paths: AppPaths,
    config: UpsizerConfig,
    transport: Arc<dyn SearchTransport>,
    renderer: Arc<dyn PageRenderer>,
    corpus: ErrorImageCorpus,
    cancel: CancelToken,
}

impl Upsizer {
    pub fn new(
        paths: AppPaths,
        config: UpsizerConfig,
        transport: Arc<dyn SearchTransport>,
        renderer: Arc<dyn PageRenderer>,
        corpus: ErrorImageCorpus,
    ) -> Self {
        Self {
            paths,
            config,
            transport,
            renderer,
            corpus,
            cancel: CancelToken::new(),
        }
    }

    /// Production wiring: HTTP transport, headless Chrome, built-in plus
    /// configured placeholder hashes.
    pub fn from_config(paths: AppPaths, config: UpsizerConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        let corpus = ErrorImageCorpus::load(&paths)?;
        Ok(Self::new(
            paths,
            config,
            transport,
            Arc::new(ChromeRenderer::new()),
            corpus,
        ))
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn config(&self) -> &UpsizerConfig {
        &self.config
    }

    /// Measures the best candidate without writing anything to disk.
    pub fn find_larger<F>(&self, path: &Path, mut log: F) -> Result<Outcome<Candidate>>
    where
        F: FnMut(&str, &str, serde_json::Value) -> Result<()>,
    {
        let discovery = match self.discover(path, &mut log)? {
            Outcome::Found(d) => d,
            Outcome::NoLarger(reason) => return Ok(Outcome::NoLarger(reason)),
        };
        let candidate = discovery.candidate;
        if let Some(bytes) = candidate.bytes() {
            if self.corpus.is_placeholder(bytes) {
                return Ok(Outcome::NoLarger(NoLargerReason::PlaceholderRejected));
            }
        }
        Ok(Outcome::Found(Candidate::new(
            candidate.source_url().to_string(),
            candidate.width(),
            candidate.height(),
        )))
    }

    /// Finds, persists into `out_dir` and normalizes the larger image.
    pub fn get_larger<F>(
        &self,
        path: &Path,
        out_dir: &Path,
        mut log: F,
    ) -> Result<Outcome<ImageRecord>>
    where
        F: FnMut(&str, &str, serde_json::Value) -> Result<()>,
    {
        let label = path.to_string_lossy().to_string();
        let discovery = match self.discover(path, &mut log)? {
            Outcome::Found(d) => d,
            Outcome::NoLarger(reason) => return Ok(Outcome::NoLarger(reason)),
        };
        let source_url = discovery.candidate.source_url().to_string();
        let original_area = discovery.original.area();

        let local_path = reserve_output_path(
            out_dir,
            &clean_file_stem(&source_url),
            discovery.candidate.codec().extension(),
        )
        .map_err(|e| e.at(Stage::Decided))?;
        if let Err(err) = discovery.candidate.persist_to(&local_path) {
            remove_if_present(&local_path);
            return Err(err.at(Stage::Decided));
        }

        let is_placeholder = match self.corpus.is_placeholder_file(&local_path) {
            Ok(flag) => flag,
            Err(err) => {
                remove_if_present(&local_path);
                return Err(err.at(Stage::Decided));
            }
        };
        if is_placeholder {
            std::fs::remove_file(&local_path)
                .map_err(|e| UpsizerError::from(e).at(Stage::Decided))?;
            log(
                "info",
                "placeholder_rejected",
                serde_json::json!({ "image": label, "url": redact_url_for_log(&source_url) }),
            )?;
            return Ok(Outcome::NoLarger(NoLargerReason::PlaceholderRejected));
        }

        let (normalized, from) = match normalize_to_jpeg(&local_path) {
            Ok(done) => done,
            Err(err) => {
                remove_if_present(&local_path);
                remove_if_present(&local_path.with_extension("jpg"));
                return Err(err.at(Stage::Decided));
            }
        };
        let record = match inspect_file(&normalized) {
            Ok(record) => record.with_source_url(&source_url),
            Err(err) => {
                remove_if_present(&normalized);
                return Err(err.at(Stage::Decided));
            }
        };
        log(
            "info",
            "larger_image_saved",
            serde_json::json!({
                "image": label,
                "original_area": original_area,
                "new_area": record.area(),
                "converted_from": from.as_str(),
                "path": normalized.to_string_lossy(),
            }),
        )?;
        Ok(Outcome::Found(record))
    }

    /// Same as `find_larger` for an in-memory image, staged to a temp file
    /// that is removed on every exit path.
    pub fn find_larger_from_bytes<F>(&self, image: &[u8], log: F) -> Result<Outcome<Candidate>>
    where
        F: FnMut(&str, &str, serde_json::Value) -> Result<()>,
    {
        let staged = self.stage_bytes(image)?;
        self.find_larger(staged.path(), log)
    }

    pub fn get_larger_from_bytes<F>(
        &self,
        image: &[u8],
        out_dir: &Path,
        log: F,
    ) -> Result<Outcome<ImageRecord>>
    where
        F: FnMut(&str, &str, serde_json::Value) -> Result<()>,
    {
        let staged = self.stage_bytes(image)?;
        self.get_larger(staged.path(), out_dir, log)
    }

    fn stage_bytes(&self, image: &[u8]) -> Result<tempfile::NamedTempFile> {
        let dir = self.paths.staging_dir();
        std::fs::create_dir_all(&dir)?;
        let mut staged = tempfile::Builder::new()
            .prefix("upsizer-")
            .suffix(".image")
            .tempfile_in(&dir)?;
        staged.write_all(image)?;
        staged.flush()?;
        Ok(staged)
    }

    fn discover<F>(&self, path: &Path, log: &mut F) -> Result<Outcome<Discovery>>
    where
        F: FnMut(&str, &str, serde_json::Value) -> Result<()>,
    {
        let label = path.to_string_lossy().to_string();
        let mut walk = StageWalk::new(&label, &self.cancel, log);

        let original = inspect_file(path).map_err(|e| e.at(Stage::Start))?;
        let walked = match self.config.backend {
            SearchBackend::Rendered => self.walk_rendered(path, &mut walk),
            SearchBackend::Legacy => self.walk_legacy(path, &original, &mut walk),
        };
        let candidate = match walked {
            Ok(Outcome::Found(candidate)) => candidate,
            Ok(Outcome::NoLarger(reason)) => return Ok(Outcome::NoLarger(reason)),
            Err(err) => {
                return match NoLargerReason::from_error(&err) {
                    Some(reason) => Ok(Outcome::NoLarger(reason)),
                    None => Err(err),
                }
            }
        };

        walk.enter(Stage::Decided, || Ok(()))?;
        if candidate.area() > original.area() {
            Ok(Outcome::Found(Discovery {
                original,
                candidate,
            }))
        } else {
            Ok(Outcome::NoLarger(NoLargerReason::NotLarger {
                candidate_area: candidate.area(),
                original_area: original.area(),
            }))
        }
    }

    fn walk_rendered<F>(
        &self,
        path: &Path,
        walk: &mut StageWalk<'_, F>,
    ) -> Result<Outcome<ImageRecord>>
    where
        F: FnMut(&str, &str, serde_json::Value) -> Result<()>,
    {
        let body = walk.enter(Stage::Uploaded, || self.transport.upload(path))?;
        let redirect = walk.enter(Stage::Redirected, || resolve_redirect(&body))?;
        walk.note_url("redirect_resolved", &redirect)?;

        let source = walk.enter(Stage::SourceFound, || {
            self.render_and_extract(&redirect, find_source_link)
        })?;
        let all_sizes = walk.enter(Stage::AllSizesFound, || {
            self.render_and_extract(&source, find_all_sizes_link)
        })?;
        let largest = walk.enter(Stage::LargestUrlFound, || {
            self.render_and_extract(&all_sizes, find_largest_image_link)
        })?;
        walk.note_url("largest_url_found", &largest)?;

        let record = walk.enter(Stage::CandidateFetched, || {
            self.transport.fetch_image(largest.as_str())
        })?;
        Ok(Outcome::Found(record))
    }

    fn walk_legacy<F>(
        &self,
        path: &Path,
        original: &ImageRecord,
        walk: &mut StageWalk<'_, F>,
    ) -> Result<Outcome<ImageRecord>>
    where
        F: FnMut(&str, &str, serde_json::Value) -> Result<()>,
    {
        let body = walk.enter(Stage::Uploaded, || self.transport.upload(path))?;
        let large_sizes = walk.enter(Stage::Redirected, || resolve_large_sizes_link(&body))?;
        walk.note_url("large_sizes_link_found", &large_sizes)?;

        let page = walk.enter(Stage::AllSizesFound, || {
            self.transport.fetch_page(large_sizes.as_str())
        })?;
        let best = walk.enter(Stage::LargestUrlFound, || select_largest(&page))?;

        // The page reports dimensions, so an obviously smaller image is
        // never downloaded.
        if best.is_measured() && best.area <= original.area() {
            walk.enter(Stage::Decided, || Ok(()))?;
            return Ok(Outcome::NoLarger(NoLargerReason::NotLarger {
                candidate_area: best.area,
                original_area: original.area(),
            }));
        }

        let record = walk.enter(Stage::CandidateFetched, || {
            self.transport.fetch_image(&best.url)
        })?;
        Ok(Outcome::Found(record))
    }

    fn render_and_extract(&self, url: &Url, extract: fn(&str) -> Result<Url>) -> Result<Url> {
        let html = self
            .renderer
            .render(url.as_str(), self.config.render_timeout(), &self.cancel)?;
        extract(&html).map_err(|err| attach_dump(err, &self.paths.diagnostics_dir(), &html))
    }
}

/// Stem for a persisted candidate: the last segment of its URL with
/// everything outside `[A-Za-z0-9_]` stripped and capped.
pub fn clean_file_stem(url: &str) -> String {
    let base = url.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    let mut stem: String = base
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .take(MAX_FILE_STEM_CHARS)
        .collect();
    if stem.is_empty() {
        stem.push_str("image");
    }
    stem
}

/// Creates an empty `<stem>_<random>.<extension>` in `dir` and returns its
/// path. Concurrent runs whose candidate URLs share a last segment get
/// distinct files.
fn reserve_output_path(dir: &Path, stem: &str, extension: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let reserved = tempfile::Builder::new()
        .prefix(&format!("{stem}_"))
        .suffix(&format!(".{extension}"))
        .rand_bytes(RESERVED_NAME_RAND_CHARS)
        .tempfile_in(dir)?;
    let (_file, path) = reserved.keep().map_err(|e| UpsizerError::from(e.error))?;
    Ok(path)
}

/// Best-effort cleanup of a partial result; the original error is what
/// gets reported.
fn remove_if_present(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::Start < Stage::Uploaded);
        assert!(Stage::LargestUrlFound < Stage::CandidateFetched);
        assert!(Stage::CandidateFetched < Stage::Decided);
        assert_eq!(Stage::AllSizesFound.to_string(), "all_sizes_found");
    }

    #[test]
    fn clean_file_stem_strips_and_caps() {
        assert_eq!(
            clean_file_stem("https://cdn.example.com/a/b/big-photo.v2.jpg?x=1"),
            "bigphotov2jpgx1"
        );
        let long = format!("https://cdn.example.com/{}", "a".repeat(250));
        assert_eq!(clean_file_stem(&long).len(), 100);
        assert_eq!(clean_file_stem("https://cdn.example.com/"), "cdnexamplecom");
        assert_eq!(clean_file_stem(""), "image");
    }

    #[test]
    fn reserved_paths_are_distinct_for_the_same_stem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = reserve_output_path(dir.path(), "big", "png").expect("first");
        let second = reserve_output_path(dir.path(), "big", "png").expect("second");
        assert_ne!(first, second);
        for path in [&first, &second] {
            assert!(path.exists());
            let name = path.file_name().expect("name").to_string_lossy().to_string();
            assert!(name.starts_with("big_") && name.ends_with(".png"), "{name}");
        }
    }

    #[test]
    fn normal_stops_map_to_reasons_through_stage_wrapping() {
        let err = UpsizerError::NoOtherSizes.at(Stage::AllSizesFound);
        assert_eq!(
            NoLargerReason::from_error(&err),
            Some(NoLargerReason::NoOtherSizes)
        );
        assert_eq!(
            NoLargerReason::from_error(&UpsizerError::CaptchaDetected),
            None
        );
    }

    #[test]
    fn outcome_helpers() {
        let found: Outcome<u32> = Outcome::Found(3);
        assert!(found.is_found());
        assert_eq!(found.map(|v| v * 2).found(), Some(6));
        let none: Outcome<u32> = Outcome::NoLarger(NoLargerReason::NoMatches);
        assert_eq!(none.found(), None);
    }
}
