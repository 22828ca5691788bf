use crate::discover::{NoLargerReason, Outcome, Upsizer};
use crate::error::BatchAction;
use crate::inspect::{inspect_file, ImageRecord};
use crate::logs::redact_url_for_log;
use crate::{Result, UpsizerError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::SystemTime;

const INPUT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const MAX_WORKERS: usize = 16;

#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Files or directories; directories are walked recursively.
    pub inputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub workers: usize,
    /// Only files modified at or after this instant are processed.
    pub modified_since: Option<SystemTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub files_found: usize,
    pub upsized: usize,
    pub no_larger: usize,
    pub skipped: usize,
    pub not_attempted: usize,
    pub size_warnings: usize,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub manifest_path: String,
    pub output_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Upsized,
    NoLarger,
    Skipped,
    Halted,
    NotAttempted,
}

/// One manifest row per input file.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub source_path: String,
    pub status: FileStatus,
    pub detail: String,
    pub stage: Option<String>,
    pub original_width: Option<u32>,
    pub original_height: Option<u32>,
    pub original_area: Option<u64>,
    pub new_width: Option<u32>,
    pub new_height: Option<u32>,
    pub new_area: Option<u64>,
    pub area_increase_pct: Option<f64>,
    pub file_size_increase_pct: Option<f64>,
    pub output_path: Option<String>,
    pub source_host: Option<String>,
}

impl FileReport {
    fn new(path: &Path, status: FileStatus, detail: impl Into<String>) -> Self {
        Self {
            source_path: path.to_string_lossy().to_string(),
            status,
            detail: detail.into(),
            stage: None,
            original_width: None,
            original_height: None,
            original_area: None,
            new_width: None,
            new_height: None,
            new_area: None,
            area_increase_pct: None,
            file_size_increase_pct: None,
            output_path: None,
            source_host: None,
        }
    }

    fn with_original(mut self, original: &ImageRecord) -> Self {
        self.original_width = Some(original.width());
        self.original_height = Some(original.height());
        self.original_area = Some(original.area());
        self
    }

    /// The result grew more in bytes than in pixels.
    pub fn has_size_warning(&self) -> bool {
        match (self.area_increase_pct, self.file_size_increase_pct) {
            (Some(area), Some(file)) => file > area,
            _ => false,
        }
    }
}

/// Relative growth in percent; `None` when the baseline is zero.
pub fn increase_pct(before: u64, after: u64) -> Option<f64> {
    if before == 0 {
        return None;
    }
    Some((after as f64 - before as f64) / before as f64 * 100.0)
}

pub fn is_input_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| INPUT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expands files and directories into a sorted, de-duplicated list of image
/// files, optionally keeping only recently modified ones.
pub fn collect_input_files(
    inputs: &[PathBuf],
    modified_since: Option<SystemTime>,
) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for input in inputs {
        let meta = std::fs::metadata(input)?;
        if meta.is_dir() {
            walk_dir(input, &mut out)?;
        } else if is_input_image(input) {
            out.push(input.clone());
        }
    }

    if let Some(since) = modified_since {
        let mut kept = Vec::with_capacity(out.len());
        for path in out {
            let modified = std::fs::metadata(&path)?.modified()?;
            if modified >= since {
                kept.push(path);
            }
        }
        out = kept;
    }

    out.sort();
    out.dedup();
    Ok(out)
}

fn walk_dir(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_dir(&path, out)?;
        } else if file_type.is_file() && is_input_image(&path) {
            out.push(path);
        }
    }
    Ok(())
}

enum WorkerMessage {
    Log {
        level: String,
        event: String,
        data: serde_json::Value,
    },
    Done {
        index: usize,
        report: FileReport,
    },
}

/// Runs the pipeline over every input on `request.workers` threads and
/// writes a CSV manifest. A captcha stops new work for the whole batch;
/// in-flight images finish.
pub fn run_batch<FLog>(
    upsizer: &Upsizer,
    request: &BatchRequest,
    manifest_path: &Path,
    mut log_line: FLog,
) -> Result<BatchSummary>
where
    FLog: FnMut(&str, &str, serde_json::Value) -> Result<()>,
{
    std::fs::create_dir_all(&request.output_dir)?;
    if let Some(parent) = manifest_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let files = collect_input_files(&request.inputs, request.modified_since)?;
    let workers = request.workers.clamp(1, MAX_WORKERS).min(files.len().max(1));
    log_line(
        "info",
        "batch_started",
        serde_json::json!({
            "files": files.len(),
            "workers": workers,
            "output_dir": request.output_dir.to_string_lossy(),
        }),
    )?;

    let next = AtomicUsize::new(0);
    let halted = AtomicBool::new(false);
    let mut reports: Vec<Option<FileReport>> = vec![None; files.len()];
    let mut halt_reason: Option<String> = None;

    std::thread::scope(|scope| -> Result<()> {
        let (tx, rx) = mpsc::channel::<WorkerMessage>();
        for _ in 0..workers {
            let tx = tx.clone();
            let files = &files;
            let next = &next;
            let halted = &halted;
            let output_dir = request.output_dir.as_path();
            scope.spawn(move || loop {
                if halted.load(Ordering::SeqCst) || upsizer.cancel_token().is_canceled() {
                    break;
                }
                let index = next.fetch_add(1, Ordering::SeqCst);
                let Some(path) = files.get(index) else {
                    break;
                };
                let worker_tx = tx.clone();
                let report = process_file(upsizer, path, output_dir, |level, event, data| {
                    let _ = worker_tx.send(WorkerMessage::Log {
                        level: level.to_string(),
                        event: event.to_string(),
                        data,
                    });
                    Ok(())
                });
                if report.status == FileStatus::Halted {
                    halted.store(true, Ordering::SeqCst);
                }
                if tx.send(WorkerMessage::Done { index, report }).is_err() {
                    break;
                }
            });
        }
        drop(tx);

        for message in rx {
            match message {
                WorkerMessage::Log { level, event, data } => log_line(&level, &event, data)?,
                WorkerMessage::Done { index, report } => {
                    if report.status == FileStatus::Halted && halt_reason.is_none() {
                        halt_reason = Some(report.detail.clone());
                        log_line(
                            "error",
                            "batch_halted",
                            serde_json::json!({
                                "path": report.source_path,
                                "reason": report.detail,
                            }),
                        )?;
                    }
                    if let Some(slot) = reports.get_mut(index) {
                        *slot = Some(report);
                    }
                }
            }
        }
        Ok(())
    })?;

    let reports: Vec<FileReport> = reports
        .into_iter()
        .zip(files.iter())
        .map(|(report, path)| {
            report.unwrap_or_else(|| {
                FileReport::new(path, FileStatus::NotAttempted, "batch stopped before this file")
            })
        })
        .collect();

    write_manifest(manifest_path, &reports)?;

    let count = |status: FileStatus| reports.iter().filter(|r| r.status == status).count();
    let size_warnings: Vec<&FileReport> = reports.iter().filter(|r| r.has_size_warning()).collect();
    for report in &size_warnings {
        log_line(
            "warn",
            "upsized_file_grew_more_than_area",
            serde_json::json!({
                "path": report.source_path,
                "original_area": report.original_area,
                "new_area": report.new_area,
                "area_increase_pct": report.area_increase_pct,
                "file_size_increase_pct": report.file_size_increase_pct,
            }),
        )?;
    }

    let summary = BatchSummary {
        files_found: files.len(),
        upsized: count(FileStatus::Upsized),
        no_larger: count(FileStatus::NoLarger),
        skipped: count(FileStatus::Skipped),
        not_attempted: count(FileStatus::NotAttempted),
        size_warnings: size_warnings.len(),
        halted: halt_reason.is_some(),
        halt_reason,
        manifest_path: manifest_path.to_string_lossy().to_string(),
        output_dir: request.output_dir.to_string_lossy().to_string(),
    };
    log_line("info", "batch_finished", serde_json::to_value(&summary)?)?;
    Ok(summary)
}

/// One image: discover, then move the result onto the original's file name.
pub fn process_file<FLog>(
    upsizer: &Upsizer,
    path: &Path,
    output_dir: &Path,
    mut log_line: FLog,
) -> FileReport
where
    FLog: FnMut(&str, &str, serde_json::Value) -> Result<()>,
{
    let original = match inspect_file(path) {
        Ok(record) => record,
        Err(err) => {
            let _ = log_line(
                "warn",
                "image_unreadable",
                serde_json::json!({ "path": path.to_string_lossy(), "error": err.to_string() }),
            );
            return FileReport::new(path, FileStatus::Skipped, err.to_string());
        }
    };

    let outcome = upsizer.get_larger(path, output_dir, &mut log_line);
    let report = match outcome {
        Ok(Outcome::Found(record)) => finish_upsized(path, output_dir, &original, record),
        Ok(Outcome::NoLarger(reason)) => Ok(no_larger_report(path, &original, reason)),
        Err(err) => Ok(error_report(path, &original, &err)),
    };
    let report = report.unwrap_or_else(|err| {
        FileReport::new(path, FileStatus::Skipped, err.to_string()).with_original(&original)
    });

    let (level, event) = match report.status {
        FileStatus::Upsized => ("info", "image_upsized"),
        FileStatus::NoLarger => ("info", "image_no_larger"),
        FileStatus::Halted => ("error", "image_halted_batch"),
        _ => ("warn", "image_skipped"),
    };
    let _ = log_line(
        level,
        event,
        serde_json::json!({
            "path": report.source_path,
            "detail": report.detail,
            "stage": report.stage,
            "original_area": report.original_area,
            "new_area": report.new_area,
            "area_increase_pct": report.area_increase_pct,
            "file_size_increase_pct": report.file_size_increase_pct,
        }),
    );
    report
}

fn finish_upsized(
    path: &Path,
    output_dir: &Path,
    original: &ImageRecord,
    record: ImageRecord,
) -> Result<FileReport> {
    let Some(saved) = record.local_path().map(Path::to_path_buf) else {
        return Err(UpsizerError::Config(
            "larger image was not persisted".to_string(),
        ));
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| saved.file_name().map(|n| n.to_os_string()).unwrap_or_default());
    let target = output_dir.join(file_name);
    if target != saved {
        if let Err(err) = std::fs::rename(&saved, &target) {
            let _ = std::fs::remove_file(&saved);
            return Err(err.into());
        }
    }

    let mut report = FileReport::new(path, FileStatus::Upsized, "larger image saved")
        .with_original(original);
    report.new_width = Some(record.width());
    report.new_height = Some(record.height());
    report.new_area = Some(record.area());
    report.area_increase_pct = increase_pct(original.area(), record.area());
    report.file_size_increase_pct = increase_pct(original.byte_size(), record.byte_size());
    report.output_path = Some(target.to_string_lossy().to_string());
    report.source_host = Some(redact_url_for_log(record.source_url()));
    Ok(report)
}

fn no_larger_report(path: &Path, original: &ImageRecord, reason: NoLargerReason) -> FileReport {
    let mut report =
        FileReport::new(path, FileStatus::NoLarger, reason.to_string()).with_original(original);
    if let NoLargerReason::NotLarger { candidate_area, .. } = reason {
        report.new_area = Some(candidate_area);
    }
    report
}

fn error_report(path: &Path, original: &ImageRecord, err: &UpsizerError) -> FileReport {
    let status = match err.batch_action() {
        BatchAction::ContinueBatch => FileStatus::NoLarger,
        BatchAction::SkipImage => FileStatus::Skipped,
        BatchAction::HaltBatch => FileStatus::Halted,
    };
    let mut report = FileReport::new(path, status, err.to_string()).with_original(original);
    report.stage = err.stage().map(|s| s.to_string());
    report
}

fn write_manifest(path: &Path, reports: &[FileReport]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for report in reports {
        writer.serialize(report)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, b"x").expect("write");
    }

    #[test]
    fn collects_images_recursively_with_case_insensitive_extensions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        touch(&root.join("a.jpg"));
        touch(&root.join("nested/b.PNG"));
        touch(&root.join("nested/deeper/c.webp"));
        touch(&root.join("nested/notes.txt"));
        touch(&root.join("d.JPEG"));
        touch(&root.join("e.gif"));

        let files = collect_input_files(&[root.to_path_buf()], None).expect("collect");
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 4, "{names:?}");
        for expected in ["a.jpg", "b.PNG", "c.webp", "d.JPEG"] {
            assert!(names.contains(&expected.to_string()), "{names:?}");
        }
    }

    #[test]
    fn explicit_files_and_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let img = dir.path().join("one.png");
        touch(&img);
        let files = collect_input_files(&[img.clone(), dir.path().to_path_buf()], None)
            .expect("collect");
        assert_eq!(files, vec![img]);
    }

    #[test]
    fn modified_since_filters_old_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = dir.path().join("old.jpg");
        let fresh = dir.path().join("fresh.jpg");
        touch(&old);
        touch(&fresh);
        let long_ago = SystemTime::now() - Duration::from_secs(30 * 24 * 3600);
        filetime::set_file_mtime(&old, filetime::FileTime::from_system_time(long_ago))
            .expect("set mtime");

        let since = SystemTime::now() - Duration::from_secs(24 * 3600);
        let files = collect_input_files(&[dir.path().to_path_buf()], Some(since)).expect("collect");
        assert_eq!(files, vec![fresh]);
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = collect_input_files(&[dir.path().join("nope")], None).expect_err("missing");
        assert!(matches!(err, UpsizerError::Io(_)), "{err}");
    }

    #[test]
    fn increase_pct_and_size_warning() {
        assert_eq!(increase_pct(480_000, 1_920_000), Some(300.0));
        assert_eq!(increase_pct(0, 10), None);

        let mut report = FileReport::new(Path::new("x.jpg"), FileStatus::Upsized, "ok");
        report.area_increase_pct = Some(300.0);
        report.file_size_increase_pct = Some(700.0);
        assert!(report.has_size_warning());
        report.file_size_increase_pct = Some(120.0);
        assert!(!report.has_size_warning());
    }
}
