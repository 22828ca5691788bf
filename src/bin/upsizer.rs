use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use upsizer_engine::batch::{run_batch, BatchRequest};
use upsizer_engine::config::{load_config, SearchBackend};
use upsizer_engine::discover::Upsizer;
use upsizer_engine::logs::RunLog;
use upsizer_engine::paths::AppPaths;

const DEFAULT_WORKERS: usize = 1;

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut inputs: Vec<PathBuf> = Vec::new();
    let mut output: Option<PathBuf> = None;
    let mut base_dir: Option<PathBuf> = None;
    let mut workers = DEFAULT_WORKERS;
    let mut modified_within_days: Option<u64> = None;
    let mut backend: Option<SearchBackend> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--input" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--input requires a value".to_string())?;
                inputs.push(PathBuf::from(v));
            }
            "--output" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--output requires a value".to_string())?;
                output = Some(PathBuf::from(v));
            }
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            "--workers" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--workers requires a value".to_string())?;
                workers = v
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| format!("--workers must be a positive integer, got {v}"))?;
            }
            "--modified-within-days" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--modified-within-days requires a value".to_string())?;
                let days = v
                    .parse::<u64>()
                    .map_err(|_| format!("--modified-within-days must be a number, got {v}"))?;
                modified_within_days = Some(days);
            }
            "--backend" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--backend requires a value".to_string())?;
                backend = Some(
                    SearchBackend::parse(v)
                        .ok_or_else(|| format!("unknown backend: {v} (rendered|legacy)"))?,
                );
            }
            other => return Err(format!("unknown arg: {other} (try --help)")),
        }
        i += 1;
    }

    if inputs.is_empty() {
        return Err("at least one --input is required".to_string());
    }
    let output = output.ok_or_else(|| "--output is required".to_string())?;

    let paths = AppPaths::new(base_dir.unwrap_or_else(AppPaths::default_base_dir));
    paths.ensure_dirs().map_err(|e| e.to_string())?;

    let mut config = load_config(&paths).map_err(|e| e.to_string())?;
    if let Some(backend) = backend {
        config.backend = backend;
    }

    let modified_since = modified_within_days.map(|days| {
        SystemTime::now()
            .checked_sub(Duration::from_secs(days.saturating_mul(24 * 3600)))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    });

    let run_id = uuid::Uuid::new_v4().to_string();
    let run_log = RunLog::new(&paths, &run_id);
    let manifest_path = output.join(format!("upsizer_manifest_{run_id}.csv"));

    let upsizer = Upsizer::from_config(paths.clone(), config).map_err(|e| e.to_string())?;

    // SIGINT/SIGTERM stop in-flight images at their next stage or render
    // poll; files not yet started are reported as not attempted.
    let cancel = upsizer.cancel_token().clone();
    ctrlc::set_handler(move || {
        eprintln!("shutting down");
        cancel.cancel();
    })
    .map_err(|e| format!("installing shutdown handler failed: {e}"))?;
    let request = BatchRequest {
        inputs,
        output_dir: output,
        workers,
        modified_since,
    };

    println!("Base dir: {}", paths.base_dir.to_string_lossy());
    println!("Run log: {}", run_log.path().to_string_lossy());

    let summary = run_batch(&upsizer, &request, &manifest_path, |level, event, data| {
        if level == "warn" || level == "error" {
            eprintln!("[{level}] {event}: {data}");
        }
        run_log.log(level, event, data)
    })
    .map_err(|e| e.to_string())?;

    println!(
        "Files: {}  upsized: {}  no larger: {}  skipped: {}  not attempted: {}",
        summary.files_found,
        summary.upsized,
        summary.no_larger,
        summary.skipped,
        summary.not_attempted
    );
    if summary.size_warnings > 0 {
        println!(
            "{} upsized file(s) grew more in bytes than in pixels",
            summary.size_warnings
        );
    }
    println!("Manifest: {}", summary.manifest_path);

    if let Some(reason) = summary.halt_reason {
        return Err(format!("batch halted: {reason}"));
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"upsizer

Looks for a higher-resolution copy of each input image via reverse image search
and saves any genuinely larger result under the original file name.

Usage:
  cargo run --bin upsizer -- --input ./photos --output ./larger
  cargo run --bin upsizer -- --input a.jpg --input b.png --output ./larger --backend legacy

Options:
  --input <path>                 Image file or directory (repeatable; directories are walked)
  --output <dir>                 Where larger images and the CSV manifest are written
  --base-dir <path>              Override data dir (default: $UPSIZER_BASE_DIR or <exe dir>/upsizer_data)
  --workers <n>                  Images processed concurrently (default: 1)
  --modified-within-days <n>     Only process files modified in the last n days
  --backend <rendered|legacy>    Search result flow to drive (default from config)
"#
    );
}
