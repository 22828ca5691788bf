use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("upsizer.json")
    }

    /// Extra placeholder digests, one hex SHA-512 per line.
    pub fn placeholder_hashes_path(&self) -> PathBuf {
        self.config_dir().join("placeholder_hashes.txt")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn run_log_path(&self, run_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{run_id}.jsonl"))
    }

    /// Rendered pages that no extractor could make sense of.
    pub fn diagnostics_dir(&self) -> PathBuf {
        self.base_dir.join("diagnostics")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.base_dir.join("staging")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.diagnostics_dir())?;
        std::fs::create_dir_all(self.staging_dir())?;
        Ok(())
    }

    pub fn default_base_dir() -> PathBuf {
        if let Ok(v) = std::env::var("UPSIZER_BASE_DIR") {
            let t = v.trim();
            if !t.is_empty() {
                return PathBuf::from(t);
            }
        }
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(parent) = exe_path.parent() {
                return parent.join("upsizer_data");
            }
        }
        Path::new(".").join("upsizer_data")
    }
}
