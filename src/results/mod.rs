//! Per-run result artifacts.
//!
//! Layout under the tests root:
//! `<root>/<username>/results_<id>.csv` and `<root>/<username>/config_<id>.json`.
//! Rows are flushed as they are appended, so a crash loses at most the row
//! being written and never corrupts earlier ones.
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

/// Header for rows streamed by the test controller
pub const STREAM_COLUMNS: [&str; 4] = ["iteration", "snr", "ber", "fer"];
/// Header for the one-shot simulated result set
pub const SIMULATED_COLUMNS: [&str; 3] = ["SNR", "BER", "FER"];

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Results sink already closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SinkError>;

pub fn user_dir(root: &Path, username: &str) -> PathBuf {
    root.join(username)
}

pub fn results_path(root: &Path, username: &str, test_id: u64) -> PathBuf {
    user_dir(root, username).join(format!("results_{}.csv", test_id))
}

pub fn config_path(root: &Path, username: &str, test_id: u64) -> PathBuf {
    user_dir(root, username).join(format!("config_{}.json", test_id))
}

/// Submitted parameters, kept next to the results for traceability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub test_id: u64,
    pub chip_id: String,
    pub snr_range: String,
    pub batch_size: u32,
}

pub fn write_run_config(root: &Path, username: &str, config: &RunConfig) -> Result<PathBuf> {
    fs::create_dir_all(user_dir(root, username))?;
    let path = config_path(root, username, config.test_id);
    let json = serde_json::to_string_pretty(config)?;
    fs::write(&path, json)?;
    Ok(path)
}

pub fn read_run_config(path: &Path) -> Result<RunConfig> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

/// Append-only CSV artifact owned by one test run
pub struct ResultsSink {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows_written: u64,
}

impl ResultsSink {
    /// Create (or truncate) the results file for a run. The user directory is
    /// created if missing; calling this repeatedly is safe.
    pub fn open(root: &Path, username: &str, test_id: u64) -> Result<Self> {
        fs::create_dir_all(user_dir(root, username))?;
        let path = results_path(root, username, test_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        log::debug!("Results for test {} will be written to '{}'", test_id, path.display());
        Ok(Self {
            path,
            writer: Some(csv::Writer::from_writer(file)),
            rows_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn write_header<I, T>(&mut self, columns: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        writer.write_record(columns)?;
        writer.flush()?;
        Ok(())
    }

    pub fn append_row<I, T>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        writer.write_record(values)?;
        writer.flush()?;
        self.rows_written += 1;
        Ok(())
    }

    /// Flush and release the file, returning its path. Partial content is kept.
    pub fn close(&mut self) -> Result<PathBuf> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            let file = writer.into_inner().map_err(|e| SinkError::Io(e.into_error()))?;
            file.sync_all()?;
        }
        Ok(self.path.clone())
    }
}

impl Drop for ResultsSink {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                log::warn!("Failed to flush '{}' on drop: {}", self.path.display(), e);
            }
        }
    }
}
