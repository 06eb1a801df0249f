//! Per-applet append-only run log.
//!
//! A unit's failures happen asynchronously inside its own task, so they
//! cannot be returned to the authoring caller; they are appended to
//! `<dir>/<applet-id>.log` instead, where the authoring layer can serve them
//! back to the user. Structured `tracing` events are emitted alongside.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

pub struct RunLog {
    applet_id: Uuid,
    writer: Option<Mutex<BufWriter<File>>>,
}

impl RunLog {
    /// Opens (appending) the applet's log file under `dir`, creating the
    /// directory if needed.
    pub fn open<P: AsRef<Path>>(dir: P, applet_id: Uuid) -> Result<Self> {
        std::fs::create_dir_all(&dir).context("Failed to create log directory")?;
        let path = dir.as_ref().join(format!("{}.log", applet_id));
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("Failed to open run log {}", path.display()))?;

        Ok(Self {
            applet_id,
            writer: Some(Mutex::new(BufWriter::new(file))),
        })
    }

    /// A log that only emits tracing events, with no backing file.
    pub fn sink(applet_id: Uuid) -> Self {
        Self {
            applet_id,
            writer: None,
        }
    }

    pub fn info(&self, message: &str) {
        info!(applet_id = %self.applet_id, "{}", message);
        self.append("INFO", message);
    }

    /// Per-cycle chatter: appended to the file but kept out of the info-level
    /// tracing stream.
    pub fn debug(&self, message: &str) {
        tracing::debug!(applet_id = %self.applet_id, "{}", message);
        self.append("INFO", message);
    }

    pub fn error(&self, message: &str) {
        error!(applet_id = %self.applet_id, "{}", message);
        self.append("ERROR", message);
    }

    fn append(&self, level: &str, message: &str) {
        let Some(writer) = &self.writer else {
            return;
        };
        let line = format!("{} [{}] {}\n", Utc::now().to_rfc3339(), level, message);
        let mut writer = writer.lock().unwrap();
        // A full disk must not take the unit down with it
        let _ = writer.write_all(line.as_bytes());
        let _ = writer.flush();
    }
}
