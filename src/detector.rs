//! External command-detection executable
//!
//! The classifier is a separate program: it receives the utterance as its only
//! argument and prints the detected command tokens (or an error marker) on
//! stdout. Before use the executable can be pinned to a set of SHA-512
//! digests. A run that outlives its timeout is killed.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha512};

use crate::config::DetectorConfig;
use crate::platform::CommandDetector;
use crate::{Error, Result};

/// Pause between two exit checks of a running detector
const WAIT_STEP: Duration = Duration::from_millis(20);

/// Compute the hex SHA-512 digest of a file
///
/// # Errors
///
/// Returns error if the file cannot be read
pub fn file_sha512(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha512::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Outcome of an integrity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    /// No executable configured or not found
    Missing,
    /// No allow-list configured
    Unpinned { digest: String },
    /// Digest is on the allow-list
    Verified { digest: String },
    /// Digest is not on the allow-list
    Mismatch { digest: String },
}

impl Integrity {
    /// Whether the executable may be used
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self, Self::Unpinned { .. } | Self::Verified { .. })
    }
}

/// Command detector backed by an external process
#[derive(Debug, Clone)]
pub struct ProcessDetector {
    command: Option<PathBuf>,
    allowed: Vec<String>,
    timeout: Duration,
}

impl ProcessDetector {
    #[must_use]
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            command: config.command.clone(),
            allowed: config.sha512.iter().map(|d| d.trim().to_lowercase()).collect(),
            timeout: config.timeout,
        }
    }

    /// Configured executable path
    #[must_use]
    pub fn command(&self) -> Option<&Path> {
        self.command.as_deref()
    }

    /// Check the executable against the allow-list
    ///
    /// # Errors
    ///
    /// Returns error if the executable exists but cannot be read
    pub fn verify(&self) -> Result<Integrity> {
        let Some(path) = self.command.as_deref().filter(|p| p.is_file()) else {
            return Ok(Integrity::Missing);
        };

        let digest = file_sha512(path)?;
        if self.allowed.is_empty() {
            return Ok(Integrity::Unpinned { digest });
        }
        if self.allowed.iter().any(|d| *d == digest) {
            Ok(Integrity::Verified { digest })
        } else {
            Ok(Integrity::Mismatch { digest })
        }
    }
}

impl CommandDetector for ProcessDetector {
    fn is_available(&self) -> bool {
        match self.verify() {
            Ok(integrity) => {
                if let Integrity::Mismatch { digest } = &integrity {
                    tracing::warn!(%digest, "command detector digest not on the allow-list");
                }
                integrity.is_usable()
            }
            Err(e) => {
                tracing::warn!(error = %e, "command detector unreadable");
                false
            }
        }
    }

    fn detect(&self, utterance: &str) -> Result<String> {
        let path = self
            .command
            .as_deref()
            .ok_or_else(|| Error::Detection("no detector configured".to_string()))?;

        let mut child = Command::new(path)
            .arg(utterance)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Detection(format!("failed to run {}: {e}", path.display())))?;

        // Pipes are drained while waiting so a chatty detector cannot stall on a full pipe
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            let exited = child
                .try_wait()
                .map_err(|e| Error::Detection(format!("failed to wait for detector: {e}")))?;
            if let Some(status) = exited {
                break status;
            }
            if Instant::now() >= deadline {
                if let Err(e) = child.kill() {
                    tracing::warn!(error = %e, "failed to kill hung detector");
                }
                if let Err(e) = child.wait() {
                    tracing::debug!(error = %e, "failed to reap hung detector");
                }
                tracing::warn!(timeout = ?self.timeout, path = %path.display(), "detector timed out");
                return Err(Error::Detection(format!(
                    "detector timed out after {:?}",
                    self.timeout
                )));
            }
            std::thread::sleep(WAIT_STEP);
        };

        let stdout = collect(stdout);
        if !status.success() {
            let stderr = collect(stderr);
            return Err(Error::Detection(format!(
                "detector exited with {status}: {}",
                String::from_utf8_lossy(&stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            tracing::debug!(error = %e, "detector pipe read failed");
        }
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader.and_then(|h| h.join().ok()).unwrap_or_default()
}
