//! Tracing subscriber setup.
//!
//! Logs go to stderr unless a directory is configured, in which case each
//! start rotates `cowork-runtime.log` (keeping three previous files) and
//! writes through a line-flushing writer so nothing is lost on a crash.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "cowork_runtime=info,warn";
const LOG_FILE_NAME: &str = "cowork-runtime.log";
const ROTATED_LOGS_KEPT: u32 = 3;

/// The `logging:` section of the runtime config.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub filter: String,
    /// One JSON object per line instead of human-readable text.
    pub json: bool,
    /// Write to `<directory>/cowork-runtime.log` instead of stderr.
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            json: false,
            directory: None,
        }
    }
}

impl LoggingConfig {
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Install the global subscriber.
///
/// Returns the log file path when logging to a file. Fails if the log file
/// cannot be opened or a global subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<Option<PathBuf>> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_target(true)
        .with_thread_ids(false);

    let log_path = match config.directory {
        Some(ref dir) => {
            let dir = PathBuf::from(dir);
            std::fs::create_dir_all(&dir)?;
            let log_path = dir.join(LOG_FILE_NAME);
            rotate_log_file(&log_path, ROTATED_LOGS_KEPT);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;
            let writer = FlushingWriter::new(file);
            let builder = builder.with_writer(writer).with_ansi(false);
            let installed = if config.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
            Some(log_path)
        }
        None => {
            let builder = builder.with_writer(std::io::stderr);
            let installed = if config.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
            None
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path,
        pid = std::process::id(),
        "cowork runtime logging initialized"
    );
    Ok(log_path)
}

/// Shift `name.log` → `name.log.1` → … → `name.log.{keep}`, dropping the oldest.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let numbered = |i: u32| PathBuf::from(format!("{}.{i}", base_path.display()));

    let _ = std::fs::remove_file(numbered(keep));
    for i in (1..keep).rev() {
        let _ = std::fs::rename(numbered(i), numbered(i + 1));
    }
    if base_path.exists() {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// File writer that flushes after every write.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn lock(&self) -> std::io::Result<std::sync::MutexGuard<'_, std::fs::File>> {
        self.file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.lock()?;
        let n = file.write(buf)?;
        file.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.lock()?.flush()
    }
}

impl<'a> MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.filter, "cowork_runtime=info,warn");
        assert!(!config.json);
        assert!(config.directory.is_none());
    }

    #[test]
    fn test_rotation_keeps_three() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);

        for generation in 0..5 {
            rotate_log_file(&base, 3);
            std::fs::write(&base, format!("gen {generation}")).unwrap();
        }

        let read = |suffix: &str| std::fs::read_to_string(format!("{}{suffix}", base.display())).ok();
        assert_eq!(read("").as_deref(), Some("gen 4"));
        assert_eq!(read(".1").as_deref(), Some("gen 3"));
        assert_eq!(read(".3").as_deref(), Some("gen 1"));
        assert!(read(".4").is_none());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);

        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }
}
