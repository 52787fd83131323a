use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "mapd_server.log";

/// Append-only server log shared by the tracing layer and the signal handler.
#[derive(Clone)]
pub struct LogFile {
    path: PathBuf,
    writer: Arc<Mutex<BufWriter<File>>>,
    flush_each_record: bool,
}

impl LogFile {
    pub fn create(log_dir: &Path, flush_each_record: bool) -> io::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
            flush_each_record,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }
}

pub struct LogFileWriter<'a> {
    guard: MutexGuard<'a, BufWriter<File>>,
    flush_each_record: bool,
}

impl Write for LogFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

impl Drop for LogFileWriter<'_> {
    fn drop(&mut self) {
        if self.flush_each_record {
            let _ = self.guard.flush();
        }
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter {
            guard: self.writer.lock(),
            flush_each_record: self.flush_each_record,
        }
    }
}

/// Installs the global subscriber: stderr plus `<log_dir>/mapd_server.log`.
///
/// `RUST_LOG` overrides the default `info` filter. If a subscriber is already
/// installed the file is still returned so callers can flush it.
pub fn init(log_dir: &Path, flush_each_record: bool) -> Result<LogFile> {
    let log_file = LogFile::create(log_dir, flush_each_record)
        .with_context(|| format!("Failed to create log file in {}", log_dir.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(log_file.clone()),
        )
        .try_init();

    if installed.is_err() {
        tracing::debug!("Logging already initialized; {} not attached", log_file.path().display());
    }

    Ok(log_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = LogFile::create(&dir.path().join("mapd_log"), true).unwrap();

        {
            let mut writer = log_file.make_writer();
            writer.write_all(b"started\n").unwrap();
        }

        let contents = std::fs::read_to_string(log_file.path()).unwrap();
        assert_eq!(contents, "started\n");
    }

    #[test]
    fn buffered_records_appear_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = LogFile::create(dir.path(), false).unwrap();

        {
            let mut writer = log_file.make_writer();
            writer.write_all(b"buffered\n").unwrap();
        }
        assert_eq!(std::fs::read_to_string(log_file.path()).unwrap(), "");

        log_file.flush().unwrap();
        assert_eq!(std::fs::read_to_string(log_file.path()).unwrap(), "buffered\n");
    }
}
