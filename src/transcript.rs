/// Runtime transcript: every line the login process prints, timestamped,
/// appended to a log file in the working directory for later debugging.
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};

pub struct Transcript {
    path: PathBuf,
    writer: LineWriter<File>,
}

impl Transcript {
    /// Open the transcript, truncating it unless `append` is set.
    pub fn open(path: &Path, append: bool) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: LineWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one line as `[YYYY-mm-dd HH:MM:SS] line`.
    ///
    /// Failures are logged and otherwise ignored: losing a transcript line
    /// must never interrupt the login.
    pub fn write_line(&mut self, line: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Err(e) = writeln!(self.writer, "[{timestamp}] {line}") {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to write transcript line");
        }
    }
}
