//! Append-only link log backing the file-based repository.
//!
//! One JSON object per line:
//!
//! ```text
//! {"id":1,"short_url":"aB3dE5gH","original_url":"https://ya.ru","owner_id":"u1","deleted":false}
//! ```
//!
//! `owner_id` and `deleted` are optional on read. A deletion is recorded
//! as a second line repeating the record with `"deleted": true`.
//!
//! Only newline-terminated lines are committed. An unparsable last line
//! without a newline is a write that never finished; it is cut off on open
//! and before every append instead of poisoning the next replay.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LinkLogError {
    #[error("link log io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("link log line {line} is malformed: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("link log line {line}: duplicate short code {code}")]
    DuplicateCode { line: usize, code: String },
    #[error("link log line {line}: duplicate original url {url}")]
    DuplicateUrl { line: usize, url: String },
    #[error("failed to encode link log entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A single line of the link log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub short_url: String,
    pub original_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

/// Writer half of the link log. Entries are flushed before `append` returns.
#[derive(Debug)]
pub struct LinkLog {
    path: PathBuf,
    file: File,
    /// Length of the file up to the last committed line.
    committed: u64,
}

impl LinkLog {
    /// Opens (or creates) the log at `path` and returns it together with
    /// every entry already written, in file order.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<LogEntry>), LinkLogError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| LinkLogError::Io {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        let mut entries = Vec::new();
        let mut committed = 0u64;
        let mut unterminated = false;
        let mut reader = BufReader::new(&file);
        let mut line = Vec::new();
        let mut line_no = 0;
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line).map_err(io_err)?;
            if read == 0 {
                break;
            }
            line_no += 1;
            let terminated = line.last() == Some(&b'\n');

            if line.iter().all(u8::is_ascii_whitespace) {
                committed += read as u64;
                continue;
            }
            match serde_json::from_slice::<LogEntry>(&line) {
                Ok(entry) => {
                    entries.push(entry);
                    committed += read as u64;
                    unterminated = !terminated;
                }
                Err(e) if !terminated => {
                    warn!(
                        path = %path.display(),
                        line = line_no,
                        bytes = read,
                        error = %e,
                        "dropping torn last line of link log"
                    );
                    break;
                }
                Err(e) => {
                    return Err(LinkLogError::Malformed {
                        line: line_no,
                        reason: e.to_string(),
                    })
                }
            }
        }
        drop(reader);

        let len = file.metadata().map_err(io_err)?.len();
        if len > committed {
            file.set_len(committed).map_err(io_err)?;
        }
        if unterminated {
            // A complete last entry missing only its newline; terminate it so
            // the next append starts on a line of its own.
            file.write_all(b"\n").map_err(io_err)?;
            committed += 1;
        }

        info!(path = %path.display(), entries = entries.len(), "opened link log");

        Ok((
            Self {
                path,
                file,
                committed,
            },
            entries,
        ))
    }

    /// Appends entries with a single write so a batch lands as a unit.
    ///
    /// Bytes past the last committed line are cut off first, and a failed
    /// write is cut back off, so a partial batch never prefixes the next one.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<(), LinkLogError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        self.discard_uncommitted()?;
        if let Err(source) = self.file.write_all(&buf).and_then(|()| self.file.flush()) {
            if let Err(err) = self.file.set_len(self.committed) {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to cut partial link log write, next append retries"
                );
            }
            return Err(self.io_error(source));
        }

        self.committed += buf.len() as u64;
        Ok(())
    }

    fn discard_uncommitted(&mut self) -> Result<(), LinkLogError> {
        let len = self
            .file
            .metadata()
            .map_err(|source| self.io_error(source))?
            .len();
        if len > self.committed {
            warn!(
                path = %self.path.display(),
                bytes = len - self.committed,
                "dropping uncommitted link log tail"
            );
            self.file
                .set_len(self.committed)
                .map_err(|source| self.io_error(source))?;
        }
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> LinkLogError {
        LinkLogError::Io {
            path: self.path.clone(),
            source,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
