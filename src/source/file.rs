//! JSON-lines change log on local disk.
//!
//! Every newline-terminated line is one committed entry:
//! ```text
//! {"kind":"schema","position":1,"schema":{"table":"users","primary_key":["id"]}}
//! {"kind":"change","position":2,"table":"users","operation":"insert","after":{"id":1},"commit_timestamp":"2024-04-01T10:00:00Z"}
//! {"kind":"truncated","through":1}
//! ```
//! A trailing line without a newline is still being written and is ignored.
//! The `truncated` line is written by whatever rotates the log and records
//! the highest discarded position.
use std::{io::SeekFrom, path::PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    sync::Mutex,
};

use super::{ChangeLog, LogBounds, LogEntry};
use crate::{
    error::{RelayError, Result},
    model::SourcePosition,
};

#[derive(Deserialize)]
#[serde(untagged)]
enum Line {
    Truncated(Truncated),
    Entry(LogEntry),
}

#[derive(Deserialize)]
struct Truncated {
    #[allow(dead_code)]
    kind: TruncatedKind,
    through: SourcePosition,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum TruncatedKind {
    Truncated,
}

#[derive(Default)]
struct Tail {
    /// bytes of the file consumed so far, always at a line boundary
    consumed: u64,
    entries: Vec<LogEntry>,
    truncated_through: Option<SourcePosition>,
    last_position: Option<SourcePosition>,
}

pub struct FileChangeLog {
    name: String,
    path: PathBuf,
    tail: Mutex<Tail>,
}

impl FileChangeLog {
    pub fn new(name: &str, path: &str) -> FileChangeLog {
        FileChangeLog {
            name: name.to_owned(),
            path: PathBuf::from(path),
            tail: Mutex::new(Tail::default()),
        }
    }

    async fn refresh(&self, tail: &mut Tail) -> Result<()> {
        let unavailable =
            |e: std::io::Error| RelayError::SourceUnavailable(format!("{}: {e}", self.path.display()));
        let mut file = tokio::fs::File::open(&self.path).await.map_err(unavailable)?;
        let len = file.metadata().await.map_err(unavailable)?.len();
        if len < tail.consumed {
            // log was rewritten from scratch, start over
            *tail = Tail::default();
        }
        file.seek(SeekFrom::Start(tail.consumed))
            .await
            .map_err(unavailable)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.map_err(unavailable)?;

        let Some(end) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(());
        };
        for raw in buf[..end].split(|b| *b == b'\n') {
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let line: Line = serde_json::from_slice(raw).map_err(|e| {
                RelayError::Encoding(format!("{}: malformed log line: {e}", self.path.display()))
            })?;
            match line {
                Line::Truncated(t) => {
                    tail.truncated_through = tail.truncated_through.max(Some(t.through));
                    tail.entries.retain(|e| e.position() > t.through);
                }
                Line::Entry(entry) => {
                    tail.last_position = tail.last_position.max(Some(entry.position()));
                    tail.entries.push(entry);
                }
            }
        }
        tail.consumed += end as u64 + 1;
        Ok(())
    }
}

#[async_trait]
impl ChangeLog for FileChangeLog {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    async fn bounds(&self) -> Result<LogBounds> {
        let mut tail = self.tail.lock().await;
        self.refresh(&mut tail).await?;
        Ok(LogBounds {
            truncated_through: tail.truncated_through,
            committed_through: tail.last_position,
        })
    }

    async fn fetch(
        &self,
        after: Option<SourcePosition>,
        up_to: SourcePosition,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut tail = self.tail.lock().await;
        if let Some(after) = after {
            // everything at or below `after` has been captured for good
            tail.entries.retain(|e| e.position() > after);
        }
        Ok(tail
            .entries
            .iter()
            .filter(|e| e.position() <= up_to)
            .take(limit)
            .cloned()
            .collect())
    }
}
