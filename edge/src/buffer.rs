use crate::publisher::PublishSink;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// How many records to replay between transport keep-alive services during
/// a drain pass.
const KEEPALIVE_EVERY: usize = 25;

/// Durable FIFO queue of undelivered payloads, one `topic TAB json` line
/// per record.
///
/// The file is the unit of truth: it is only removed after a drain pass
/// publishes every line, so an aborted pass replays from the start next
/// time. That trades duplicate delivery for no loss. A record cap bounds
/// growth; beyond it the oldest lines are evicted and counted.
pub struct OfflineBuffer {
    path: PathBuf,
    max_records: usize,
    len: usize,
    dropped: u64,
}

impl OfflineBuffer {
    pub fn open(path: PathBuf, max_records: usize) -> Self {
        let len = match File::open(&path) {
            Ok(file) => BufReader::new(file).lines().count(),
            Err(_) => 0,
        };

        let mut buffer = Self {
            path,
            max_records,
            len,
            dropped: 0,
        };

        // A zero-length file would falsely signal undrained data.
        if buffer.len == 0 && buffer.path.exists() {
            let _ = std::fs::remove_file(&buffer.path);
        }
        if buffer.len > 0 {
            info!(records = buffer.len, "offline buffer has undrained data");
        }

        buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total records lost to eviction, storage failure, or corruption.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Append one record. On storage failure the payload is dropped and the
    /// loss is logged; there is no second buffer behind this one.
    pub fn append(&mut self, topic: &str, json: &str) {
        if self.len >= self.max_records {
            self.evict_oldest(self.len + 1 - self.max_records);
        }

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{topic}\t{json}"));

        match result {
            Ok(()) => {
                self.len += 1;
                debug!(records = self.len, "payload buffered");
            }
            Err(e) => {
                self.dropped += 1;
                warn!(error = %e, dropped = self.dropped, "buffer storage unavailable, payload dropped");
            }
        }
    }

    /// Replay the buffer front-to-back through `sink`. Stops at the first
    /// failed publish, leaving the whole file intact; only a fully
    /// successful pass removes it. Returns whether the pass completed.
    pub async fn drain<S: PublishSink>(&mut self, sink: &mut S) -> std::io::Result<bool> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.len = 0;
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        let mut published = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let Some((topic, json)) = line.split_once('\t') else {
                self.dropped += 1;
                warn!(dropped = self.dropped, "corrupt buffer line skipped");
                continue;
            };

            if !sink.publish(topic, json).await {
                debug!(published, remaining = self.len.saturating_sub(published), "drain stopped at publish failure");
                return Ok(false);
            }
            published += 1;

            // Long passes must not starve the transport session.
            if published % KEEPALIVE_EVERY == 0 {
                sink.service().await;
            }
        }

        std::fs::remove_file(&self.path)?;
        self.len = 0;
        info!(published, "offline buffer drained");
        Ok(true)
    }

    fn evict_oldest(&mut self, count: usize) {
        let lines: Vec<String> = match File::open(&self.path) {
            Ok(file) => BufReader::new(file).lines().map_while(|l| l.ok()).collect(),
            Err(e) => {
                warn!(error = %e, "buffer eviction failed to read file");
                return;
            }
        };

        let kept: Vec<&str> = lines.iter().skip(count).map(String::as_str).collect();
        let mut contents = kept.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }

        match std::fs::write(&self.path, contents) {
            Ok(()) => {
                let evicted = lines.len().saturating_sub(kept.len());
                self.dropped += evicted as u64;
                self.len = kept.len();
                warn!(evicted, dropped = self.dropped, "buffer at capacity, oldest records evicted");
            }
            Err(e) => {
                warn!(error = %e, "buffer eviction failed to rewrite file");
            }
        }
    }
}
