// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! `tail -F` over a process log file, exposed as a stream of lines.

use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

const FOLLOW_INTERVAL: Duration = Duration::from_millis(250);
const CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailOptions {
    /// Existing lines to emit before following.
    pub lines: usize,
    /// Keep waiting for appended lines. When false the stream ends at EOF.
    pub follow: bool,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            lines: 10,
            follow: true,
        }
    }
}

/// Lines of a log file. Dropping it stops the background reader.
pub struct LogTail {
    lines: ReceiverStream<String>,
    _guard: DropGuard,
}

impl Stream for LogTail {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        Pin::new(&mut self.lines).poll_next(cx)
    }
}

/// Start following `path`. Cancelling `cancel` or dropping the returned
/// stream ends the reader and closes the file.
pub fn follow(path: PathBuf, options: TailOptions, cancel: CancellationToken) -> LogTail {
    let token = cancel.child_token();
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    spawn_reader(path, options, token.clone(), tx);

    LogTail {
        lines: ReceiverStream::new(rx),
        _guard: token.drop_guard(),
    }
}

/// The background reader. It owns the file and ends when `token` fires.
fn spawn_reader(
    path: PathBuf,
    options: TailOptions,
    token: CancellationToken,
    tx: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => debug!(path = %path.display(), "log follow cancelled"),
            _ = run(&path, options, &tx) => debug!(path = %path.display(), "log follow finished"),
        }
    })
}

struct Reader {
    file: File,
    inode: u64,
    offset: u64,
    pending: Vec<u8>,
}

impl Reader {
    async fn open(path: &Path, follow: bool) -> Option<Reader> {
        let mut announced = false;
        loop {
            match File::open(path).await {
                Ok(file) => {
                    let inode = match file.metadata().await {
                        Ok(meta) => meta.ino(),
                        Err(e) => {
                            warn!(path = %path.display(), "cannot stat log file: {e}");
                            0
                        }
                    };
                    return Some(Reader {
                        file,
                        inode,
                        offset: 0,
                        pending: Vec::new(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if !follow {
                        return None;
                    }
                    if !announced {
                        info!(path = %path.display(), "waiting for log file to appear");
                        announced = true;
                    }
                }
                Err(e) => {
                    if !follow {
                        warn!(path = %path.display(), "cannot open log file: {e}");
                        return None;
                    }
                    debug!(path = %path.display(), "cannot open log file yet: {e}");
                }
            }
            tokio::time::sleep(FOLLOW_INTERVAL).await;
        }
    }

    /// Position the reader so that the last `n` lines come next.
    async fn seek_last_lines(&mut self, n: usize) -> std::io::Result<()> {
        let len = self.file.metadata().await?.len();
        self.offset = if n == 0 {
            len
        } else {
            self.start_of_last_lines(len, n).await?
        };
        self.file.seek(SeekFrom::Start(self.offset)).await?;
        Ok(())
    }

    /// Offset where the last `n` lines begin. An unterminated final line
    /// counts as one of them.
    async fn start_of_last_lines(&mut self, len: u64, n: usize) -> std::io::Result<u64> {
        if len == 0 {
            return Ok(0);
        }
        let mut last = [0u8; 1];
        self.file.seek(SeekFrom::Start(len - 1)).await?;
        self.file.read_exact(&mut last).await?;
        // Newline that ends the line just before the wanted ones.
        let target = if last[0] == b'\n' { n + 1 } else { n };

        let mut newlines = 0;
        let mut end = len;
        let mut chunk = vec![0u8; READ_CHUNK];

        while end > 0 {
            let start = end.saturating_sub(READ_CHUNK as u64);
            let size = (end - start) as usize;
            self.file.seek(SeekFrom::Start(start)).await?;
            self.file.read_exact(&mut chunk[..size]).await?;

            for (i, byte) in chunk[..size].iter().enumerate().rev() {
                if *byte == b'\n' {
                    newlines += 1;
                    if newlines == target {
                        return Ok(start + i as u64 + 1);
                    }
                }
            }
            end = start;
        }
        Ok(0)
    }

    /// Read to EOF and return the complete lines. The trailing partial line
    /// stays buffered.
    async fn read_lines(&mut self) -> std::io::Result<Vec<String>> {
        let mut buf = Vec::new();
        let read = self.file.read_to_end(&mut buf).await?;
        self.offset += read as u64;
        self.pending.extend_from_slice(&buf);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode(&line[..line.len() - 1]));
        }
        Ok(lines)
    }

    fn take_pending(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let line = decode(&self.pending);
            self.pending.clear();
            Some(line)
        }
    }

    /// What happened to the path since the last read.
    async fn check_rotation(&self, path: &Path) -> Rotation {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.ino() != self.inode => Rotation::Replaced,
            Ok(meta) if meta.len() < self.offset => Rotation::Truncated,
            Ok(_) => Rotation::Unchanged,
            Err(_) => Rotation::Replaced,
        }
    }
}

enum Rotation {
    Unchanged,
    Truncated,
    Replaced,
}

fn decode(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

async fn run(path: &Path, options: TailOptions, tx: &mpsc::Sender<String>) {
    let Some(mut reader) = Reader::open(path, options.follow).await else {
        return;
    };
    if let Err(e) = reader.seek_last_lines(options.lines).await {
        warn!(path = %path.display(), "cannot read log file: {e}");
        return;
    }

    loop {
        let lines = match reader.read_lines().await {
            Ok(lines) => lines,
            Err(e) => {
                warn!(path = %path.display(), "cannot read log file: {e}");
                return;
            }
        };
        for line in lines {
            if tx.send(line).await.is_err() {
                return;
            }
        }

        if !options.follow {
            if let Some(line) = reader.take_pending() {
                let _ = tx.send(line).await;
            }
            return;
        }

        tokio::time::sleep(FOLLOW_INTERVAL).await;

        match reader.check_rotation(path).await {
            Rotation::Unchanged => {}
            Rotation::Truncated => {
                info!(path = %path.display(), "log file truncated, reading from start");
                reader.pending.clear();
                reader.offset = 0;
                if let Err(e) = reader.file.seek(SeekFrom::Start(0)).await {
                    warn!(path = %path.display(), "cannot rewind log file: {e}");
                    return;
                }
            }
            Rotation::Replaced => {
                // Drain what the old file still holds before switching.
                if let Ok(lines) = reader.read_lines().await {
                    for line in lines {
                        if tx.send(line).await.is_err() {
                            return;
                        }
                    }
                }
                if let Some(line) = reader.take_pending()
                    && tx.send(line).await.is_err()
                {
                    return;
                }
                info!(path = %path.display(), "log file replaced, reopening");
                let Some(next) = Reader::open(path, true).await else {
                    return;
                };
                reader = next;
            }
        }
    }
}
