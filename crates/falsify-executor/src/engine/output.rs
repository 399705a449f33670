use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt as _};
use tracing::debug;

const READ_CHUNK: usize = 8 * 1024;

/// Keeps the last `limit` bytes written to it.
#[derive(Debug)]
pub struct TailBuffer {
    limit: usize,
    data: VecDeque<u8>,
    dropped: usize,
}

impl TailBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            data: VecDeque::with_capacity(limit.min(READ_CHUNK)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend(bytes);
        let excess = self.data.len().saturating_sub(self.limit);
        if excess > 0 {
            self.data.drain(..excess);
            self.dropped += excess;
        }
    }

    /// Lossy UTF-8 text, prefixed with a marker when bytes were dropped.
    pub fn into_text(mut self) -> String {
        let text = String::from_utf8_lossy(self.data.make_contiguous()).into_owned();
        if self.dropped == 0 {
            text
        } else {
            format!("[... {} bytes truncated ...]\n{text}", self.dropped)
        }
    }
}

/// Read `reader` to EOF, keeping only the tail.
pub async fn capture<R>(reader: Option<R>, limit: usize) -> TailBuffer
where
    R: AsyncRead + Unpin,
{
    let mut buffer = TailBuffer::new(limit);
    let Some(mut reader) = reader else {
        return buffer;
    };

    let mut chunk = vec![0_u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => buffer.push(chunk.get(..read).unwrap_or_default()),
            Err(error) => {
                debug!("Output stream closed with error: {error}");
                break;
            }
        }
    }
    buffer
}
