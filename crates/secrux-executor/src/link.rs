//! Framed gateway link: serialised writes, framed reads, log chunking.
//!
//! All frames share one connection. Writes go through [`MessageSender`],
//! which holds the write half behind a mutex so no two frames ever
//! interleave their bytes. Reads go through [`FrameReader`], owned by the
//! session read loop.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

use secrux_core::protocol::{
    check_frame_length, decode_frame, encode_frame, LogChunk, LogStream, Outbound,
    FRAME_HEADER_LEN, LOG_CHUNK_SIZE,
};

/// Write half of the gateway link. Cheap to clone via `Arc`.
pub struct MessageSender {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl MessageSender {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Serialise and write one frame. The full frame is written under the
    /// lock; a partial write breaks the link and is returned as an error.
    pub async fn send(&self, message: &Outbound) -> Result<()> {
        let frame = encode_frame(message).context("encoding frame")?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await.context("writing frame")?;
        writer.flush().await.context("flushing frame")?;
        Ok(())
    }
}

/// Read half of the gateway link.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read one length-prefixed frame and parse its JSON body.
    pub async fn read_frame(&mut self) -> Result<serde_json::Value> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.reader
            .read_exact(&mut header)
            .await
            .context("reading frame header")?;
        let length = check_frame_length(u32::from_be_bytes(header))?;
        let mut body = vec![0u8; length];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;
        Ok(decode_frame(&body)?)
    }
}

/// Emits ordered log chunks for one task. The sequence counter is shared by
/// both streams so their chunks are totally ordered.
pub struct LogStreamer {
    sender: Arc<MessageSender>,
    task_id: String,
    stage_id: Option<String>,
    stage_type: Option<String>,
    sequence: AtomicI64,
}

impl LogStreamer {
    pub fn new(
        sender: Arc<MessageSender>,
        task_id: &str,
        stage_id: &str,
        stage_type: &str,
    ) -> Self {
        let optional = |v: &str| (!v.is_empty()).then(|| v.to_string());
        Self {
            sender,
            task_id: task_id.to_string(),
            stage_id: optional(stage_id),
            stage_type: optional(stage_type),
            sequence: AtomicI64::new(0),
        }
    }

    /// Send one chunk. Empty non-final chunks are suppressed.
    pub async fn send(&self, stream: LogStream, content: String, is_last: bool) {
        if !is_last && content.is_empty() {
            return;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let chunk = Outbound::LogChunk(LogChunk {
            task_id: self.task_id.clone(),
            stage_id: self.stage_id.clone(),
            stage_type: self.stage_type.clone(),
            sequence,
            stream,
            content,
            is_last,
        });
        if let Err(error) = self.sender.send(&chunk).await {
            warn!(task_id = %self.task_id, error = %error, "failed to send log chunk");
        }
    }
}

/// Accumulates bytes for one stream and flushes fixed-size chunks.
///
/// Every write flushes as many full [`LOG_CHUNK_SIZE`] slices as the buffer
/// holds. Closing flushes the remainder and then emits one empty final chunk.
pub struct ChunkWriter {
    streamer: Arc<LogStreamer>,
    stream: LogStream,
    buf: Vec<u8>,
    closed: bool,
}

impl ChunkWriter {
    pub fn new(streamer: Arc<LogStreamer>, stream: LogStream) -> Self {
        Self {
            streamer,
            stream,
            buf: Vec::with_capacity(LOG_CHUNK_SIZE),
            closed: false,
        }
    }

    pub async fn write(&mut self, data: &[u8]) {
        if self.closed || data.is_empty() {
            return;
        }
        self.buf.extend_from_slice(data);
        while self.buf.len() >= LOG_CHUNK_SIZE {
            let rest = self.buf.split_off(LOG_CHUNK_SIZE);
            let chunk = std::mem::replace(&mut self.buf, rest);
            self.streamer
                .send(self.stream, String::from_utf8_lossy(&chunk).into_owned(), false)
                .await;
        }
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.buf.is_empty() {
            let chunk = std::mem::take(&mut self.buf);
            self.streamer
                .send(self.stream, String::from_utf8_lossy(&chunk).into_owned(), false)
                .await;
        }
        self.streamer.send(self.stream, String::new(), true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrux_core::protocol::MAX_FRAME_BYTES;

    /// Collects every frame written to an in-memory pipe.
    async fn read_all_frames(data: Vec<u8>) -> Vec<serde_json::Value> {
        let mut reader = FrameReader::new(std::io::Cursor::new(data));
        let mut frames = Vec::new();
        while let Ok(frame) = reader.read_frame().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_send_and_read_roundtrip() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let sender = MessageSender::new(client);
        let message = Outbound::Register(secrux_core::protocol::Register {
            token: "t".into(),
            host: "h".into(),
        });
        sender.send(&message).await.unwrap();
        drop(sender);

        let mut reader = FrameReader::new(server);
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame["type"], "register");
        assert_eq!(frame["host"], "h");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut reader = FrameReader::new(std::io::Cursor::new(data));
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let data = vec![0u8; 4];
        let mut reader = FrameReader::new(std::io::Cursor::new(data));
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_sends_never_interleave() {
        let (client, mut server) = tokio::io::duplex(1024 * 1024);
        let sender = Arc::new(MessageSender::new(client));

        let mut handles = Vec::new();
        for i in 0..16 {
            let sender = Arc::clone(&sender);
            handles.push(tokio::spawn(async move {
                let message = Outbound::Register(secrux_core::protocol::Register {
                    token: format!("token-{i}").repeat(64),
                    host: format!("host-{i}"),
                });
                sender.send(&message).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        drop(sender);

        let mut data = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut data)
            .await
            .unwrap();
        // Every frame parses cleanly back out of the byte stream.
        let frames = read_all_frames(data).await;
        assert_eq!(frames.len(), 16);
        for frame in frames {
            assert_eq!(frame["type"], "register");
        }
    }

    #[tokio::test]
    async fn test_chunk_writer_slices_and_terminates() {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let sender = Arc::new(MessageSender::new(client));
        let streamer = Arc::new(LogStreamer::new(sender, "t1", "s1", "sast"));

        let mut stdout = ChunkWriter::new(Arc::clone(&streamer), LogStream::Stdout);
        let mut stderr = ChunkWriter::new(Arc::clone(&streamer), LogStream::Stderr);
        stdout.write(&vec![b'a'; LOG_CHUNK_SIZE + 100]).await;
        stderr.write(b"oops").await;
        stdout.close().await;
        stderr.close().await;
        drop((stdout, stderr, streamer));

        let mut reader = FrameReader::new(server);
        let mut sequences = Vec::new();
        let mut last_per_stream = std::collections::HashMap::new();
        for _ in 0..5 {
            let frame = reader.read_frame().await.unwrap();
            assert_eq!(frame["type"], "log_chunk");
            sequences.push(frame["sequence"].as_i64().unwrap());
            if frame["isLast"].as_bool().unwrap() {
                *last_per_stream
                    .entry(frame["stream"].as_str().unwrap().to_string())
                    .or_insert(0) += 1;
            }
        }
        // First stdout chunk is exactly one full slice.
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(last_per_stream.get("stdout"), Some(&1));
        assert_eq!(last_per_stream.get("stderr"), Some(&1));
    }

    #[tokio::test]
    async fn test_chunk_writer_suppresses_empty_chunks() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let sender = Arc::new(MessageSender::new(client));
        let streamer = Arc::new(LogStreamer::new(sender, "t1", "", ""));

        let mut writer = ChunkWriter::new(Arc::clone(&streamer), LogStream::Stdout);
        writer.write(b"").await;
        writer.close().await;
        drop((writer, streamer));

        let mut reader = FrameReader::new(server);
        let frame = reader.read_frame().await.unwrap();
        // Only the final marker goes out: empty content, isLast set.
        assert_eq!(frame["content"], "");
        assert_eq!(frame["isLast"], true);
        assert!(frame.get("stageId").is_none());
        assert!(reader.read_frame().await.is_err());
    }
}
