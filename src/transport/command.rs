// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, Instant, timeout, timeout_at};
use tracing::{debug, warn};

use crate::error::{DaikinError, Result, TransportReason};
use crate::protocol::{Decoded, Frame, FrameBuffer, FrameCodec};

const READ_CHUNK: usize = 1024;

/// Request/response exchange over one TCP stream.
///
/// Sequence numbers cycle 1..=255. Replies carrying any other sequence
/// number than the outstanding request's are discarded.
pub struct RequestEngine {
    stream: TcpStream,
    codec: FrameCodec,
    buffer: FrameBuffer,
    sequence_id: u8,
    timeout: Duration,
    closed: bool,
}

impl RequestEngine {
    pub fn new(stream: TcpStream, codec: FrameCodec, timeout: Duration) -> Self {
        Self {
            stream,
            codec,
            buffer: FrameBuffer::new(),
            sequence_id: 0,
            timeout,
            closed: false,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Advance the sequence ID (wraps 255 → 1).
    fn next_sequence_id(&mut self) -> u8 {
        self.sequence_id = if self.sequence_id == u8::MAX {
            1
        } else {
            self.sequence_id + 1
        };
        self.sequence_id
    }

    /// Send `frame` and wait for the reply with the same sequence number.
    pub async fn request(&mut self, frame: &Frame) -> Result<Frame> {
        if self.closed {
            return Err(DaikinError::transport(
                TransportReason::Disconnected,
                "session closed",
            ));
        }

        let seq = self.next_sequence_id();
        let wire = self.codec.encode(frame, seq)?;
        debug!("Sending {:?} (seq {}, {} bytes)", frame.kind(), seq, wire.len());

        let deadline = Instant::now() + self.timeout;
        match timeout(self.timeout, self.stream.write_all(&wire)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.closed = true;
                return Err(DaikinError::transport(
                    TransportReason::Disconnected,
                    format!("write failed: {}", e),
                ));
            }
            Err(_) => {
                return Err(DaikinError::transport(
                    TransportReason::Timeout,
                    format!("write of seq {} timed out", seq),
                ));
            }
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            while let Some(raw) = self.next_buffered()? {
                let Decoded {
                    seq: reply_seq,
                    frame: reply,
                } = self.codec.decode(&raw)?;
                if reply_seq == seq {
                    debug!("Received {:?} (seq {})", reply.kind(), reply_seq);
                    return Ok(reply);
                }
                debug!("Discarding stale reply seq {} (expected {})", reply_seq, seq);
            }

            let n = match timeout_at(deadline, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    self.closed = true;
                    return Err(DaikinError::transport(
                        TransportReason::Disconnected,
                        "connection closed by device",
                    ));
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    self.closed = true;
                    return Err(DaikinError::transport(
                        TransportReason::Disconnected,
                        format!("read failed: {}", e),
                    ));
                }
                Err(_) => {
                    return Err(DaikinError::transport(
                        TransportReason::Timeout,
                        format!("no reply to seq {}", seq),
                    ));
                }
            };
            self.buffer.extend(&chunk[..n]);
        }
    }

    fn next_buffered(&mut self) -> Result<Option<Vec<u8>>> {
        self.buffer.next_frame().map_err(|e| {
            warn!("Dropping receive buffer: {}", e);
            DaikinError::transport(TransportReason::ProtocolViolation, e.to_string())
        })
    }

    /// Shut the stream down. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.buffer.clear();
        if let Err(e) = self.stream.shutdown().await {
            debug!("Socket shutdown: {}", e);
        }
    }
}
