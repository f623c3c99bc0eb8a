//! Message transports
//!
//! The client and the worker only see [`MessageSink`] and [`MessageSource`].
//! Two transports are provided: an in-process channel pair, and newline
//! delimited JSON over any async byte stream (a pipe, a socket, a child
//! process' stdio).

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{mpsc, Mutex};

use crate::inference::engine::EngineError;
use crate::rpc::protocol::WorkerMessage;

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, message: WorkerMessage) -> Result<(), EngineError>;
}

#[async_trait]
pub trait MessageSource: Send {
    /// Next message, or `None` once the peer is gone
    async fn recv(&mut self) -> Option<WorkerMessage>;
}

pub struct ChannelSink {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&self, message: WorkerMessage) -> Result<(), EngineError> {
        self.tx
            .send(message)
            .map_err(|_| EngineError::Channel("peer closed the channel".to_string()))
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&mut self) -> Option<WorkerMessage> {
        self.rx.recv().await
    }
}

/// Two connected endpoints: what one side sends, the other receives
pub fn channel_pair() -> ((ChannelSink, ChannelSource), (ChannelSink, ChannelSource)) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        (ChannelSink { tx: a_tx }, ChannelSource { rx: b_rx }),
        (ChannelSink { tx: b_tx }, ChannelSource { rx: a_rx }),
    )
}

/// Writes one JSON document per line
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSink for JsonLinesSink<W> {
    async fn send(&self, message: WorkerMessage) -> Result<(), EngineError> {
        let mut line = serde_json::to_vec(&message).map_err(|e| EngineError::Channel(e.to_string()))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        let io = async {
            writer.write_all(&line).await?;
            writer.flush().await
        };
        io.await.map_err(|e| EngineError::Channel(e.to_string()))
    }
}

/// Reads one JSON document per line; unparseable lines are skipped
pub struct JsonLinesSource<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MessageSource for JsonLinesSource<R> {
    async fn recv(&mut self) -> Option<WorkerMessage> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str(&line) {
                        Ok(message) => return Some(message),
                        Err(e) => tracing::warn!("Skipping unparseable message: {}", e),
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!("Message stream failed: {}", e);
                    return None;
                }
            }
        }
    }
}

pub fn json_lines<R, W>(reader: R, writer: W) -> (JsonLinesSink<W>, JsonLinesSource<R>)
where
    R: AsyncRead + Unpin,
{
    (JsonLinesSink::new(writer), JsonLinesSource::new(reader))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::EngineRequest;

    #[tokio::test]
    async fn test_channel_pair_is_crossed() {
        let ((left_sink, mut left_source), (right_sink, mut right_source)) = channel_pair();
        left_sink.send(WorkerMessage::Ready).await.unwrap();
        assert_eq!(right_source.recv().await, Some(WorkerMessage::Ready));

        right_sink.send(WorkerMessage::Done { id: 1 }).await.unwrap();
        assert_eq!(left_source.recv().await, Some(WorkerMessage::Done { id: 1 }));

        drop(right_sink);
        assert_eq!(left_source.recv().await, None);
    }

    #[tokio::test]
    async fn test_json_lines_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, _b_write) = tokio::io::split(b);
        let (sink, _) = json_lines(a_read, a_write);
        let mut source = JsonLinesSource::new(b_read);

        let request = WorkerMessage::Request {
            id: 4,
            request: EngineRequest::Heartbeat,
        };
        sink.send(request.clone()).await.unwrap();
        sink.send(WorkerMessage::Ready).await.unwrap();
        assert_eq!(source.recv().await, Some(request));
        assert_eq!(source.recv().await, Some(WorkerMessage::Ready));
    }

    #[tokio::test]
    async fn test_json_lines_skips_garbage() {
        let input: &[u8] = b"not json\n\n{\"kind\": \"ready\"}\n";
        let mut source = JsonLinesSource::new(input);
        assert_eq!(source.recv().await, Some(WorkerMessage::Ready));
        assert_eq!(source.recv().await, None);
    }
}
