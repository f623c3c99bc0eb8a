//! Client side of the RPC channel
//!
//! [`EngineClient`] implements [`ChatEngine`] by posting requests to a
//! worker. Requests posted before the worker is ready are queued and sent in
//! order once it announces itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::inference::engine::{ChatEngine, ChatResponse, ChunkStream, EngineError};
use crate::rpc::protocol::{EngineRequest, RequestId, ResponsePayload, WorkerMessage};
use crate::rpc::transport::{MessageSink, MessageSource};
use crate::storage::artifact_cache::ArtifactKind;
use crate::types::config::ChatOptions;
use crate::types::openai::{ChatCompletionChunk, ChatCompletionRequest};
use crate::types::progress::{ProgressCallback, ProgressReport};

enum Pending {
    Unary(oneshot::Sender<Result<ResponsePayload, EngineError>>),
    Stream(mpsc::UnboundedSender<Result<ChatCompletionChunk, EngineError>>),
}

impl Pending {
    fn fail(self, error: EngineError) {
        match self {
            Pending::Unary(tx) => {
                let _ = tx.send(Err(error));
            }
            Pending::Stream(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

#[derive(Default)]
struct Outgoing {
    ready: bool,
    closed: bool,
    queued: Vec<WorkerMessage>,
}

struct Shared {
    sink: Box<dyn MessageSink>,
    pending: DashMap<RequestId, Pending>,
    outgoing: Mutex<Outgoing>,
    progress: RwLock<Option<ProgressCallback>>,
}

impl Shared {
    fn fail_pending(&self, reason: &str) {
        let ids: Vec<RequestId> = self.pending.iter().map(|p| *p.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                pending.fail(EngineError::Channel(reason.to_string()));
            }
        }
    }

    fn on_progress(&self, report: ProgressReport) {
        let callback = match self.progress.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(callback) = callback {
            callback(report);
        }
    }

    async fn on_ready(&self) {
        let mut outgoing = self.outgoing.lock().await;
        if outgoing.ready {
            return;
        }
        outgoing.ready = true;
        let queued = std::mem::take(&mut outgoing.queued);
        tracing::debug!("Worker ready; sending {} queued requests", queued.len());
        for message in queued {
            let id = match &message {
                WorkerMessage::Request { id, .. } => Some(*id),
                _ => None,
            };
            if let Err(e) = self.sink.send(message).await {
                if let Some((_, pending)) = id.and_then(|id| self.pending.remove(&id)) {
                    pending.fail(e);
                }
            }
        }
    }

    fn on_message(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::Response { id, result } => match self.pending.remove(&id) {
                Some((_, Pending::Unary(tx))) => {
                    let _ = tx.send(Ok(result));
                }
                Some((_, Pending::Stream(tx))) => {
                    let _ = tx.send(Err(EngineError::Channel("expected a stream".to_string())));
                }
                None => tracing::warn!("Response for unknown request {}", id),
            },
            WorkerMessage::Chunk { id, chunk } => {
                let delivered = match self.pending.get(&id).as_deref() {
                    Some(Pending::Stream(tx)) => tx.send(Ok(chunk)).is_ok(),
                    _ => {
                        tracing::warn!("Chunk for unknown stream {}", id);
                        true
                    }
                };
                if !delivered {
                    // Caller dropped the stream
                    self.pending.remove(&id);
                }
            }
            WorkerMessage::Done { id } => {
                self.pending.remove(&id);
            }
            WorkerMessage::Error { id, error } => match self.pending.remove(&id) {
                Some((_, pending)) => pending.fail(error),
                None => tracing::warn!("Error for unknown request {}: {}", id, error),
            },
            WorkerMessage::Progress { report } => self.on_progress(report),
            other => tracing::warn!("Client ignoring unexpected message: {:?}", other),
        }
    }
}

pub struct EngineClient {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl EngineClient {
    /// Start reading `source`; requests go out through `sink`
    pub fn connect<S, R>(sink: S, mut source: R) -> Self
    where
        S: MessageSink + 'static,
        R: MessageSource + 'static,
    {
        let shared = Arc::new(Shared {
            sink: Box::new(sink),
            pending: DashMap::new(),
            outgoing: Mutex::new(Outgoing::default()),
            progress: RwLock::new(None),
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.recv().await {
                match message {
                    WorkerMessage::Ready => reader_shared.on_ready().await,
                    other => reader_shared.on_message(other),
                }
            }
            tracing::debug!("Worker channel closed");
            reader_shared.outgoing.lock().await.closed = true;
            reader_shared.fail_pending("worker channel closed");
        });

        Self {
            shared,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    /// Whether the worker has announced itself
    pub async fn is_ready(&self) -> bool {
        self.shared.outgoing.lock().await.ready
    }

    async fn post(&self, request: EngineRequest, pending: Pending) -> Result<(), EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.pending.insert(id, pending);
        let message = WorkerMessage::Request { id, request };

        let mut outgoing = self.shared.outgoing.lock().await;
        if outgoing.closed {
            self.shared.pending.remove(&id);
            return Err(EngineError::Channel("worker channel closed".to_string()));
        }
        if !outgoing.ready {
            outgoing.queued.push(message);
            return Ok(());
        }
        if let Err(e) = self.shared.sink.send(message).await {
            self.shared.pending.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    async fn call(&self, request: EngineRequest) -> Result<ResponsePayload, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.post(request, Pending::Unary(tx)).await?;
        rx.await
            .map_err(|_| EngineError::Channel("worker dropped the request".to_string()))?
    }
}

impl Drop for EngineClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl ChatEngine for EngineClient {
    async fn reload(&self, model_ids: Vec<String>, chat_options: Vec<ChatOptions>) -> Result<(), EngineError> {
        self.call(EngineRequest::Reload {
            model_ids,
            chat_options,
        })
        .await?
        .into_unit()
    }

    async fn chat_completion(&self, request: ChatCompletionRequest) -> Result<ChatResponse, EngineError> {
        if request.stream {
            let (tx, rx) = mpsc::unbounded_channel();
            self.post(EngineRequest::ChatCompletion(request), Pending::Stream(tx))
                .await?;
            return Ok(ChatResponse::Stream(ChunkStream::new(rx)));
        }
        let completion = self
            .call(EngineRequest::ChatCompletion(request))
            .await?
            .into_completion()?;
        Ok(ChatResponse::Completion(completion))
    }

    async fn get_message(&self, model: Option<String>) -> Result<String, EngineError> {
        self.call(EngineRequest::GetMessage { model }).await?.into_text()
    }

    async fn unload(&self, model: Option<String>) -> Result<(), EngineError> {
        self.call(EngineRequest::Unload { model }).await?.into_unit()
    }

    async fn interrupt(&self, model: Option<String>) -> Result<(), EngineError> {
        self.call(EngineRequest::Interrupt { model }).await?.into_unit()
    }

    async fn reset_chat(&self, model: Option<String>) -> Result<(), EngineError> {
        self.call(EngineRequest::ResetChat { model }).await?.into_unit()
    }

    async fn runtime_stats_text(&self, model: Option<String>) -> Result<String, EngineError> {
        self.call(EngineRequest::RuntimeStatsText { model }).await?.into_text()
    }

    async fn has_model_in_cache(&self, model_id: String) -> Result<bool, EngineError> {
        self.call(EngineRequest::HasModelInCache { model_id }).await?.into_bool()
    }

    async fn delete_model_all_info_in_cache(&self, model_id: String) -> Result<(), EngineError> {
        self.call(EngineRequest::DeleteModelAllInfoInCache { model_id })
            .await?
            .into_unit()
    }

    async fn delete_model_artifact(&self, model_id: String, kind: ArtifactKind) -> Result<(), EngineError> {
        self.call(EngineRequest::DeleteModelArtifact { model_id, kind })
            .await?
            .into_unit()
    }

    fn set_progress_callback(&self, callback: Option<ProgressCallback>) {
        let mut guard = match self.shared.progress.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = callback;
    }
}

impl EngineClient {
    /// Round trip with no effect on the engine
    pub async fn heartbeat(&self) -> Result<(), EngineError> {
        self.call(EngineRequest::Heartbeat).await?.into_unit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::transport::channel_pair;

    #[tokio::test]
    async fn test_requests_before_ready_are_queued() {
        let ((client_sink, client_source), (worker_sink, mut worker_source)) = channel_pair();
        let client = Arc::new(EngineClient::connect(client_sink, client_source));

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.heartbeat().await })
        };
        let second = {
            let client = client.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                client.get_message(None).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!client.is_ready().await);

        worker_sink.send(WorkerMessage::Ready).await.unwrap();
        let first_id = match worker_source.recv().await.unwrap() {
            WorkerMessage::Request {
                id,
                request: EngineRequest::Heartbeat,
            } => id,
            other => panic!("unexpected {other:?}"),
        };
        let second_id = match worker_source.recv().await.unwrap() {
            WorkerMessage::Request {
                id,
                request: EngineRequest::GetMessage { .. },
            } => id,
            other => panic!("unexpected {other:?}"),
        };

        worker_sink
            .send(WorkerMessage::Response {
                id: second_id,
                result: ResponsePayload::Text("hello".into()),
            })
            .await
            .unwrap();
        worker_sink
            .send(WorkerMessage::Response {
                id: first_id,
                result: ResponsePayload::Unit,
            })
            .await
            .unwrap();

        assert_eq!(second.await.unwrap().unwrap(), "hello");
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_channel_fails_pending_requests() {
        let ((client_sink, client_source), (worker_sink, mut worker_source)) = channel_pair();
        let client = Arc::new(EngineClient::connect(client_sink, client_source));
        worker_sink.send(WorkerMessage::Ready).await.unwrap();

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.has_model_in_cache("m".into()).await })
        };
        assert!(matches!(
            worker_source.recv().await,
            Some(WorkerMessage::Request { .. })
        ));
        drop(worker_sink);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Channel(_)));

        let err = client.heartbeat().await.unwrap_err();
        assert!(matches!(err, EngineError::Channel(_)));
    }

    #[tokio::test]
    async fn test_progress_reaches_callback() {
        let ((client_sink, client_source), (worker_sink, _worker_source)) = channel_pair();
        let client = EngineClient::connect(client_sink, client_source);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.set_progress_callback(Some(Arc::new(move |report: ProgressReport| {
            let _ = tx.send(report);
        })));

        let report = ProgressReport {
            progress: 0.5,
            time_elapsed: 1.0,
            text: "half".into(),
        };
        worker_sink
            .send(WorkerMessage::Progress { report: report.clone() })
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(report));
    }
}
