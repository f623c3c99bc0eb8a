//! Worker side of the RPC channel
//!
//! Serves a [`ChatEngine`] to one client. Every request runs in its own task;
//! every outgoing message goes through a single ordered outbox, so chunks of
//! one stream arrive in order while different requests interleave freely.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::inference::engine::{ChatEngine, ChatResponse, EngineError};
use crate::rpc::protocol::{EngineRequest, RequestId, ResponsePayload, WorkerMessage};
use crate::rpc::transport::{MessageSink, MessageSource};
use crate::types::openai::ChatCompletionChunk;
use crate::types::progress::ProgressReport;

type Outbox = mpsc::UnboundedSender<WorkerMessage>;

/// Serve `engine` until `source` closes.
///
/// Announces [`WorkerMessage::Ready`] first and forwards load progress as
/// [`WorkerMessage::Progress`] while serving.
pub async fn serve<S, R>(engine: Arc<dyn ChatEngine>, sink: S, mut source: R)
where
    S: MessageSink + 'static,
    R: MessageSource,
{
    let (outbox, mut queue) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            if let Err(e) = sink.send(message).await {
                tracing::warn!("Worker could not deliver a message: {}", e);
                break;
            }
        }
    });

    let progress_outbox = outbox.clone();
    engine.set_progress_callback(Some(Arc::new(move |report: ProgressReport| {
        let _ = progress_outbox.send(WorkerMessage::Progress { report });
    })));

    let _ = outbox.send(WorkerMessage::Ready);
    tracing::debug!("Worker ready");

    let mut tasks = Vec::new();
    while let Some(message) = source.recv().await {
        match message {
            WorkerMessage::Request { id, request } => {
                tracing::debug!("Request {} ({})", id, request.method());
                let engine = engine.clone();
                let outbox = outbox.clone();
                tasks.push(tokio::spawn(async move {
                    dispatch(engine.as_ref(), id, request, &outbox).await;
                }));
                tasks.retain(|task| !task.is_finished());
            }
            other => tracing::warn!("Worker ignoring unexpected message: {:?}", other),
        }
    }

    tracing::debug!("Client disconnected; waiting for {} requests", tasks.len());
    for task in tasks {
        let _ = task.await;
    }
    engine.set_progress_callback(None);
    drop(outbox);
    let _ = writer.await;
}

async fn dispatch(engine: &dyn ChatEngine, id: RequestId, request: EngineRequest, outbox: &Outbox) {
    let result = match request {
        EngineRequest::ChatCompletion(request) => match engine.chat_completion(request).await {
            Ok(ChatResponse::Completion(completion)) => Ok(ResponsePayload::Completion(completion)),
            Ok(ChatResponse::Stream(stream)) => {
                forward_stream(id, stream, outbox).await;
                return;
            }
            Err(e) => Err(e),
        },
        EngineRequest::Reload {
            model_ids,
            chat_options,
        } => engine.reload(model_ids, chat_options).await.map(|_| ResponsePayload::Unit),
        EngineRequest::GetMessage { model } => engine.get_message(model).await.map(ResponsePayload::Text),
        EngineRequest::Unload { model } => engine.unload(model).await.map(|_| ResponsePayload::Unit),
        EngineRequest::Interrupt { model } => engine.interrupt(model).await.map(|_| ResponsePayload::Unit),
        EngineRequest::ResetChat { model } => engine.reset_chat(model).await.map(|_| ResponsePayload::Unit),
        EngineRequest::RuntimeStatsText { model } => {
            engine.runtime_stats_text(model).await.map(ResponsePayload::Text)
        }
        EngineRequest::HasModelInCache { model_id } => {
            engine.has_model_in_cache(model_id).await.map(ResponsePayload::Bool)
        }
        EngineRequest::DeleteModelAllInfoInCache { model_id } => engine
            .delete_model_all_info_in_cache(model_id)
            .await
            .map(|_| ResponsePayload::Unit),
        EngineRequest::DeleteModelArtifact { model_id, kind } => engine
            .delete_model_artifact(model_id, kind)
            .await
            .map(|_| ResponsePayload::Unit),
        EngineRequest::Heartbeat => Ok(ResponsePayload::Unit),
    };

    let message = match result {
        Ok(result) => WorkerMessage::Response { id, result },
        Err(error) => WorkerMessage::Error { id, error },
    };
    let _ = outbox.send(message);
}

async fn forward_stream<S>(id: RequestId, mut stream: S, outbox: &Outbox)
where
    S: futures::Stream<Item = Result<ChatCompletionChunk, EngineError>> + Unpin,
{
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                // Dropping the stream aborts the generation
                if outbox.send(WorkerMessage::Chunk { id, chunk }).is_err() {
                    return;
                }
            }
            Err(error) => {
                let _ = outbox.send(WorkerMessage::Error { id, error });
                return;
            }
        }
    }
    let _ = outbox.send(WorkerMessage::Done { id });
}
