//! End-to-end engine scenarios over the mock runtime

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;

use webllm::inference::mock::{mock_record, publish_mock_model, MockLoader};
use webllm::inference::{ChatEngine, ChunkStream, Engine, EngineError};
use webllm::storage::artifact_cache::{shard_path, ArtifactCache, ArtifactKind};
use webllm::storage::backend::open_backend;
use webllm::storage::fetch::{join_url, Fetcher, StaticFetcher};
use webllm::system::gpu::AcceleratorInfo;
use webllm::types::config::{AppConfig, CacheBackendKind};
use webllm::types::message::ChatMessage;
use webllm::types::openai::{ChatCompletion, ChatCompletionRequest, FinishReason};

struct Harness {
    _dir: tempfile::TempDir,
    fetcher: Arc<StaticFetcher>,
    engine: Engine,
}

fn harness_with(loader: MockLoader, ids: &[&str], kind: CacheBackendKind) -> Harness {
    let fetcher = StaticFetcher::new().shared();
    let mut app_config = AppConfig::default();
    for id in ids {
        let record = mock_record(id);
        publish_mock_model(&fetcher, &record);
        app_config.model_list.push(record);
    }
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(kind, dir.path(), None).unwrap();
    let cache = ArtifactCache::new(backend, fetcher.clone());
    Harness {
        _dir: dir,
        fetcher,
        engine: Engine::new(app_config, cache, Arc::new(loader)),
    }
}

fn harness(loader: MockLoader, ids: &[&str]) -> Harness {
    harness_with(loader, ids, CacheBackendKind::BlobStore)
}

async fn complete(engine: &Engine, model: Option<&str>, messages: Vec<ChatMessage>) -> ChatCompletion {
    let mut request = ChatCompletionRequest::new(messages);
    request.model = model.map(str::to_string);
    engine
        .chat_completion(request)
        .await
        .unwrap()
        .into_completion()
        .unwrap()
}

#[tokio::test]
async fn three_states_then_two_more_reuses_prefix() {
    let h = harness(MockLoader::new(["California, Texas, Ohio.", "Nevada, Utah."]), &["m"]);
    h.engine.reload(vec!["m".into()], vec![]).await.unwrap();

    let first_turn = vec![
        ChatMessage::system("You are a helpful assistant."),
        ChatMessage::user("Provide me three US states."),
    ];
    let first = complete(&h.engine, None, first_turn.clone()).await;
    let reply = first.choices[0].message.content.clone();
    assert_eq!(reply, "California, Texas, Ohio.");

    let mut second_turn = first_turn;
    second_turn.push(ChatMessage::assistant(reply));
    second_turn.push(ChatMessage::user("Two more please!"));
    let second = complete(&h.engine, None, second_turn.clone()).await;
    assert_eq!(second.choices[0].message.content, "Nevada, Utah.");
    assert!(second.usage.prompt_tokens < first.usage.prompt_tokens);

    // Same history from a cold conversation prefills everything
    h.engine.reset_chat(None).await.unwrap();
    let cold = complete(&h.engine, None, second_turn).await;
    assert!(
        second.usage.prompt_tokens < cold.usage.prompt_tokens,
        "reused {} vs cold {}",
        second.usage.prompt_tokens,
        cold.usage.prompt_tokens
    );
}

#[tokio::test]
async fn edited_history_forces_full_prefill() {
    let h = harness(MockLoader::new(["Paris."]), &["m"]);
    h.engine.reload(vec!["m".into()], vec![]).await.unwrap();

    let first = complete(&h.engine, None, vec![ChatMessage::user("Capital of France?")]).await;
    let reply = first.choices[0].message.content.clone();

    let edited = vec![
        ChatMessage::user("Capital of Italy?"),
        ChatMessage::assistant(reply),
        ChatMessage::user("And its population?"),
    ];
    let after_edit = complete(&h.engine, None, edited.clone()).await;

    h.engine.reset_chat(None).await.unwrap();
    let cold = complete(&h.engine, None, edited).await;
    assert_eq!(after_edit.usage.prompt_tokens, cold.usage.prompt_tokens);
}

#[tokio::test]
async fn interrupt_aborts_stream_and_next_request_prefills_fully() {
    let loader = MockLoader::new(["This reply is long enough to be interrupted halfway through."])
        .with_step_delay(Duration::from_millis(5));
    let h = harness(loader, &["m"]);
    h.engine.reload(vec!["m".into()], vec![]).await.unwrap();

    let messages = vec![ChatMessage::user("Tell me something.")];
    let mut request = ChatCompletionRequest::new(messages.clone());
    request.stream = true;
    let mut stream = h.engine.chat_completion(request).await.unwrap().into_stream().unwrap();

    let mut text = String::new();
    let mut finish = None;
    let mut interrupted = false;
    while let Some(chunk) = stream.next().await {
        for choice in chunk.unwrap().choices {
            if let Some(content) = choice.delta.content {
                text.push_str(&content);
            }
            finish = finish.or(choice.finish_reason);
        }
        if !interrupted && text.len() >= 3 {
            h.engine.interrupt(None).await.unwrap();
            interrupted = true;
        }
    }
    assert_eq!(finish, Some(FinishReason::Abort));
    assert!(text.len() < "This reply is long enough to be interrupted halfway through.".len());
    assert_eq!(h.engine.get_message(None).await.unwrap(), text);

    let follow_up = vec![
        messages[0].clone(),
        ChatMessage::assistant(text),
        ChatMessage::user("Go on."),
    ];
    let after_abort = complete(&h.engine, None, follow_up.clone()).await;
    h.engine.reset_chat(None).await.unwrap();
    let cold = complete(&h.engine, None, follow_up).await;
    assert_eq!(after_abort.usage.prompt_tokens, cold.usage.prompt_tokens);
}

#[tokio::test]
async fn delete_then_reload_downloads_again() {
    let h = harness(MockLoader::new(["ok"]), &["m"]);
    assert!(!h.engine.has_model_in_cache("m".into()).await.unwrap());

    h.engine.reload(vec!["m".into()], vec![]).await.unwrap();
    assert!(h.engine.has_model_in_cache("m".into()).await.unwrap());
    let first_transfers = h.fetcher.transfers();

    // A second reload is served from the cache
    h.engine.reload(vec!["m".into()], vec![]).await.unwrap();
    assert_eq!(h.fetcher.transfers(), first_transfers);

    h.engine.delete_model_artifact("m".into(), ArtifactKind::Weights).await.unwrap();
    assert!(!h.engine.has_model_in_cache("m".into()).await.unwrap());
    h.engine.reload(vec!["m".into()], vec![]).await.unwrap();
    assert_eq!(h.fetcher.transfers(), first_transfers + 3, "manifest and two shards");

    h.engine.delete_model_all_info_in_cache("m".into()).await.unwrap();
    assert!(!h.engine.has_model_in_cache("m".into()).await.unwrap());
    h.engine.reload(vec!["m".into()], vec![]).await.unwrap();
    assert_eq!(h.fetcher.transfers(), 2 * first_transfers + 3);
}

#[tokio::test]
async fn cached_shards_are_bit_exact_on_both_backends() {
    for kind in [CacheBackendKind::BlobStore, CacheBackendKind::RequestCache] {
        let h = harness_with(MockLoader::new(["ok"]), &["m"], kind);
        h.engine.reload(vec!["m".into()], vec![]).await.unwrap();

        let record = mock_record("m");
        for data_path in ["params_shard_0.bin", "params_shard_1.bin"] {
            let original = h
                .fetcher
                .fetch(&join_url(&record.model_url, data_path), &|_, _| {})
                .await
                .unwrap();
            let cached = h
                .engine
                .cache()
                .read(&shard_path(&record, data_path))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(cached.data, original, "{kind:?} {data_path}");
        }
    }
}

#[tokio::test]
async fn unsupported_accelerator_fails_before_download() {
    let loader = MockLoader::new(["ok"]).with_accelerator(AcceleratorInfo::new("basic adapter", &[], 0));
    let h = harness(loader, &["m"]);

    let err = h.engine.reload(vec!["m".into()], vec![]).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::UnsupportedFeature {
            model_id: "m".into(),
            missing: vec!["shader-f16".into()],
        }
    );
    assert_eq!(h.fetcher.transfers(), 0);
    assert!(h.engine.loaded_models().is_empty());
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let h = harness(MockLoader::new(["ok"]), &["m"]);
    let err = h.engine.reload(vec!["nope".into()], vec![]).await.unwrap_err();
    assert_eq!(err, EngineError::UnknownModel("nope".into()));
    let err = h.engine.has_model_in_cache("nope".into()).await.unwrap_err();
    assert_eq!(err, EngineError::UnknownModel("nope".into()));
}

#[tokio::test]
async fn several_models_need_an_explicit_target() {
    let h = harness(MockLoader::new(["first", "second", "third"]), &["a", "b"]);
    h.engine.reload(vec!["a".into(), "b".into()], vec![]).await.unwrap();

    let err = h
        .engine
        .chat_completion(ChatCompletionRequest::new(vec![ChatMessage::user("hi")]))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::AmbiguousModel {
            loaded: vec!["a".into(), "b".into()],
        }
    );
    assert!(matches!(
        h.engine.get_message(None).await.unwrap_err(),
        EngineError::AmbiguousModel { .. }
    ));

    let from_a = complete(&h.engine, Some("a"), vec![ChatMessage::user("hi a")]).await;
    let from_b = complete(&h.engine, Some("b"), vec![ChatMessage::user("hi b")]).await;
    assert_eq!(from_a.model, "a");
    assert_eq!(from_b.model, "b");

    // Each model keeps its own conversation
    let follow_up = vec![
        ChatMessage::user("hi a"),
        ChatMessage::assistant(from_a.choices[0].message.content.clone()),
        ChatMessage::user("more"),
    ];
    let reused = complete(&h.engine, Some("a"), follow_up.clone()).await;
    h.engine.reset_chat(Some("a".into())).await.unwrap();
    let cold = complete(&h.engine, Some("a"), follow_up).await;
    assert!(reused.usage.prompt_tokens < cold.usage.prompt_tokens);

    assert_eq!(
        h.engine.get_message(Some("b".into())).await.unwrap(),
        from_b.choices[0].message.content
    );
}

#[tokio::test]
async fn concurrent_requests_on_one_model_are_serialized() {
    let loader = MockLoader::new(["one", "two"]).with_step_delay(Duration::from_millis(2));
    let h = Arc::new(harness(loader, &["m"]));
    h.engine.reload(vec!["m".into()], vec![]).await.unwrap();

    let tasks: Vec<_> = ["x", "y"]
        .into_iter()
        .map(|prompt| {
            let h = h.clone();
            tokio::spawn(async move { complete(&h.engine, None, vec![ChatMessage::user(prompt)]).await })
        })
        .collect();

    let mut replies = Vec::new();
    for task in tasks {
        let completion = task.await.unwrap();
        assert_eq!(completion.choices[0].finish_reason, FinishReason::Stop);
        replies.push(completion.choices[0].message.content.clone());
    }
    replies.sort();
    assert_eq!(replies, vec!["one".to_string(), "two".to_string()]);
}

/// Drain a stream, logging `(model, finished)` for every content or finish chunk
async fn drain_logged(model: &'static str, mut stream: ChunkStream, log: Arc<Mutex<Vec<(&'static str, bool)>>>) -> String {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.unwrap();
        assert_eq!(chunk.model, model);
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                text.push_str(&content);
                log.lock().unwrap().push((model, false));
            }
            if choice.finish_reason.is_some() {
                log.lock().unwrap().push((model, true));
            }
        }
    }
    text
}

#[tokio::test]
async fn requests_on_different_models_run_concurrently() {
    const REPLY: &str = "both models make progress at once";
    let loader = MockLoader::new([REPLY]).with_step_delay(Duration::from_millis(3));
    let h = harness(loader, &["a", "b"]);
    h.engine.reload(vec!["a".into(), "b".into()], vec![]).await.unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for model in ["a", "b"] {
        let mut request = ChatCompletionRequest::new(vec![ChatMessage::user("go")]);
        request.model = Some(model.to_string());
        request.stream = true;
        let stream = h.engine.chat_completion(request).await.unwrap().into_stream().unwrap();
        tasks.push(tokio::spawn(drain_logged(model, stream, log.clone())));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), REPLY);
    }

    let log = log.lock().unwrap().clone();
    let first_content = |model: &str| log.iter().position(|e| *e == (model, false)).unwrap();
    let finished = |model: &str| log.iter().position(|e| *e == (model, true)).unwrap();
    assert!(first_content("a") < finished("b"), "{log:?}");
    assert!(first_content("b") < finished("a"), "{log:?}");
}
