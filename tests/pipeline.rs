//! End-to-end pipeline tests with a mock Ollama endpoint.
//!
//! Ingestion and answer runs are exercised against a temporary SQLite
//! database and an httpmock server standing in for Ollama, so the tests are
//! deterministic and network-free.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use tokio::time::timeout;

use knowbase::answer::AnswerRunner;
use knowbase::config::{ChunkingConfig, OllamaConfig, DEFAULT_SYSTEM_PROMPT};
use knowbase::embedding::{blob_to_vec, vec_to_blob, EmbeddingClient};
use knowbase::events::{Event, EventHub, Topic};
use knowbase::llm::LlmClient;
use knowbase::models::{Chunk, ProcessingStatus};
use knowbase::{db, ingest, migrate, store};

async fn fresh_pool(dir: &std::path::Path) -> sqlx::SqlitePool {
    let pool = db::connect(&dir.join("knowbase.sqlite")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    pool
}

fn ollama_config(base_url: &str) -> OllamaConfig {
    OllamaConfig {
        base_url: base_url.to_string(),
        ..Default::default()
    }
}

fn ndjson(lines: &[serde_json::Value]) -> String {
    lines
        .iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

/// Drain progress events for one document until a terminal status arrives.
async fn collect_progress(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
) -> Vec<(String, u8, Option<String>)> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for progress")
            .expect("event channel closed");
        if let Event::DocumentProgress {
            status,
            progress,
            error,
            ..
        } = event
        {
            let terminal = status == "Completed" || status == "Failed";
            seen.push((status, progress, error));
            if terminal {
                return seen;
            }
        }
    }
}

// ============ Ingestion ============

#[tokio::test]
async fn txt_ingestion_yields_one_completed_chunk() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embeddings");
            then.status(200)
                .json_body(serde_json::json!({ "embedding": [0.1, 0.2, 0.3] }));
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(dir.path()).await;
    let hub = EventHub::new(64);
    let embedder = Arc::new(EmbeddingClient::new(&ollama_config(&server.base_url())).unwrap());

    let area = store::create_area(&pool, "hr", Some("people docs")).await.unwrap();

    let file_path = dir.path().join("vacation.txt");
    std::fs::write(
        &file_path,
        "Employees receive fifteen vacation days. Unused days carry over.",
    )
    .unwrap();
    let document = store::create_document(
        &pool,
        &area.id,
        "vacation.txt",
        &file_path.to_string_lossy(),
        64,
    )
    .await
    .unwrap();

    let mut rx = hub.subscribe(Topic::Area(area.id.clone()));
    ingest::trigger(&pool, &hub, &embedder, &ChunkingConfig::default(), &document.id)
        .await
        .unwrap();

    let progress = collect_progress(&mut rx).await;
    let percentages: Vec<u8> = progress.iter().map(|(_, p, _)| *p).collect();
    assert_eq!(percentages, vec![10, 30, 50, 80, 100]);
    assert_eq!(progress.last().unwrap().0, "Completed");

    let refreshed = store::get_document(&pool, &document.id).await.unwrap().unwrap();
    assert_eq!(refreshed.processing_status, ProcessingStatus::Completed);
    assert_eq!(refreshed.chunk_count, 1);
    assert!(refreshed.error_message.is_none());

    let candidates = store::fetch_area_candidates(&pool, &area.id).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(
        candidates[0].content,
        "Employees receive fifteen vacation days. Unused days carry over."
    );
    assert_eq!(blob_to_vec(&candidates[0].embedding), vec![0.1, 0.2, 0.3]);

    let area = store::get_area(&pool, &area.id).await.unwrap().unwrap();
    assert_eq!(area.document_count, 1);
}

#[tokio::test]
async fn retrigger_while_processing_is_rejected() {
    let server = MockServer::start_async().await;
    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(dir.path()).await;
    let hub = EventHub::new(64);
    let embedder = Arc::new(EmbeddingClient::new(&ollama_config(&server.base_url())).unwrap());

    let area = store::create_area(&pool, "hr", None).await.unwrap();
    let document = store::create_document(&pool, &area.id, "doc.txt", "/nonexistent", 1)
        .await
        .unwrap();
    store::set_document_status(&pool, &document.id, ProcessingStatus::Processing)
        .await
        .unwrap();

    let err = ingest::trigger(&pool, &hub, &embedder, &ChunkingConfig::default(), &document.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ingest::IngestError::AlreadyProcessing));

    let missing = ingest::trigger(&pool, &hub, &embedder, &ChunkingConfig::default(), "no-such-id")
        .await
        .unwrap_err();
    assert!(matches!(missing, ingest::IngestError::NotFound));
}

#[tokio::test]
async fn embedding_failure_marks_document_failed() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embeddings");
            then.status(500).body("model exploded");
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(dir.path()).await;
    let hub = EventHub::new(64);
    let embedder = Arc::new(EmbeddingClient::new(&ollama_config(&server.base_url())).unwrap());

    let area = store::create_area(&pool, "hr", None).await.unwrap();
    let file_path = dir.path().join("doc.txt");
    std::fs::write(&file_path, "Some text to ingest.").unwrap();
    let document = store::create_document(
        &pool,
        &area.id,
        "doc.txt",
        &file_path.to_string_lossy(),
        20,
    )
    .await
    .unwrap();

    let mut rx = hub.subscribe(Topic::Area(area.id.clone()));
    ingest::trigger(&pool, &hub, &embedder, &ChunkingConfig::default(), &document.id)
        .await
        .unwrap();

    let progress = collect_progress(&mut rx).await;
    let (status, _, error) = progress.last().unwrap();
    assert_eq!(status, "Failed");
    assert!(error.as_deref().unwrap().contains("embedding API error"));

    let refreshed = store::get_document(&pool, &document.id).await.unwrap().unwrap();
    assert_eq!(refreshed.processing_status, ProcessingStatus::Failed);
    assert!(refreshed.error_message.is_some());
    assert!(store::fetch_area_candidates(&pool, &area.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn unsupported_stored_extension_fails_the_run() {
    let server = MockServer::start_async().await;
    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(dir.path()).await;
    let hub = EventHub::new(64);
    let embedder = Arc::new(EmbeddingClient::new(&ollama_config(&server.base_url())).unwrap());

    let area = store::create_area(&pool, "hr", None).await.unwrap();
    let document = store::create_document(&pool, &area.id, "image.png", "/nonexistent.png", 1)
        .await
        .unwrap();

    let mut rx = hub.subscribe(Topic::Area(area.id.clone()));
    ingest::trigger(&pool, &hub, &embedder, &ChunkingConfig::default(), &document.id)
        .await
        .unwrap();

    let progress = collect_progress(&mut rx).await;
    assert_eq!(progress.last().unwrap().0, "Failed");

    let refreshed = store::get_document(&pool, &document.id).await.unwrap().unwrap();
    assert!(refreshed
        .error_message
        .unwrap()
        .contains("unsupported file type"));
}

// ============ Chat turns ============

fn runner(pool: &sqlx::SqlitePool, hub: &Arc<EventHub>, base_url: &str) -> AnswerRunner {
    let config = ollama_config(base_url);
    AnswerRunner {
        pool: pool.clone(),
        hub: Arc::clone(hub),
        embedder: Arc::new(EmbeddingClient::new(&config).unwrap()),
        llm: Arc::new(LlmClient::new(&config).unwrap()),
        system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        top_k: 7,
    }
}

#[tokio::test]
async fn chat_with_no_documents_still_answers() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embeddings");
            then.status(200)
                .json_body(serde_json::json!({ "embedding": [1.0, 0.0] }));
        })
        .await;
    let body = ndjson(&[
        serde_json::json!({"message": {"content": "<p>I don't have that information"}, "done": false}),
        serde_json::json!({"message": {"content": " in the available documents.</p>"}, "done": false}),
        serde_json::json!({"message": {"content": ""}, "done": true}),
    ]);
    server
        .mock_async(move |when, then| {
            when.method(POST).path("/api/chat");
            then.status(200).body(body);
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(dir.path()).await;
    let hub = EventHub::new(64);

    let area = store::create_area(&pool, "hr", None).await.unwrap();
    let chat = store::create_chat(&pool, &area.id, "benefits").await.unwrap();
    store::insert_message(&pool, &chat.id, "user", "How many vacation days?", None, None)
        .await
        .unwrap();

    let mut rx = hub.subscribe(Topic::Chat(chat.id.clone()));
    runner(&pool, &hub, &server.base_url())
        .respond(chat.clone(), "How many vacation days?".to_string())
        .await;

    // Live tokens are stripped of markup.
    let mut tokens = Vec::new();
    let final_message = loop {
        match timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap() {
            Event::AssistantToken { text, .. } => tokens.push(text),
            Event::AssistantMessage { message } => break message,
            Event::StreamError { error, .. } => panic!("unexpected stream error: {error}"),
            _ => {}
        }
    };
    assert_eq!(tokens.concat(), "I don't have that information in the available documents.");

    assert_eq!(
        final_message.content_html.as_deref(),
        Some("<p>I don't have that information in the available documents.</p>")
    );
    assert_eq!(
        final_message.content,
        "I don't have that information in the available documents."
    );
    assert_eq!(final_message.sources.as_deref(), Some("[]"));

    let messages = store::list_messages(&pool, &chat.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[1].role, "assistant");

    let chat = store::get_chat(&pool, &chat.id).await.unwrap().unwrap();
    assert_eq!(chat.message_count, 2);
    assert!(chat.last_message_at.is_some());
}

#[tokio::test]
async fn answer_is_grounded_in_retrieved_chunks() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embeddings");
            then.status(200)
                .json_body(serde_json::json!({ "embedding": [1.0, 0.0] }));
        })
        .await;
    // Only matches when the prompt carries the labeled source block.
    let body = ndjson(&[
        serde_json::json!({"message": {"content": "<p>Fifteen days.</p>"}, "done": false}),
        serde_json::json!({"done": true}),
    ]);
    let chat_mock = server
        .mock_async(move |when, then| {
            when.method(POST)
                .path("/api/chat")
                .body_contains("[Source: handbook.txt]");
            then.status(200).body(body);
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(dir.path()).await;
    let hub = EventHub::new(64);

    let area = store::create_area(&pool, "hr", None).await.unwrap();
    let document = store::create_document(&pool, &area.id, "handbook.txt", "/tmp/h.txt", 10)
        .await
        .unwrap();
    let chunk = Chunk {
        id: uuid::Uuid::new_v4().to_string(),
        document_id: document.id.clone(),
        content: "Employees receive fifteen vacation days.".to_string(),
        chunk_index: 0,
        embedding: vec_to_blob(&[1.0, 0.0]),
        metadata: None,
    };
    store::complete_ingestion(&pool, &document.id, &area.id, &[chunk])
        .await
        .unwrap();

    let chat = store::create_chat(&pool, &area.id, "benefits").await.unwrap();
    let mut rx = hub.subscribe(Topic::Chat(chat.id.clone()));
    runner(&pool, &hub, &server.base_url())
        .respond(chat.clone(), "How many vacation days?".to_string())
        .await;

    let message = loop {
        match timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap() {
            Event::AssistantMessage { message } => break message,
            Event::StreamError { error, .. } => panic!("unexpected stream error: {error}"),
            _ => {}
        }
    };

    chat_mock.assert_async().await;
    assert_eq!(message.content, "Fifteen days.");
    let sources: Vec<serde_json::Value> =
        serde_json::from_str(message.sources.as_deref().unwrap()).unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0]["document_name"], "handbook.txt");
    assert_eq!(sources[0]["chunk_index"], 0);
}

#[tokio::test]
async fn broken_stream_broadcasts_error_and_persists_nothing() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embeddings");
            then.status(200)
                .json_body(serde_json::json!({ "embedding": [1.0, 0.0] }));
        })
        .await;
    // Stream ends without a done marker.
    let body = ndjson(&[
        serde_json::json!({"message": {"content": "<p>partial"}, "done": false}),
    ]);
    server
        .mock_async(move |when, then| {
            when.method(POST).path("/api/chat");
            then.status(200).body(body);
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(dir.path()).await;
    let hub = EventHub::new(64);

    let area = store::create_area(&pool, "hr", None).await.unwrap();
    let chat = store::create_chat(&pool, &area.id, "benefits").await.unwrap();

    let mut rx = hub.subscribe(Topic::Chat(chat.id.clone()));
    runner(&pool, &hub, &server.base_url())
        .respond(chat.clone(), "question".to_string())
        .await;

    let error = loop {
        match timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap() {
            Event::StreamError { error, .. } => break error,
            Event::AssistantMessage { .. } => panic!("message persisted from broken stream"),
            _ => {}
        }
    };
    assert!(error.contains("ended before completion"));
    assert!(store::list_messages(&pool, &chat.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn embedding_failure_in_chat_broadcasts_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/embeddings");
            then.status(503).body("overloaded");
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(dir.path()).await;
    let hub = EventHub::new(64);

    let area = store::create_area(&pool, "hr", None).await.unwrap();
    let chat = store::create_chat(&pool, &area.id, "benefits").await.unwrap();

    let mut rx = hub.subscribe(Topic::Chat(chat.id.clone()));
    runner(&pool, &hub, &server.base_url())
        .respond(chat.clone(), "question".to_string())
        .await;

    let event = timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, Event::StreamError { .. }));
    assert!(store::list_messages(&pool, &chat.id).await.unwrap().is_empty());
}
