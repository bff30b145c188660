//! HTTP API and WebSocket event feeds.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/areas` | Create an area |
//! | `GET`  | `/api/areas` | List areas |
//! | `GET`  | `/api/areas/{id}` | Fetch one area |
//! | `DELETE` | `/api/areas/{id}` | Delete an area (documents and chats cascade) |
//! | `GET`  | `/api/areas/{id}/documents` | List an area's documents |
//! | `POST` | `/api/areas/{id}/documents` | Upload a document (multipart field `file`) |
//! | `GET`  | `/api/documents/{id}` | Fetch one document |
//! | `POST` | `/api/documents/{id}/analyze` | Start the ingestion run |
//! | `DELETE` | `/api/documents/{id}` | Delete a document and its stored file |
//! | `POST` | `/api/areas/{id}/chats` | Create a chat |
//! | `GET`  | `/api/areas/{id}/chats` | List an area's chats |
//! | `DELETE` | `/api/chats/{id}` | Delete a chat |
//! | `GET`  | `/api/chats/{id}/messages` | List a chat's messages |
//! | `POST` | `/api/messages` | Send a user message, spawn the answer run |
//! | `GET`  | `/ws/areas/{id}` | WebSocket: ingestion progress events |
//! | `GET`  | `/ws/chats/{id}` | WebSocket: message and streaming events |
//! | `GET`  | `/health` | Health check |
//!
//! Validation failures are returned synchronously as
//! `{ "error": { "code", "message" } }`; background-run failures are only
//! observable through the document status or the event stream.
//!
//! All origins are permitted (CORS) to support browser clients.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Multipart, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::answer::AnswerRunner;
use crate::config::Config;
use crate::db;
use crate::embedding::EmbeddingClient;
use crate::events::{Event, EventHub, Topic};
use crate::extract::FileKind;
use crate::ingest::{self, IngestError};
use crate::llm::LlmClient;
use crate::migrate;
use crate::models::{Area, Chat, Document, Message};
use crate::store;

/// Per-topic event buffer before a lagging WebSocket starts losing events.
const EVENT_CAPACITY: usize = 256;

/// Shared application state. Cloning is cheap; detached runs clone out of
/// this so they never depend on a request's lifetime.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub hub: Arc<EventHub>,
    pub config: Arc<Config>,
    pub embedder: Arc<EmbeddingClient>,
    pub llm: Arc<LlmClient>,
}

/// Start the server: open the pool, run migrations, bind, serve.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let state = AppState {
        pool,
        hub: EventHub::new(EVENT_CAPACITY),
        embedder: Arc::new(EmbeddingClient::new(&config.ollama)?),
        llm: Arc::new(LlmClient::new(&config.ollama)?),
        config: Arc::new(config),
    };

    let bind_addr = state.config.server.bind.clone();
    let app = build_router(state);

    tracing::info!("listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/areas", post(create_area).get(list_areas))
        .route("/api/areas/{id}", get(get_area).delete(delete_area))
        .route(
            "/api/areas/{id}/documents",
            post(upload_document).get(list_documents),
        )
        .route("/api/documents/{id}", get(get_document).delete(delete_document))
        .route("/api/documents/{id}/analyze", post(analyze_document))
        .route("/api/areas/{id}/chats", post(create_chat).get(list_chats))
        .route("/api/chats/{id}", delete(delete_chat))
        .route("/api/chats/{id}/messages", get(list_messages))
        .route("/api/messages", post(send_message))
        .route("/ws/areas/{id}", get(ws_area))
        .route("/ws/chats/{id}", get(ws_chat))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict".to_string(),
        message: message.into(),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Areas ============

#[derive(Deserialize)]
struct CreateArea {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

async fn create_area(
    State(state): State<AppState>,
    Json(req): Json<CreateArea>,
) -> Result<Json<Area>, AppError> {
    if req.name.trim().is_empty() {
        return Err(bad_request("area name must not be empty"));
    }
    let area = store::create_area(&state.pool, req.name.trim(), req.description.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(area))
}

async fn list_areas(State(state): State<AppState>) -> Result<Json<Vec<Area>>, AppError> {
    let areas = store::list_areas(&state.pool).await.map_err(internal)?;
    Ok(Json(areas))
}

async fn get_area(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Area>, AppError> {
    store::get_area(&state.pool, &id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found("area not found"))
}

async fn delete_area(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let Some(paths) = store::delete_area(&state.pool, &id).await.map_err(internal)? else {
        return Err(not_found("area not found"));
    };
    for path in paths {
        let _ = tokio::fs::remove_file(&path).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============ Documents ============

async fn list_documents(
    State(state): State<AppState>,
    Path(area_id): Path<String>,
) -> Result<Json<Vec<Document>>, AppError> {
    if store::get_area(&state.pool, &area_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(not_found("area not found"));
    }
    let documents = store::list_documents(&state.pool, &area_id)
        .await
        .map_err(internal)?;
    Ok(Json(documents))
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Document>, AppError> {
    store::get_document(&state.pool, &id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found("document not found"))
}

async fn upload_document(
    State(state): State<AppState>,
    Path(area_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<Document>, AppError> {
    if store::get_area(&state.pool, &area_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(not_found("area not found"));
    }

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field
            .file_name()
            .map(|s| s.to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| bad_request("file field is missing a file name"))?;

        // Reject unsupported extensions before any storage or DB write.
        let kind = FileKind::from_file_name(&file_name).map_err(|e| bad_request(e.to_string()))?;

        let data = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read upload: {e}")))?;
        if data.is_empty() {
            return Err(bad_request("no file uploaded"));
        }

        let uploads_dir = &state.config.uploads.dir;
        tokio::fs::create_dir_all(uploads_dir)
            .await
            .map_err(internal)?;
        let stored_name = format!("{}.{}", uuid::Uuid::new_v4(), kind.extension());
        let stored_path = uploads_dir.join(stored_name);
        tokio::fs::write(&stored_path, &data).await.map_err(internal)?;

        let document = store::create_document(
            &state.pool,
            &area_id,
            &file_name,
            &stored_path.to_string_lossy(),
            data.len() as i64,
        )
        .await
        .map_err(internal)?;

        state.hub.publish(
            &Topic::Area(area_id.clone()),
            Event::DocumentProgress {
                document_id: document.id.clone(),
                status: document.processing_status.as_str().to_string(),
                progress: 100,
                error: None,
            },
        );

        tracing::info!(document_id = %document.id, file = %file_name, "document uploaded");
        return Ok(Json(document));
    }

    Err(bad_request("multipart field 'file' is required"))
}

#[derive(Serialize)]
struct AnalyzeResponse {
    message: String,
}

async fn analyze_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AnalyzeResponse>, AppError> {
    match ingest::trigger(
        &state.pool,
        &state.hub,
        &state.embedder,
        &state.config.chunking,
        &id,
    )
    .await
    {
        Ok(()) => Ok(Json(AnalyzeResponse {
            message: "analysis started".to_string(),
        })),
        Err(IngestError::NotFound) => Err(not_found("document not found")),
        Err(e @ IngestError::AlreadyProcessing) => Err(conflict(e.to_string())),
    }
}

async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let Some(path) = store::delete_document(&state.pool, &id).await.map_err(internal)? else {
        return Err(not_found("document not found"));
    };
    let _ = tokio::fs::remove_file(&path).await;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Chats ============

#[derive(Deserialize)]
struct CreateChat {
    name: String,
}

async fn create_chat(
    State(state): State<AppState>,
    Path(area_id): Path<String>,
    Json(req): Json<CreateChat>,
) -> Result<Json<Chat>, AppError> {
    if req.name.trim().is_empty() {
        return Err(bad_request("chat name must not be empty"));
    }
    if store::get_area(&state.pool, &area_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(not_found("area not found"));
    }
    let chat = store::create_chat(&state.pool, &area_id, req.name.trim())
        .await
        .map_err(internal)?;
    Ok(Json(chat))
}

async fn list_chats(
    State(state): State<AppState>,
    Path(area_id): Path<String>,
) -> Result<Json<Vec<Chat>>, AppError> {
    if store::get_area(&state.pool, &area_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(not_found("area not found"));
    }
    let chats = store::list_chats(&state.pool, &area_id)
        .await
        .map_err(internal)?;
    Ok(Json(chats))
}

async fn delete_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if !store::delete_chat(&state.pool, &id).await.map_err(internal)? {
        return Err(not_found("chat not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============ Messages ============

#[derive(Deserialize)]
struct SendMessage {
    chat_id: String,
    content: String,
}

async fn list_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<Vec<Message>>, AppError> {
    if store::get_chat(&state.pool, &chat_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(not_found("chat not found"));
    }
    let messages = store::list_messages(&state.pool, &chat_id)
        .await
        .map_err(internal)?;
    Ok(Json(messages))
}

/// Persist the user message, broadcast it, spawn the answer run, and return
/// immediately. The run's outcome arrives on the chat's event topic.
async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessage>,
) -> Result<Json<Message>, AppError> {
    if req.content.trim().is_empty() {
        return Err(bad_request("message content must not be empty"));
    }

    let Some(chat) = store::get_chat(&state.pool, &req.chat_id)
        .await
        .map_err(internal)?
    else {
        return Err(not_found("chat not found"));
    };

    let user_message =
        store::insert_message(&state.pool, &chat.id, "user", req.content.trim(), None, None)
            .await
            .map_err(internal)?;

    state.hub.publish(
        &Topic::Chat(chat.id.clone()),
        Event::UserMessage {
            message: user_message.clone(),
        },
    );

    let runner = AnswerRunner {
        pool: state.pool.clone(),
        hub: Arc::clone(&state.hub),
        embedder: Arc::clone(&state.embedder),
        llm: Arc::clone(&state.llm),
        system_prompt: state.config.chat.system_prompt.clone(),
        top_k: state.config.retrieval.top_k,
    };
    let question = req.content.trim().to_string();
    tokio::spawn(async move {
        runner.respond(chat, question).await;
    });

    Ok(Json(user_message))
}

// ============ WebSocket feeds ============

async fn ws_area(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let receiver = state.hub.subscribe(Topic::Area(id));
    ws.on_upgrade(move |socket| forward_events(socket, receiver))
}

async fn ws_chat(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let receiver = state.hub.subscribe(Topic::Chat(id));
    ws.on_upgrade(move |socket| forward_events(socket, receiver))
}

/// Forward hub events to one WebSocket client until either side goes away.
/// A lagging client silently loses the oldest events.
async fn forward_events(mut socket: WebSocket, mut receiver: broadcast::Receiver<Event>) {
    loop {
        tokio::select! {
            event = receiver.recv() => match event {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if socket.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "websocket subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }
}
