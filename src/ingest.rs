//! Document ingestion pipeline.
//!
//! Drives one document through extract → chunk → embed → persist, owning the
//! `Uploaded -> Processing -> {Completed | Failed}` state machine and
//! publishing progress events to the owning area's topic along the way.
//!
//! Runs are detached from the request that triggered them: [`trigger`]
//! validates synchronously, spawns the run with its own clone of the pool
//! and hub, and returns. Failures inside a run never propagate back to the
//! caller; they are recorded on the document row and broadcast. The status
//! check in [`trigger`] is the only re-entrancy guard; there is no
//! distributed lock, so two near-simultaneous triggers can both pass it
//! before either flips the status.

use std::sync::Arc;

use sqlx::SqlitePool;
use thiserror::Error;

use crate::chunker;
use crate::config::ChunkingConfig;
use crate::embedding::{vec_to_blob, EmbeddingClient};
use crate::events::{Event, EventHub, Topic};
use crate::extract::{self, FileKind};
use crate::models::{Chunk, Document, ProcessingStatus};
use crate::store;

/// Synchronous validation failures for an ingestion trigger. Anything that
/// happens after the spawn is reported via the document row and the event
/// stream instead.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("document not found")]
    NotFound,
    #[error("document is already being processed")]
    AlreadyProcessing,
}

/// Validate and start an ingestion run for a document.
///
/// Returns as soon as the run is spawned; the caller does not wait for
/// completion.
pub async fn trigger(
    pool: &SqlitePool,
    hub: &Arc<EventHub>,
    embedder: &Arc<EmbeddingClient>,
    chunking: &ChunkingConfig,
    document_id: &str,
) -> Result<(), IngestError> {
    let document = store::get_document(pool, document_id)
        .await
        .map_err(|e| {
            tracing::error!(document_id, error = %e, "trigger lookup failed");
            IngestError::NotFound
        })?
        .ok_or(IngestError::NotFound)?;

    if document.processing_status == ProcessingStatus::Processing {
        return Err(IngestError::AlreadyProcessing);
    }

    let pool = pool.clone();
    let hub = Arc::clone(hub);
    let embedder = Arc::clone(embedder);
    let chunking = chunking.clone();
    let document_id = document_id.to_string();
    tokio::spawn(async move {
        run(pool, hub, embedder, chunking, document_id).await;
    });

    Ok(())
}

/// Execute one ingestion run to completion. Never returns an error: a
/// failing step flips the document to `Failed` and broadcasts the message.
pub async fn run(
    pool: SqlitePool,
    hub: Arc<EventHub>,
    embedder: Arc<EmbeddingClient>,
    chunking: ChunkingConfig,
    document_id: String,
) {
    let document = match store::get_document(&pool, &document_id).await {
        Ok(Some(doc)) => doc,
        Ok(None) => return,
        Err(e) => {
            tracing::error!(%document_id, error = %e, "ingestion aborted: lookup failed");
            return;
        }
    };

    let area_id = document.area_id.clone();
    match process(&pool, &hub, &embedder, &chunking, &document).await {
        Ok(chunk_count) => {
            tracing::info!(%document_id, chunk_count, "ingestion completed");
            publish_progress(&hub, &area_id, &document_id, ProcessingStatus::Completed, 100, None);
        }
        Err(e) => {
            let message = e.to_string();
            tracing::warn!(%document_id, error = %message, "ingestion failed");
            if let Err(e) = store::mark_document_failed(&pool, &document_id, &message).await {
                tracing::error!(%document_id, error = %e, "failed to record ingestion failure");
            }
            publish_progress(
                &hub,
                &area_id,
                &document_id,
                ProcessingStatus::Failed,
                0,
                Some(message),
            );
        }
    }
}

async fn process(
    pool: &SqlitePool,
    hub: &Arc<EventHub>,
    embedder: &Arc<EmbeddingClient>,
    chunking: &ChunkingConfig,
    document: &Document,
) -> anyhow::Result<usize> {
    store::set_document_status(pool, &document.id, ProcessingStatus::Processing).await?;
    publish_progress(hub, &document.area_id, &document.id, ProcessingStatus::Processing, 10, None);

    let kind = FileKind::from_file_name(&document.file_name)?;
    let text = extract::extract_text(std::path::Path::new(&document.file_path), kind).await?;
    publish_progress(hub, &document.area_id, &document.id, ProcessingStatus::Processing, 30, None);

    let pieces = chunker::split(&text, chunking.chunk_size, chunking.overlap);
    publish_progress(hub, &document.area_id, &document.id, ProcessingStatus::Processing, 50, None);

    let contents: Vec<String> = pieces.iter().map(|p| p.content.clone()).collect();
    let vectors = embedder.embed_many(&contents).await?;
    publish_progress(hub, &document.area_id, &document.id, ProcessingStatus::Processing, 80, None);

    let chunks: Vec<Chunk> = pieces
        .into_iter()
        .zip(vectors.iter())
        .map(|(piece, vector)| Chunk {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document.id.clone(),
            content: piece.content,
            chunk_index: piece.index,
            embedding: vec_to_blob(vector),
            metadata: None,
        })
        .collect();

    let chunk_count = chunks.len();
    store::complete_ingestion(pool, &document.id, &document.area_id, &chunks).await?;

    Ok(chunk_count)
}

fn publish_progress(
    hub: &Arc<EventHub>,
    area_id: &str,
    document_id: &str,
    status: ProcessingStatus,
    progress: u8,
    error: Option<String>,
) {
    hub.publish(
        &Topic::Area(area_id.to_string()),
        Event::DocumentProgress {
            document_id: document_id.to_string(),
            status: status.as_str().to_string(),
            progress,
            error,
        },
    );
}
