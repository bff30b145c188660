//! SQLite persistence for areas, documents, chunks, chats, and messages.
//!
//! All functions take a pool reference; callers (request handlers and
//! detached background runs alike) share the pool and acquire their own
//! connections per query. Cached counters on areas and chats are recomputed
//! by re-counting inside the same transaction as the mutation that changed
//! the child set, so a completed transaction always leaves counters equal to
//! the live count.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Area, Chat, Chunk, Document, Message, ProcessingStatus};

/// A retrieval candidate: one stored chunk joined with its document's name.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub content: String,
    pub document_name: String,
    pub chunk_index: i64,
    pub embedding: Vec<u8>,
}

fn area_from_row(row: &SqliteRow) -> Area {
    Area {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        document_count: row.get("document_count"),
        chat_count: row.get("chat_count"),
    }
}

fn document_from_row(row: &SqliteRow) -> Document {
    let status: String = row.get("processing_status");
    Document {
        id: row.get("id"),
        area_id: row.get("area_id"),
        file_name: row.get("file_name"),
        file_path: row.get("file_path"),
        file_size: row.get("file_size"),
        uploaded_at: row.get("uploaded_at"),
        processing_status: ProcessingStatus::parse(&status).unwrap_or(ProcessingStatus::Failed),
        chunk_count: row.get("chunk_count"),
        error_message: row.get("error_message"),
    }
}

fn chat_from_row(row: &SqliteRow) -> Chat {
    Chat {
        id: row.get("id"),
        area_id: row.get("area_id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
        last_message_at: row.get("last_message_at"),
        message_count: row.get("message_count"),
    }
}

fn message_from_row(row: &SqliteRow) -> Message {
    Message {
        id: row.get("id"),
        chat_id: row.get("chat_id"),
        role: row.get("role"),
        content: row.get("content"),
        content_html: row.get("content_html"),
        sources: row.get("sources"),
        created_at: row.get("created_at"),
    }
}

// ============ Areas ============

pub async fn create_area(
    pool: &SqlitePool,
    name: &str,
    description: Option<&str>,
) -> Result<Area> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO areas (id, name, description, created_at, updated_at, document_count, chat_count)
        VALUES (?, ?, ?, ?, ?, 0, 0)
        "#,
    )
    .bind(&id)
    .bind(name)
    .bind(description)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(Area {
        id,
        name: name.to_string(),
        description: description.map(|s| s.to_string()),
        created_at: now,
        updated_at: now,
        document_count: 0,
        chat_count: 0,
    })
}

pub async fn list_areas(pool: &SqlitePool) -> Result<Vec<Area>> {
    let rows = sqlx::query("SELECT * FROM areas ORDER BY created_at")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(area_from_row).collect())
}

pub async fn get_area(pool: &SqlitePool, id: &str) -> Result<Option<Area>> {
    let row = sqlx::query("SELECT * FROM areas WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(area_from_row))
}

/// Delete an area. Documents, chunks, chats, and messages cascade.
/// Returns the stored file paths of the area's documents so the caller can
/// remove them from disk, or `None` if the area did not exist.
pub async fn delete_area(pool: &SqlitePool, id: &str) -> Result<Option<Vec<String>>> {
    let paths: Vec<String> =
        sqlx::query_scalar("SELECT file_path FROM documents WHERE area_id = ?")
            .bind(id)
            .fetch_all(pool)
            .await?;

    let result = sqlx::query("DELETE FROM areas WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    Ok(Some(paths))
}

async fn recount_area_documents<'e, E>(executor: E, area_id: &str) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE areas
        SET document_count = (SELECT COUNT(*) FROM documents WHERE area_id = areas.id),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(Utc::now().timestamp())
    .bind(area_id)
    .execute(executor)
    .await?;
    Ok(())
}

async fn recount_area_chats<'e, E>(executor: E, area_id: &str) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE areas
        SET chat_count = (SELECT COUNT(*) FROM chats WHERE area_id = areas.id),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(Utc::now().timestamp())
    .bind(area_id)
    .execute(executor)
    .await?;
    Ok(())
}

// ============ Documents ============

pub async fn create_document(
    pool: &SqlitePool,
    area_id: &str,
    file_name: &str,
    file_path: &str,
    file_size: i64,
) -> Result<Document> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO documents (id, area_id, file_name, file_path, file_size, uploaded_at, processing_status, chunk_count)
        VALUES (?, ?, ?, ?, ?, ?, 'Uploaded', 0)
        "#,
    )
    .bind(&id)
    .bind(area_id)
    .bind(file_name)
    .bind(file_path)
    .bind(file_size)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    recount_area_documents(&mut *tx, area_id).await?;
    tx.commit().await?;

    Ok(Document {
        id,
        area_id: area_id.to_string(),
        file_name: file_name.to_string(),
        file_path: file_path.to_string(),
        file_size,
        uploaded_at: now,
        processing_status: ProcessingStatus::Uploaded,
        chunk_count: 0,
        error_message: None,
    })
}

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(document_from_row))
}

pub async fn list_documents(pool: &SqlitePool, area_id: &str) -> Result<Vec<Document>> {
    let rows = sqlx::query("SELECT * FROM documents WHERE area_id = ? ORDER BY uploaded_at")
        .bind(area_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(document_from_row).collect())
}

/// Delete a document (chunks cascade) and recount the area's counter in the
/// same transaction. Returns the stored file path, or `None` if absent.
pub async fn delete_document(pool: &SqlitePool, id: &str) -> Result<Option<String>> {
    let Some(doc) = get_document(pool, id).await? else {
        return Ok(None);
    };

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    recount_area_documents(&mut *tx, &doc.area_id).await?;
    tx.commit().await?;

    Ok(Some(doc.file_path))
}

pub async fn set_document_status(
    pool: &SqlitePool,
    id: &str,
    status: ProcessingStatus,
) -> Result<()> {
    sqlx::query("UPDATE documents SET processing_status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_document_failed(pool: &SqlitePool, id: &str, error: &str) -> Result<()> {
    sqlx::query("UPDATE documents SET processing_status = 'Failed', error_message = ? WHERE id = ?")
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Persist a finished ingestion run: all chunks in one batch, the document
/// flipped to `Completed` with its chunk count, and the area counter
/// recomputed, all in a single transaction.
pub async fn complete_ingestion(
    pool: &SqlitePool,
    document_id: &str,
    area_id: &str,
    chunks: &[Chunk],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, content, chunk_index, embedding, metadata)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(&chunk.content)
        .bind(chunk.chunk_index)
        .bind(&chunk.embedding)
        .bind(&chunk.metadata)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "UPDATE documents SET processing_status = 'Completed', chunk_count = ?, error_message = NULL WHERE id = ?",
    )
    .bind(chunks.len() as i64)
    .bind(document_id)
    .execute(&mut *tx)
    .await?;

    recount_area_documents(&mut *tx, area_id).await?;
    tx.commit().await?;
    Ok(())
}

// ============ Chunks ============

/// Fetch the retrieval candidate set for an area: every chunk of every
/// `Completed` document. Ordered by `(document_id, chunk_index)` so the scan
/// order (and therefore tie-breaking in the retriever's stable sort) is
/// deterministic.
pub async fn fetch_area_candidates(
    pool: &SqlitePool,
    area_id: &str,
) -> Result<Vec<ChunkCandidate>> {
    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.content, c.chunk_index, c.embedding, d.file_name
        FROM chunks c
        JOIN documents d ON d.id = c.document_id
        WHERE d.area_id = ? AND d.processing_status = 'Completed'
        ORDER BY c.document_id, c.chunk_index
        "#,
    )
    .bind(area_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ChunkCandidate {
            chunk_id: row.get("chunk_id"),
            content: row.get("content"),
            document_name: row.get("file_name"),
            chunk_index: row.get("chunk_index"),
            embedding: row.get("embedding"),
        })
        .collect())
}

// ============ Chats ============

pub async fn create_chat(pool: &SqlitePool, area_id: &str, name: &str) -> Result<Chat> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO chats (id, area_id, name, created_at, message_count)
        VALUES (?, ?, ?, ?, 0)
        "#,
    )
    .bind(&id)
    .bind(area_id)
    .bind(name)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    recount_area_chats(&mut *tx, area_id).await?;
    tx.commit().await?;

    Ok(Chat {
        id,
        area_id: area_id.to_string(),
        name: name.to_string(),
        created_at: now,
        last_message_at: None,
        message_count: 0,
    })
}

pub async fn get_chat(pool: &SqlitePool, id: &str) -> Result<Option<Chat>> {
    let row = sqlx::query("SELECT * FROM chats WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(chat_from_row))
}

pub async fn list_chats(pool: &SqlitePool, area_id: &str) -> Result<Vec<Chat>> {
    let rows = sqlx::query("SELECT * FROM chats WHERE area_id = ? ORDER BY created_at")
        .bind(area_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(chat_from_row).collect())
}

pub async fn delete_chat(pool: &SqlitePool, id: &str) -> Result<bool> {
    let Some(chat) = get_chat(pool, id).await? else {
        return Ok(false);
    };

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chats WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    recount_area_chats(&mut *tx, &chat.area_id).await?;
    tx.commit().await?;
    Ok(true)
}

// ============ Messages ============

/// Insert a message and update its chat's `last_message_at` and recomputed
/// `message_count` in one transaction.
pub async fn insert_message(
    pool: &SqlitePool,
    chat_id: &str,
    role: &str,
    content: &str,
    content_html: Option<&str>,
    sources: Option<&str>,
) -> Result<Message> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO messages (id, chat_id, role, content, content_html, sources, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(chat_id)
    .bind(role)
    .bind(content)
    .bind(content_html)
    .bind(sources)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE chats
        SET last_message_at = ?,
            message_count = (SELECT COUNT(*) FROM messages WHERE chat_id = chats.id)
        WHERE id = ?
        "#,
    )
    .bind(now)
    .bind(chat_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Message {
        id,
        chat_id: chat_id.to_string(),
        role: role.to_string(),
        content: content.to_string(),
        content_html: content_html.map(|s| s.to_string()),
        sources: sources.map(|s| s.to_string()),
        created_at: now,
    })
}

pub async fn list_messages(pool: &SqlitePool, chat_id: &str) -> Result<Vec<Message>> {
    let rows = sqlx::query("SELECT * FROM messages WHERE chat_id = ? ORDER BY created_at, id")
        .bind(chat_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(message_from_row).collect())
}
