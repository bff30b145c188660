//! Brute-force vector retrieval.
//!
//! Scores every chunk of every `Completed` document in an area against the
//! query vector and returns the top K by cosine similarity. This is an
//! exhaustive linear scan, O(chunks × dimension) per query, re-read from the
//! store every call. Acceptable for the corpus sizes this service targets.
//! Equal similarities keep their scan order (documents by id, chunks by
//! index), so rankings are reproducible.

use anyhow::{bail, Result};
use sqlx::SqlitePool;

use crate::embedding::blob_to_vec;
use crate::models::ChunkMatch;
use crate::store;

/// Cosine similarity between two equal-length vectors, in `[-1, 1]`.
/// Zero-magnitude input yields 0 rather than dividing by zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return 0.0;
    }

    dot / denom
}

/// Return the `top_k` most similar completed chunks in the area, ordered by
/// descending similarity. Asking for more than exist returns them all.
pub async fn search(
    pool: &SqlitePool,
    area_id: &str,
    query_vector: &[f32],
    top_k: usize,
) -> Result<Vec<ChunkMatch>> {
    let candidates = store::fetch_area_candidates(pool, area_id).await?;

    let mut matches = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let vector = blob_to_vec(&candidate.embedding);
        if vector.len() != query_vector.len() {
            bail!(
                "embedding dimension mismatch: stored chunk {} has {} components, query has {}",
                candidate.chunk_id,
                vector.len(),
                query_vector.len()
            );
        }

        matches.push(ChunkMatch {
            similarity: cosine_similarity(query_vector, &vector),
            chunk_id: candidate.chunk_id,
            content: candidate.content,
            document_name: candidate.document_name,
            chunk_index: candidate.chunk_index,
        });
    }

    // Stable sort: ties keep candidate scan order.
    matches.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches.truncate(top_k);

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::vec_to_blob;
    use crate::models::{Chunk, ProcessingStatus};
    use crate::{db, migrate};

    #[test]
    fn identical_vectors_score_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_scores_zero() {
        let v = vec![1.0, 2.0];
        let zero = vec![0.0, 0.0];
        assert_eq!(cosine_similarity(&v, &zero), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero), 0.0);
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = vec![0.3, -1.2, 4.0];
        let b = vec![2.0, 0.5, -0.7];
        assert_eq!(cosine_similarity(&a, &b), cosine_similarity(&b, &a));
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    async fn seeded_pool(dir: &std::path::Path) -> SqlitePool {
        let pool = db::connect(&dir.join("kb.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    fn chunk(document_id: &str, index: i64, content: &str, vector: &[f32]) -> Chunk {
        Chunk {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            content: content.to_string(),
            chunk_index: index,
            embedding: vec_to_blob(vector),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn results_sorted_by_descending_similarity() {
        let dir = tempfile::tempdir().unwrap();
        let pool = seeded_pool(dir.path()).await;

        let area = store::create_area(&pool, "hr", None).await.unwrap();
        let doc = store::create_document(&pool, &area.id, "handbook.txt", "/tmp/h.txt", 10)
            .await
            .unwrap();
        let chunks = vec![
            chunk(&doc.id, 0, "mostly unrelated", &[0.0, 1.0]),
            chunk(&doc.id, 1, "exact match", &[1.0, 0.0]),
            chunk(&doc.id, 2, "halfway", &[1.0, 1.0]),
        ];
        store::complete_ingestion(&pool, &doc.id, &area.id, &chunks)
            .await
            .unwrap();

        let results = search(&pool, &area.id, &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].content, "exact match");
        assert_eq!(results[1].content, "halfway");
        assert_eq!(results[2].content, "mostly unrelated");
        assert!(results[0].similarity >= results[1].similarity);
        assert!(results[1].similarity >= results[2].similarity);
        assert_eq!(results[0].document_name, "handbook.txt");
    }

    #[tokio::test]
    async fn top_k_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let pool = seeded_pool(dir.path()).await;

        let area = store::create_area(&pool, "hr", None).await.unwrap();
        let doc = store::create_document(&pool, &area.id, "doc.txt", "/tmp/d.txt", 10)
            .await
            .unwrap();
        let chunks: Vec<Chunk> = (0..5)
            .map(|i| chunk(&doc.id, i, &format!("chunk {i}"), &[1.0, i as f32]))
            .collect();
        store::complete_ingestion(&pool, &doc.id, &area.id, &chunks)
            .await
            .unwrap();

        let results = search(&pool, &area.id, &[1.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn only_completed_documents_are_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let pool = seeded_pool(dir.path()).await;

        let area = store::create_area(&pool, "hr", None).await.unwrap();

        let done = store::create_document(&pool, &area.id, "done.txt", "/tmp/a.txt", 10)
            .await
            .unwrap();
        store::complete_ingestion(&pool, &done.id, &area.id, &[chunk(&done.id, 0, "visible", &[1.0, 0.0])])
            .await
            .unwrap();

        let pending = store::create_document(&pool, &area.id, "pending.txt", "/tmp/b.txt", 10)
            .await
            .unwrap();
        store::complete_ingestion(&pool, &pending.id, &area.id, &[chunk(&pending.id, 0, "hidden", &[1.0, 0.0])])
            .await
            .unwrap();
        store::set_document_status(&pool, &pending.id, ProcessingStatus::Processing)
            .await
            .unwrap();

        let results = search(&pool, &area.id, &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "visible");
    }

    #[tokio::test]
    async fn equal_similarity_keeps_scan_order() {
        let dir = tempfile::tempdir().unwrap();
        let pool = seeded_pool(dir.path()).await;

        let area = store::create_area(&pool, "hr", None).await.unwrap();
        let doc = store::create_document(&pool, &area.id, "doc.txt", "/tmp/d.txt", 10)
            .await
            .unwrap();
        // Same direction, different magnitude: identical cosine similarity.
        let chunks = vec![
            chunk(&doc.id, 0, "first", &[2.0, 0.0]),
            chunk(&doc.id, 1, "second", &[4.0, 0.0]),
        ];
        store::complete_ingestion(&pool, &doc.id, &area.id, &chunks)
            .await
            .unwrap();

        let results = search(&pool, &area.id, &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(results[0].content, "first");
        assert_eq!(results[1].content, "second");
    }

    #[tokio::test]
    async fn dimension_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = seeded_pool(dir.path()).await;

        let area = store::create_area(&pool, "hr", None).await.unwrap();
        let doc = store::create_document(&pool, &area.id, "doc.txt", "/tmp/d.txt", 10)
            .await
            .unwrap();
        store::complete_ingestion(&pool, &doc.id, &area.id, &[chunk(&doc.id, 0, "c", &[1.0, 0.0, 0.0])])
            .await
            .unwrap();

        let err = search(&pool, &area.id, &[1.0, 0.0], 10).await.unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
    }
}
