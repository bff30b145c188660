//! Streaming answer generation for chat turns.
//!
//! One run per user message: embed the question, retrieve grounding context,
//! stream tokens from the model, and finalize. Live token events carry a
//! tag-stripped rendering of each fragment for readable incremental display;
//! the persisted answer is built by sanitizing the full accumulated buffer,
//! never by concatenating the stripped fragments.
//!
//! A failure anywhere (embedding, retrieval, or a broken stream) broadcasts
//! a `stream_error` event and persists nothing beyond the already-saved user
//! message.

use std::sync::Arc;

use anyhow::Result;
use futures_util::{pin_mut, StreamExt};
use sqlx::SqlitePool;

use crate::embedding::EmbeddingClient;
use crate::events::{Event, EventHub, Topic};
use crate::llm::LlmClient;
use crate::models::{Chat, ChunkMatch, SourceRef};
use crate::retrieve;
use crate::sanitize;
use crate::store;

/// Everything a detached answer run needs, cloned out of the server state so
/// the run outlives the request that spawned it.
pub struct AnswerRunner {
    pub pool: SqlitePool,
    pub hub: Arc<EventHub>,
    pub embedder: Arc<EmbeddingClient>,
    pub llm: Arc<LlmClient>,
    pub system_prompt: String,
    pub top_k: usize,
}

impl AnswerRunner {
    /// Produce and persist the assistant's answer for one user message.
    /// Never returns an error; failures are broadcast to the chat topic.
    pub async fn respond(&self, chat: Chat, question: String) {
        let topic = Topic::Chat(chat.id.clone());

        if let Err(e) = self.generate(&chat, &question).await {
            let message = e.to_string();
            tracing::warn!(chat_id = %chat.id, error = %message, "answer run failed");
            self.hub.publish(
                &topic,
                Event::StreamError {
                    chat_id: chat.id.clone(),
                    error: message,
                },
            );
        }
    }

    async fn generate(&self, chat: &Chat, question: &str) -> Result<()> {
        let topic = Topic::Chat(chat.id.clone());

        let query_vector = self.embedder.embed(question).await?;
        let matches =
            retrieve::search(&self.pool, &chat.area_id, &query_vector, self.top_k).await?;
        tracing::debug!(chat_id = %chat.id, matches = matches.len(), "context retrieved");

        let context = build_context(&matches);
        let prompt = build_prompt(question, &context);

        let stream = self
            .llm
            .generate_stream(&self.system_prompt, &prompt)
            .await?;
        pin_mut!(stream);

        let mut buffer = String::new();
        while let Some(token) = stream.next().await {
            let token = token?;
            buffer.push_str(&token);

            // The stripped fragment is read-only UX; the source of truth is
            // the accumulated buffer sanitized below.
            let readable = sanitize::strip_tags(&token);
            if !readable.is_empty() {
                self.hub.publish(
                    &topic,
                    Event::AssistantToken {
                        chat_id: chat.id.clone(),
                        text: readable,
                    },
                );
            }
        }

        let html = sanitize::sanitize(&buffer);
        let plain = sanitize::plain_text(&html);
        let sources: Vec<SourceRef> = matches.iter().map(SourceRef::from).collect();
        let sources_json = serde_json::to_string(&sources)?;

        let message = store::insert_message(
            &self.pool,
            &chat.id,
            "assistant",
            &plain,
            Some(&html),
            Some(&sources_json),
        )
        .await?;

        self.hub.publish(&topic, Event::AssistantMessage { message });
        Ok(())
    }
}

/// Concatenate retrieved chunks as labeled source blocks.
fn build_context(matches: &[ChunkMatch]) -> String {
    matches
        .iter()
        .map(|m| format!("[Source: {}]\n{}", m.document_name, m.content))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// Inject the context ahead of the question, then the response-format
/// instruction. An empty context still produces a well-formed prompt; the
/// system instruction makes the model say it has nothing to cite.
fn build_prompt(question: &str, context: &str) -> String {
    format!(
        "Context from documents:\n{}\n\nUser question: {}\n\nProvide a detailed, well-formatted HTML response:",
        context, question
    )
}
