//! Streaming chat client for Ollama.
//!
//! `POST /api/chat` with `stream: true` returns newline-delimited JSON; each
//! line carries a message fragment and the final line sets `done`. The
//! stream returned by [`LlmClient::generate_stream`] yields each non-empty
//! fragment as it arrives and terminates at the `done` marker. A connection
//! failure mid-stream, or the body ending without a `done` marker, surfaces
//! as an `Err` item so callers can distinguish a truncated answer from a
//! complete one.

use anyhow::{bail, Result};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::OllamaConfig;

pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f64,
    num_predict: u32,
}

struct StreamState {
    bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buf: String,
    pending: VecDeque<String>,
    done: bool,
    eof: bool,
}

impl LlmClient {
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.chat_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.chat_model.clone(),
            temperature: config.temperature,
            num_predict: config.num_predict,
        })
    }

    /// Open a token stream for one generation.
    ///
    /// The request carries the system instruction and the fully built
    /// grounding prompt; generation parameters come from configuration.
    pub async fn generate_stream(
        &self,
        system: &str,
        prompt: &str,
    ) -> Result<impl Stream<Item = Result<String>> + Send + 'static> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
            "stream": true,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.num_predict,
            },
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "generation request failed (is Ollama running at {}?): {}",
                    self.base_url,
                    e
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("generation API error {}: {}", status, body_text);
        }

        let state = StreamState {
            bytes: response.bytes_stream().boxed(),
            buf: String::new(),
            pending: VecDeque::new(),
            done: false,
            eof: false,
        };

        Ok(futures_util::stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(token) = state.pending.pop_front() {
                    return Ok(Some((token, state)));
                }
                if state.done {
                    return Ok(None);
                }
                if state.eof {
                    bail!("generation stream ended before completion");
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        state.buf.push_str(&String::from_utf8_lossy(&chunk));
                        drain_lines(&mut state);
                    }
                    Some(Err(e)) => bail!("generation stream failed: {}", e),
                    None => {
                        // Body ended. A trailing unterminated line may still
                        // hold the done marker.
                        if !state.buf.trim().is_empty() {
                            let line = std::mem::take(&mut state.buf);
                            consume_line(&line, &mut state);
                        }
                        state.eof = true;
                    }
                }
            }
        }))
    }
}

/// Split complete lines off the buffer and consume each.
fn drain_lines(state: &mut StreamState) {
    while let Some(pos) = state.buf.find('\n') {
        let line: String = state.buf.drain(..=pos).collect();
        consume_line(&line, state);
        if state.done {
            state.buf.clear();
            return;
        }
    }
}

/// Parse one NDJSON line into the pending token queue. Malformed lines are
/// skipped.
fn consume_line(line: &str, state: &mut StreamState) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let Ok(json) = serde_json::from_str::<serde_json::Value>(line) else {
        return;
    };
    if let Some(content) = json["message"]["content"].as_str() {
        if !content.is_empty() {
            state.pending.push_back(content.to_string());
        }
    }
    if json["done"].as_bool() == Some(true) {
        state.done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use httpmock::prelude::*;

    fn test_client(base_url: &str) -> LlmClient {
        let config = OllamaConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        };
        LlmClient::new(&config).unwrap()
    }

    fn ndjson(lines: &[serde_json::Value]) -> String {
        lines
            .iter()
            .map(|l| l.to_string())
            .collect::<Vec<_>>()
            .join("\n")
            + "\n"
    }

    #[tokio::test]
    async fn yields_tokens_in_order_until_done() {
        let server = MockServer::start_async().await;
        let body = ndjson(&[
            serde_json::json!({"message": {"content": "<p>Hel"}, "done": false}),
            serde_json::json!({"message": {"content": "lo"}, "done": false}),
            serde_json::json!({"message": {"content": "</p>"}, "done": false}),
            serde_json::json!({"message": {"content": ""}, "done": true}),
            serde_json::json!({"message": {"content": "ignored"}, "done": false}),
        ]);
        server
            .mock_async(move |when, then| {
                when.method(POST).path("/api/chat");
                then.status(200).body(body);
            })
            .await;

        let client = test_client(&server.base_url());
        let stream = client.generate_stream("system", "prompt").await.unwrap();
        let tokens: Vec<String> = stream.try_collect().await.unwrap();
        assert_eq!(tokens, vec!["<p>Hel", "lo", "</p>"]);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let server = MockServer::start_async().await;
        let body = format!(
            "{}\nnot json at all\n{}\n",
            serde_json::json!({"message": {"content": "ok"}, "done": false}),
            serde_json::json!({"done": true}),
        );
        server
            .mock_async(move |when, then| {
                when.method(POST).path("/api/chat");
                then.status(200).body(body);
            })
            .await;

        let client = test_client(&server.base_url());
        let stream = client.generate_stream("system", "prompt").await.unwrap();
        let tokens: Vec<String> = stream.try_collect().await.unwrap();
        assert_eq!(tokens, vec!["ok"]);
    }

    #[tokio::test]
    async fn error_status_fails_the_call() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/chat");
                then.status(404).body("model not found");
            })
            .await;

        let client = test_client(&server.base_url());
        let err = client.generate_stream("system", "prompt").await.err().unwrap();
        assert!(err.to_string().contains("generation API error"));
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let server = MockServer::start_async().await;
        let body = ndjson(&[
            serde_json::json!({"message": {"content": "partial"}, "done": false}),
        ]);
        server
            .mock_async(move |when, then| {
                when.method(POST).path("/api/chat");
                then.status(200).body(body);
            })
            .await;

        let client = test_client(&server.base_url());
        let stream = client.generate_stream("system", "prompt").await.unwrap();
        let result: Result<Vec<String>> = stream.try_collect().await;
        assert!(result.is_err());
    }
}
