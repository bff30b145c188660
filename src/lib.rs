//! # knowbase
//!
//! A self-hosted document ingestion and retrieval-augmented chat service.
//!
//! Users upload documents into named collections ("areas"); knowbase extracts
//! and chunks their text, embeds each chunk via a local Ollama instance, and
//! answers natural-language questions by retrieving the most relevant chunks
//! and streaming a generated answer back over a WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────┐   ┌──────────┐
//! │  Upload   │──▶│ Ingestion pipeline    │──▶│  SQLite   │
//! │ (HTTP)    │   │ extract→chunk→embed  │   │ + vectors │
//! └──────────┘   └──────────┬───────────┘   └────┬─────┘
//!                           │ progress            │ scan
//!                           ▼                     ▼
//!                    ┌──────────┐   ┌────────────────────┐
//!                    │ Event hub │◀──│ Answer orchestrator │◀── Ollama
//!                    │ (ws fan-  │   │ retrieve→generate  │
//!                    │  out)     │   │ →sanitize→persist  │
//!                    └──────────┘   └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Text extraction (pdf, docx, txt, md) |
//! | [`chunker`] | Sentence-boundary chunking with overlap |
//! | [`embedding`] | Ollama embedding client + vector byte codecs |
//! | [`llm`] | Streaming chat client for Ollama |
//! | [`retrieve`] | Brute-force cosine-similarity retrieval |
//! | [`ingest`] | Document ingestion orchestrator |
//! | [`answer`] | Streaming answer orchestrator |
//! | [`sanitize`] | HTML allow-list sanitization |
//! | [`events`] | Topic-scoped broadcast hub |
//! | [`store`] | SQLite persistence |
//! | [`server`] | HTTP API + WebSocket feeds |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod events;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod retrieve;
pub mod sanitize;
pub mod server;
pub mod store;
