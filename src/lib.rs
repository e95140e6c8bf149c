//! # Research Forge
//!
//! A retrieval-augmented research store for cybersecurity technique
//! documentation.
//!
//! Research Forge maintains a durable queue of "research this technique on
//! this platform" tasks, grounds an LLM generation pass with
//! similarity-searched reference material, and persists one structured,
//! scored research document per (technique, platform) key with full-text
//! search over the result.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌────────────┐
//! │ Reference  │──▶│ Chunk+Embed │──▶│   SQLite   │
//! │ documents  │   │  (ingest)   │   │ chunks+vec │
//! └────────────┘   └─────────────┘   └─────┬──────┘
//!                                          │ search
//! ┌────────────┐   ┌────────────┐   ┌──────▼──────┐   ┌───────────┐
//! │ Task Queue │──▶│   Worker   │──▶│  Retrieval  │──▶│ Generator │
//! │  (claims)  │◀──│    loop    │   │  (context)  │   │  (Ollama) │
//! └────────────┘   └─────┬──────┘   └─────────────┘   └───────────┘
//!                        │ upsert
//!                  ┌─────▼─────────────────────────────────┐
//!                  │ Output Store (merge, scoring, search) │
//!                  └───────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rforge init                                  # create database
//! rforge ingest ./reference --platform windows # index reference material
//! rforge enqueue T1055 --platform windows --name "Process Injection"
//! rforge run --once                            # drain the queue
//! rforge search "credential dumping" --platform windows
//! rforge stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Engine error taxonomy |
//! | [`chunk`] | Paragraph-boundary text splitting |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | SQLite-backed vector index |
//! | [`retrieval`] | Context retrieval and packing |
//! | [`queue`] | Durable task queue with leased claims |
//! | [`store`] | Research output store with scoring and FTS |
//! | [`scoring`] | Deterministic quality/completeness scoring |
//! | [`generation`] | Generation adapter (Ollama) |
//! | [`worker`] | Claim → retrieve → generate → upsert loop |
//! | [`ingest`] | Reference document ingestion |
//! | [`stats`] | Operator statistics overview |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod retrieval;
pub mod scoring;
pub mod stats;
pub mod store;
pub mod worker;
