//! # Agent Memory
//!
//! A segmentation, synchronization, and hybrid-retrieval engine for a
//! markdown memory corpus.
//!
//! Documents are plain markdown files under one root directory. The engine
//! splits them into heading-aware segments, keeps a searchable store in step
//! with the files, and answers keyword, vector, and hybrid (RRF) queries.
//! A file-backed mirror (a JSON index plus the root `main.md` document)
//! keeps metadata usable when no store is configured.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Files       │──▶│ Synchronizer │──▶│  Store       │
//! │ memory_files │   │ Segment+Embed│   │ FTS5+vectors │
//! └──────┬───────┘   └──────────────┘   └──────┬───────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐                      ┌──────────────┐
//! │   Mirror     │◀──── Memory ────────▶│ HybridEngine │
//! │ JSON+main.md │                      │   (RRF)      │
//! └──────────────┘                      └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! amem init                          # create directories and main.md
//! amem sync                          # index every document
//! amem search "deployment" --mode hybrid
//! amem goal add "Ship v1"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`segment`] | Heading-aware text segmentation |
//! | [`files`] | Document files under the root |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`store`] | Searchable store trait and backends |
//! | [`query`] | Lexical query parsing |
//! | [`sync`] | File-to-store synchronization |
//! | [`search`] | Keyword, vector, and hybrid search |
//! | [`mirror`] | JSON index and root document |
//! | [`index`] | Store-backed or mirror-only document index |
//! | [`memory`] | The memory context tying it together |

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod files;
pub mod index;
pub mod memory;
pub mod migrate;
pub mod mirror;
pub mod models;
pub mod query;
pub mod search;
pub mod segment;
pub mod store;
pub mod sync;
