//! # Content Engine
//!
//! A typed content store with full-text search, file uploads, request
//! analytics and cache-coherent settings.
//!
//! Every content mutation keeps three views of the same data in step: the
//! primary record, a time-sorted view and the type's search index. A
//! background recorder batches HTTP request records and ages them out.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────────┐   ┌──────────────────────┐
//! │ HTTP / CLI │──▶│ ContentService │──▶│ Repository           │
//! │ (axum/cms) │   │ hooks + caps   │   │ T, T__sorted,        │
//! └─────┬──────┘   └────────────────┘   │ T__pending, slugs    │
//!       │                               └────┬───────────┬─────┘
//!       │ record()                           ▼           ▼
//!       ▼                              ┌──────────┐ ┌──────────┐
//! ┌────────────┐   batch insert        │ KvStore  │ │  FTS5    │
//! │ Analytics  │──────────────────────▶│ (SQLite) │ │ indexes  │
//! └────────────┘                       └──────────┘ └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cms init                         # create stores and indexes
//! cms serve                        # start the content API
//! cms search Review "coffee"
//! cms export Review --format csv
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`kv`] | Bucketed key-value store over SQLite |
//! | [`settings`] | Settings record and its in-memory cache |
//! | [`repository`] | Content CRUD, slugs, sorted view, pending bucket |
//! | [`sort`] | Per-type sort debouncing |
//! | [`search`] | Per-type full-text indexes |
//! | [`content`] | Hook-aware content operations |
//! | [`uploads`] | File uploads and their records |
//! | [`users`] | Users, credentials, recovery keys, tokens |
//! | [`analytics`] | Request capture, batching and the 14-day chart |
//! | [`export`] | CSV and JSON export |
//! | [`backup`] | `tar.gz` backups of stores, uploads and indexes |
//! | [`engine`] | Service wiring |
//! | [`server`] | Content HTTP API |
//! | [`config`] | TOML configuration parsing |
//! | [`demo`] | Sample content types |

pub mod analytics;
pub mod backup;
pub mod commands;
pub mod config;
pub mod content;
pub mod demo;
pub mod engine;
pub mod error;
pub mod export;
pub mod kv;
pub mod logging;
pub mod repository;
pub mod search;
pub mod server;
pub mod settings;
pub mod sort;
pub mod uploads;
pub mod users;

pub use engine::Engine;
pub use error::{EngineError, Result};
