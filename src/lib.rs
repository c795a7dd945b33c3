//! # TableLens
//!
//! Vision-first extraction, summarization, and cited retrieval of tables in
//! financial PDF documents.
//!
//! TableLens ingests a PDF by rendering every page to an image, detecting
//! table regions visually, cropping each region to a PNG, and summarizing the
//! crops with a multimodal model. The summaries (plus optional page text) are
//! embedded into a per-document vector index; questions are answered from the
//! top-ranked entries only, with citations pointing back at the exact table
//! images the answer came from.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────┐   ┌──────────┐
//! │   PDF    │──▶│     Pipeline      │──▶│  SQLite   │
//! │  pages   │   │ Detect+Crop+Summ. │   │ entries+  │
//! └──────────┘   └───────────────────┘   │ vectors   │
//!                                        └────┬─────┘
//!                                             ▼
//!                                       ┌──────────┐
//!                                       │   HTTP   │
//!                                       │  facade  │
//!                                       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! # async fn start() -> anyhow::Result<()> {
//! let config = tablelens::config::load_config(Path::new("tablelens.toml"))?;
//! tablelens::server::run(&config).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`raster`] | PDF page rendering |
//! | [`detect`] | Table region detection |
//! | [`crop`] | Region crop extraction |
//! | [`summarize`] | Bounded-pool visual summarization |
//! | [`index`] | Index build and replacement |
//! | [`query`] | Retrieval, citations, and synthesis |
//! | [`pipeline`] | Ingestion orchestration |
//! | [`server`] | HTTP facade |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod crop;
pub mod db;
pub mod detect;
pub mod document;
pub mod embedding;
pub mod error;
pub mod index;
pub mod migrate;
pub mod models;
pub mod openrouter;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod raster;
pub mod server;
pub mod summarize;
pub mod synthesis;
