//! # Doc Intake
//!
//! A batch document-ingest pipeline over local directories and S3 buckets.
//!
//! Files dropped into an input prefix are partitioned by type, checked
//! against a content-hash registry, staged into an isolated run workspace,
//! optionally classified and routed to label-specific processing, extracted
//! by per-type jobs, imported into a search index, and finally registered so
//! later runs recognize them as duplicates.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌────────────┐
//! │  input   │──▶│ partition │──▶│  dedup   │──▶│   stage    │
//! │  prefix  │   │  by type  │   │ registry │   │ workspace  │
//! └──────────┘   └─────┬─────┘   └────┬─────┘   └─────┬──────┘
//!                      ▼              ▼               ▼
//!                   reject/        reject/      classify ─▶ route
//!                 unsupported    duplicates           │
//!                                                     ▼
//!                          registry ◀── search ◀── jobs (label ∥ type)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! intake init                       # create database
//! intake check                      # validate configuration
//! intake run                        # process the input prefix once
//! intake run --folder 2026/batch-7  # only a sub-prefix
//! intake registry count
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`storage`] | Local/S3 path abstraction, hashing, staging helpers |
//! | [`registry`] | Content-hash registry and duplicate detection |
//! | [`router`] | Classifier fragment parsing and label routing |
//! | [`orchestrator`] | The staged pipeline |
//! | [`processors`] | Built-in processors and archive expansion |
//! | [`jobs`] | Local and external job runners |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod classifier;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod migrate;
pub mod models;
pub mod operation;
pub mod orchestrator;
pub mod processors;
pub mod progress;
pub mod registry;
pub mod render;
pub mod results;
pub mod router;
pub mod search_index;
pub mod storage;
pub mod workspace;
