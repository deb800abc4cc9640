//! # Opinion Themes
//!
//! Batch clustering of citizen opinions into themes.
//!
//! Each run takes the opinions nobody has grouped yet, embeds them, sorts
//! each into the most similar existing theme (or starts a new one), gives
//! new themes a short title, and writes the grouping back in one
//! transaction so the portal can show it.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌────────────┐   ┌──────────┐
//! │  opinions  │──▶│  embedding │──▶│ similarity │──▶│  titles  │
//! │ (SQLite or │   │  provider  │   │   engine   │   │ provider │
//! │  fixture)  │   └────────────┘   └────────────┘   └────┬─────┘
//! └────────────┘                                          │
//!        ▲                 one transaction                ▼
//!        └──────────────────────────────────────── commit / rollback
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! themes init                     # create the schema
//! themes run --test-mode          # cluster the built-in fixture, write nothing
//! themes run                      # cluster unclustered opinions in the database
//! themes clusters                 # list stored themes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite cluster store |
//! | [`embedding`] | Embedding and title providers |
//! | [`retry`] | Backoff for provider calls |
//! | [`pipeline`] | The clustering run state machine |
//! | [`report`] | Run summaries and cluster listing |
//! | [`fixtures`] | Test-mode opinion sets |
//! | [`cluster_cmd`] | `themes run` wiring |
//!
//! Models, error kinds, the similarity engine, and the store traits live in
//! the `opinion-themes-core` crate.

pub mod cluster_cmd;
pub mod config;
pub mod db;
pub mod embedding;
pub mod fixtures;
pub mod migrate;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod sqlite_store;
