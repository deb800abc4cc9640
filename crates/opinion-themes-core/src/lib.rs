//! # Opinion Themes Core
//!
//! Shared, I/O-free logic for Opinion Themes: data models, error kinds,
//! the embedding client trait and vector helpers, the incremental
//! similarity engine, and the cluster store contract with its in-memory
//! and fixture adapters.
//!
//! This crate contains no tokio, sqlx, or network dependencies. Provider
//! clients, the SQLite adapter, and the batch orchestrator live in the
//! `opinion-themes` app crate.

pub mod embedding;
pub mod error;
pub mod models;
pub mod similarity;
pub mod store;
pub mod title;
