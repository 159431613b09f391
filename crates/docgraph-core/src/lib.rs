//! # Docgraph Core
//!
//! Shared, pure logic for Docgraph: the data model, sentence-aware chunker,
//! ensemble extraction methods with majority voting, concept deduplication
//! (union-find), hierarchy building, and vector similarity utilities.
//!
//! This crate contains no tokio, sqlx, network, or filesystem dependencies.
//! Everything here is deterministic and synchronous; the `docgraph`
//! application crate supplies I/O, external services, and orchestration.

pub mod chunk;
pub mod dedup;
pub mod extract;
pub mod hierarchy;
pub mod methods;
pub mod models;
pub mod similarity;
