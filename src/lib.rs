//! Tierank - Progressive Tiered Document Ranking
//!
//! Ranks documents by embedding similarity to a query and streams the ranking
//! in tiers of increasing coverage, so a first ordering is available long
//! before every document has been embedded. Vectors are cached by document
//! identity and computed on a bounded pool of embedding workers.

pub mod cache;
pub mod cli;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod pool;
pub mod ranking;

pub use error::{Result, TierankError};
