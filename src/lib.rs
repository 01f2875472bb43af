//! Resolve listing agents and discover FSBO listings for batches of U.S.
//! property addresses.
//!
//! The crate is organized around three layers: the scraper adapters (one
//! per upstream source, each behind a rate-limited [`gateway::Gateway`]),
//! the [`engine::Resolver`] that drives them in a waterfall-with-merge
//! discipline over a resumable SQLite cache, and the serving surface
//! (CLI batch mode and the axum server with SSE progress).

#![recursion_limit = "128"]

pub use anyhow::Result;

pub mod cache;
pub mod config;
pub mod engine;
pub mod enrich;
pub mod errors;
pub mod fsbo;
pub mod gateway;
pub mod input;
pub mod jobs;
pub mod models;
pub mod normalize;
pub mod output;
pub mod scrapers;
pub mod server;
