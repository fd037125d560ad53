//! Gator - A command-line RSS aggregator
//!
//! Users register, add and follow RSS feeds, and run a long-lived collector
//! that fetches the least recently fetched feed on a fixed interval and stores
//! its posts in SQLite for browsing.

pub mod commands;
pub mod config;
pub mod dates;
pub mod db;
pub mod fetcher;
pub mod ingest;
pub mod scheduler;
