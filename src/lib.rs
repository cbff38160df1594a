//! Bibrecon: reconciliation of a library-catalog dump against a digitized-holdings dump
//!
//! This crate finds inconsistencies between two independently maintained datasets: catalog
//! editions that claim a digitized holding, and holdings that link back to catalog editions.
//! It runs as a sequential batch pipeline:
//!
//! 1. **Load Pass** -- Stream both dumps line by line into a normalized SQLite store,
//!    committing in bounded batches
//! 2. **Resolution Pass** (optional) -- Follow redirect chains to terminal identifiers and
//!    persist two key-value indices: redirect origin to terminal edition, and holding to
//!    terminal work
//! 3. **Report Pass** -- Run a fixed set of set-difference and join queries and write each
//!    as a tab-separated report; non-fatal anomalies go to a cumulative error log
//!
//! # Architecture
//!
//! - **Streaming parsing** -- One reusable line buffer per dump; `.bz2` and `.gz` are
//!   decompressed on the fly. Malformed lines are skipped and counted, never fatal
//! - **Batched loading** -- A failed batch rolls back alone; earlier batches stay committed
//! - **Memoized resolution** -- Each redirect chain is walked once; cycles and dangling
//!   targets become unresolved outcomes instead of errors
//! - **Deterministic reports** -- Every report query has a fixed row order
//!
//! # Key Modules
//!
//! - [`parser`] -- Dump opening, decompression, and line splitting
//! - [`catalog`] -- Catalog dump reader (editions, redirects, works)
//! - [`holdings`] -- Holdings dump reader (JSON lines or TSV) with ISBN-13 normalization
//! - [`store`] -- Normalized SQLite store with batched loads
//! - [`resolver`] -- Redirect graph and memoized, cycle-safe resolution
//! - [`index`] -- redb-backed redirect and item-map indices
//! - [`reports`] -- Report engine
//! - [`error_log`] -- Cumulative append-only anomaly log
//! - [`pipeline`] -- Phase entry points used by the CLI
//! - [`models`] -- Core data types (Edition, Redirect, HoldingItem, Resolution)
//! - [`stats`] -- Parse, load, and resolution counters
//! - [`config`] -- Run configuration and constants
//!
//! # Example Usage
//!
//! ```bash
//! # Parse and load both dumps
//! bibrecon create-db --catalog ol_dump_latest.txt.gz --holdings inlibrary.jsonl
//!
//! # Resolve redirects, then write every report
//! bibrecon resolve-redirects
//! bibrecon all-reports
//!
//! # Or everything at once
//! bibrecon -v run --catalog ol_dump_latest.txt.gz --holdings inlibrary.jsonl
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod error_log;
pub mod holdings;
pub mod index;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod reports;
pub mod resolver;
pub mod stats;
pub mod store;
