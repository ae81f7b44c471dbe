//! feedsieve: a feed-ingestion proxy.
//!
//! Periodically fetches configured RSS/Atom sources, deduplicates and filters
//! their entries, stores them in SQLite and re-serves each source as a clean
//! RSS feed.
//!
//! - [`scheduler`] - when each source runs, one run per source at a time
//! - [`processor`] - fetch → parse → filter → persist for one source
//! - [`filter`] - per-source include/exclude rules
//! - [`feed`] - HTTP fetching, parsing and RSS rendering
//! - [`storage`] - repository traits and the SQLite implementation
//! - [`sources`] - sources file loading and the reloadable snapshot
//! - [`service`] / [`api`] - management and read operations over HTTP

pub mod api;
pub mod config;
pub mod feed;
pub mod filter;
pub mod processor;
pub mod scheduler;
pub mod service;
pub mod sources;
pub mod storage;
pub mod util;
