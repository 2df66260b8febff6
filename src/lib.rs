//! Commandpool - Shared Command Distribution Service
//!
//! This crate hands out short-lived shared text commands to anonymous
//! clients. Each command is shown to at most a fixed number of requests,
//! never to the client that submitted it while anything else is available,
//! and every client is held to a per-origin request rate. A background
//! sweeper ages out ingested commands and clears the pool once a day.

pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod ratelimit;
pub mod service;
pub mod store;
pub mod sweeper;
