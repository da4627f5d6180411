//! Traceline: telemetry pipeline for AI coding sessions.
//!
//! Clients on developer machines emit events (session start/end, git
//! activity) and upload raw transcripts; this server ingests events
//! through a durable stream, resolves workspace/device identity, drives
//! each session through its lifecycle, parses transcripts in the
//! background, and fans real-time updates out to WebSocket subscribers.

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]

/// HTTP and WebSocket surface.
pub mod api;
/// Transcript blob storage.
pub mod blob;
/// Server configuration.
pub mod config;
/// Core domain types: events, sessions, lifecycle, identity, errors.
pub mod core;
/// Event processing and per-type handlers.
pub mod ingest;
/// Transcript pipeline and stuck-session recovery.
pub mod pipeline;
/// Persistent storage (SQLite).
pub mod store;
/// Durable stream transport and consumer loop.
pub mod stream;
/// Optional session summarization.
pub mod summary;
