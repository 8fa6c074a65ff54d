//! Per-connection session engine and fan-out router for a realtime
//! event-delivery service (WebSocket + SSE), fed by a single Redis pub/sub
//! dispatch stream.
//!
//! This crate is library-only: process bootstrap, signal handling, and
//! logging initialization are left to the embedding binary, matching how
//! `services/server` keeps that wiring in `main.rs` rather than `lib.rs`.

pub mod config;
pub mod connection;
pub mod dedup;
pub mod digest;
pub mod error;
pub mod event_map;
pub mod handler;
pub mod metrics;
pub mod resume;
pub mod server;

pub use config::Config;
pub use error::SessionError;
pub use server::{build_router, Admission, GatewayState};
