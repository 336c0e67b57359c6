//! # Engine Warden - game-server engine supervisor
//!
//! Keeps a long-running game-server process ("the engine") alive and
//! up to date:
//! - Process watchdog with crash classification and exponential backoff
//! - Zero-downtime blue/green staging of new builds
//! - Reference-counted executable leases gating runtime upgrades
//! - Topic/bridge wire protocol with API-version negotiation
//!
//! ## Architecture
//!
//! Each component owns one mutex over its own state; none calls another
//! while holding it.
//! ```text
//!                  ┌──────────────────── Host ─────────────────────┐
//!   bridge TCP  →  │  TransportGateway ──events──▶ dispatch        │
//!                  │        ▲                        │             │
//!                  │        │ topic calls            ▼             │
//!                  │  ┌──────────┐ run_suspended ┌──────────────┐  │
//!                  │  │ Watchdog │◀──────────────│   Pipeline   │  │
//!                  │  └────┬─────┘               └──────┬───────┘  │
//!                  │       │ run-tool lease   build-tool│lease     │
//!                  │       ▼                            ▼          │
//!                  │  ┌──────────────── LockManager ─────────────┐ │
//!                  │  └──────────────────────────────────────────┘ │
//!                  └───────────────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod collab;
pub mod host;
pub mod locks;
pub mod pipeline;
pub mod transport;
pub mod types;
pub mod watchdog;

// Internal utilities
pub mod observability;
pub mod recovery;

pub use host::{Host, HostParts};
pub use types::{Config, Error, Result};
