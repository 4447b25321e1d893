//! # Courier Core - Message Routing Engine
//!
//! Routing core for a healthcare integration engine:
//! - Immutable envelopes with lazily parsed, cached payloads
//! - Bounded per-item queues (FIFO, priority, unordered) with overflow policies
//! - Hosts with a hook pipeline and a validated lifecycle
//! - Supervised workers: cooperative, thread pool or isolated child processes
//! - Circuit breakers and token-bucket rate limiting
//! - Hot reload of the item graph without dropping in-flight messages
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──────────────────────────────────────┐
//!   send(envelope) ──► │               Router                 │
//!                      │  registry ─► breaker ─► host queue   │
//!                      └──────────────┬───────────────────────┘
//!                                     │
//!            ┌────────────────────────┼────────────────────────┐
//!            ▼                        ▼                        ▼
//!     ┌─────────────┐          ┌─────────────┐          ┌─────────────┐
//!     │ Host  (sup) │          │ Host  (sup) │          │ Host  (sup) │
//!     │ queue       │          │ queue       │  forward │ queue       │
//!     │ workers ────┼─────────►│ workers ────┼─────────►│ workers     │
//!     └─────────────┘          └─────────────┘          └─────────────┘
//! ```
//!
//! The [`engine::ProductionEngine`] owns the graph; each host has one
//! supervisor task that owns its workers.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod audit;
pub mod engine;
pub mod envelope;
pub mod events;
pub mod host;
pub mod queue;
pub mod resilience;
pub mod router;
pub mod supervisor;
pub mod types;

// Internal utilities
pub mod observability;
pub mod validation;

pub use engine::{ProductionEngine, ProductionEngineBuilder};
pub use envelope::{Envelope, ParserRegistry};
pub use host::{HostCatalog, HostHooks};
pub use types::{Config, Error, Result};
