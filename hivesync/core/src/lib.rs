//! # Hivesync
//!
//! Hivesync follows the Hive blockchain through a fleet of unreliable public API nodes. The
//! `hivesync-core` crate provides the streaming client and its building blocks for embedding into
//! other applications. Refer to the `hivesync` crate for the executable binary.

/// Static configuration of nodes, probes, client tuning and ingestion.
pub mod config;

/// Error types of the request path.
pub mod errors;

/// Events fed to consumers and the handler trait receiving them.
pub mod events;

/// Decaying averages used to grade nodes.
pub mod stats;

/// Client-side rate limit simulation.
pub mod rate_limit;

/// Transport abstraction and built-in implementations.
pub mod transport;

/// Clients of single public API nodes.
pub mod endpoint;

/// Pluggable ranking of nodes for business calls.
pub mod selector;

/// Fleet-wide execution of business calls.
pub mod dispatcher;

/// Operation type handlers.
pub mod registry;

/// Ordered block delivery driven by node heartbeats.
pub mod ingestion;

/// The streaming client tying all components together.
pub mod orchestrator;

/// Types related to handling long-running background services.
pub mod service;

/// Internal utilities.
mod utils;
