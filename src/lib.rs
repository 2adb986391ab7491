//! Poolgate - a connection router for pooled on-demand worker processes
//!
//! This library provides a gateway that:
//! - Routes upgrade connections addressed as `/<class>-<index>` to pooled
//!   worker processes
//! - Creates workers lazily on first reference, on deterministic ports
//!   (`base_port + index`)
//! - Reuses a worker for its configured TTL, then retires it
//! - Sweeps expired workers in the background on a fixed interval
//! - Relays bytes bidirectionally between client and worker until either
//!   side closes
//! - Exposes read-only health and statistics endpoints

pub mod config;
pub mod error;
pub mod launcher;
pub mod registry;
pub mod router;
pub mod status;
pub mod sweeper;
pub mod tunnel;
