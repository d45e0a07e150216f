//! Switchyard - a single-host versioned-deployment orchestrator
//!
//! This library watches a managed root directory for version folders and:
//! - Assigns each discovered version a stable port from a configured range
//! - Supervises one worker process per version, respawning on crash with
//!   crash-loop backoff
//! - Regenerates nginx config routing to every live version plus a pinned
//!   "current" default version, and signals nginx to reload
//! - Exposes a loopback HTTP control API to reconcile, inspect processes,
//!   repoint the default route, and shut down

pub mod admin;
pub mod config;
pub mod error;
pub mod meta;
pub mod nginx;
pub mod ports;
pub mod reconcile;
pub mod supervisor;
