//! Worldhub - a gateway for per-user workspace containers
//!
//! This library provides a reverse-proxy gateway that:
//! - Maps each authenticated user to one isolated workspace container
//! - Provisions containers on demand, with single-flight deduplication
//! - Allocates non-conflicting host ports for new workspaces
//! - Polls freshly started containers until they accept HTTP traffic
//! - Routes HTTP requests and WebSocket upgrades to the right workspace
//! - Tears down workspaces on idle timeout, external pruning, or shutdown

pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod session;
