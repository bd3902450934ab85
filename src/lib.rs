//! Subgate - a dynamic reverse proxy for ephemeral backends
//!
//! This library provides the data plane of a subdomain-routing gateway:
//! - Routes HTTP traffic to backends by the first label of the Host header
//! - Supports single-level wildcard routing keys (e.g. `pr-*`)
//! - Keeps backends fresh through TTL leases renewed by repeated adds,
//!   with no health probing and no background sweeper
//! - Accepts add/remove control actions from an external provisioning layer
//! - Uses connection pooling for efficient backend communication

pub mod api;
pub mod config;
pub mod control;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod routes;
