//! HTTP and WebSocket gateway for the Lynx agent fleet.
//!
//! Exposes the [`Fleet`](lynx_fleet::Fleet) operations as JSON endpoints
//! and streams fleet events to dashboards over a WebSocket.
//!
//! # Main types
//!
//! - [`GatewayServer`]: Builds the axum [`Router`](axum::Router) for a fleet.
//! - [`ApiError`]: Maps [`FleetError`](lynx_core::FleetError) onto HTTP status codes.

/// Error to HTTP response mapping.
pub mod error;
/// REST handlers for agents, tasks, and fleet control.
pub mod routes;
/// Router assembly, health check, and the event WebSocket.
pub mod server;

pub use error::ApiError;
pub use server::{AppState, GatewayServer};
