//! # gattbridge-adapter-http-axum
//!
//! HTTP adapter built on [axum](https://docs.rs/axum).
//!
//! ## Responsibilities
//!
//! - Serve a small read-only JSON API for inspecting the bridge:
//!   `/health`, `/api/endpoints`, and per-attribute reads.
//! - Map HTTP requests into [`BridgeHandle`](gattbridge_app::bridge::BridgeHandle)
//!   calls (driving adapter).
//! - Map bridge failures into HTTP responses with appropriate status codes.
//!
//! All mutation goes through the data-model server, not this surface; the
//! API exists for operators to see what the bridge sees.
//!
//! ## Dependency rule
//!
//! Depends on `gattbridge-app` (bridge handle and data-model port) and
//! `gattbridge-domain` (ids and errors used in request/response mapping).
//! Never leaks axum types into the domain.

pub mod api;
pub mod error;
pub mod router;
pub mod state;
