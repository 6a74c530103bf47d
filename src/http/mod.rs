//! HTTP layer for the package registry caching proxy.
//!
//! This module provides the axum-based HTTP server that receives artifact
//! requests, builds the per-request context from caller credentials, routes
//! them through the resolver, and streams the winning byte stream back.

pub mod handler;
