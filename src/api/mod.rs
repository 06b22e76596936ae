//! HTTP API Module
//!
//! Provides the membership REST API served by every node.

mod http;

pub use http::{AppState, HttpServer, MembersResponse, HealthResponse, ErrorResponse};
