//! MCP/REST/x402 gateway over the lifecycle engine (§4.J): three public surfaces sharing
//! one `AppState`, so a tool invocation looks identical whether it came in over REST, MCP,
//! or a paid x402 request.

pub mod admin;
pub mod auth;
pub mod error;
pub mod mcp;
pub mod rest;
pub mod router;
pub mod state;
pub mod wallet_link;
pub mod webhook;
pub mod x402_routes;

pub use router::build;
pub use state::AppState;
