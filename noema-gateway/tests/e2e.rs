pub mod common;
mod mcp_flow;
mod rest_flow;
mod x402_flow;
