//! x402 micropayment entry point (§4.I): prices a tool as a 402 challenge, verifies a
//! signed EIP-3009 authorization against a facilitator, then runs the tool through the
//! normal lifecycle engine under a synthetic payer identity. The ledger is never touched.

pub mod challenge;
pub mod error;
pub mod facilitator;
pub mod flow;

pub use challenge::{build_challenge, PaymentRequirement, X402Challenge};
pub use error::X402Error;
pub use facilitator::{FacilitatorClient, FacilitatorSettlement, HttpFacilitatorClient, PaymentPayload};
pub use flow::X402Handler;
