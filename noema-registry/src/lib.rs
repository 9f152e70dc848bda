//! Tool catalog: in-memory registry loaded from the store, plus input schema validation
//! (§4.D).

pub mod registry;
pub mod validation;

pub use registry::ToolRegistry;
pub use validation::{validate, ValidationError};
