//! Remote runtime adapters (§4.E): a uniform `Runtime` trait implemented by ComfyDeploy
//! (async, webhook-driven), OpenAI/DALL-E (synchronous), and VastAI training (long-lived,
//! SSH-polled).

pub mod comfy_deploy;
pub mod openai;
pub mod runtime;
pub mod vastai;

pub use comfy_deploy::ComfyDeployRuntime;
pub use openai::OpenAiRuntime;
pub use runtime::{NormalizedEvent, NormalizedStatus, Runtime, RuntimeError, SubmitOutcome};
pub use vastai::{ArtifactDestination, VastAiRuntime};
