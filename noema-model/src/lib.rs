//! Shared domain types for the generation orchestrator: users, wallets, ledger entries,
//! tools, generations, cooks, spells, LoRAs, and API keys.
//!
//! This crate has no I/O and no business logic; it is the vocabulary every other crate in
//! the workspace shares. Persistence lives in `noema-store`, pricing/ledger math in
//! `noema-pricing`/`noema-ledger`, and state-machine behaviour in `noema-lifecycle`.

pub mod api_key;
pub mod cook;
pub mod error;
pub mod generation;
pub mod ids;
pub mod ledger;
pub mod lora;
pub mod spell;
pub mod tool;
pub mod user;
pub mod wallet;

pub use api_key::{ApiKey, ApiKeyPermission, ApiKeyStatus};
pub use cook::{Cook, CookConfig, CookStatus};
pub use error::{ErrorKind, NoemaError};
pub use generation::{
    DeliveryStatus, GenerationMetadata, GenerationRecord, GenerationStatus, NotificationPlatform,
    X402Settlement,
};
pub use ids::{
    CookId, DepositId, GenerationId, InvalidMasterAccountId, MasterAccountId, RunId, SpellCastId,
    ToolId,
};
pub use ledger::{Deposit, DepositOrigin, DepositOwner, DepositStatus};
pub use lora::{LoraModel, LoraPermission};
pub use spell::{CastStatus, Connection, Endpoint, Spell, SpellCast, SpellGraphError, SpellStep, StepStatus, Visibility};
pub use tool::{
    BaseModel, CostingModel, CostingUnit, DeliveryMode, FieldSpec, FieldType, InputSchema,
    ResolvedInputs, Service, Tool, ToolMetadata,
};
pub use user::{Platform, PlatformIdentity, User, UserStatus, UserTier};
pub use wallet::Wallet;
