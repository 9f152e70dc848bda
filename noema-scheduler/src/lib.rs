//! Cook worker loop and spell cast executor (§4.G). Both drive `noema-lifecycle::execute`
//! rather than touching generations directly, so cost settlement and notification gating
//! stay in one place.

pub mod cook;
pub mod error;
pub mod spell;
pub mod training;

pub use cook::CookScheduler;
pub use error::SchedulerError;
pub use spell::SpellExecutor;
pub use training::TrainingMonitor;
