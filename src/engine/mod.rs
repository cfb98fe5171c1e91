//! # Target-Change Engine
//!
//! Turns function definitions into subscriptions and keeps them current.

pub mod definition;
pub mod errors;
pub mod runner;

pub use definition::{
    FunctionDefinition, TargetChange, TargetChangeKind, TriggerDefinition, TriggerSpec,
};
pub use errors::{EngineError, EngineResult};
pub use runner::{ApplyReport, TargetChangeEngine};
