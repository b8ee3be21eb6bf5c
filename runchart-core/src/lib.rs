//! # runchart-core
//!
//! Declarative state chart interpreter.
//!
//! This crate provides:
//! - Chart descriptions (JSON, YAML or XML) and the builder that validates them
//! - The indexed chart model with history and per-machine data
//! - Callback resolution strategies
//! - The runner, which drives transitions, hooks and trigger chains
//! - Dump encoding for suspending and resuming machines

pub mod builder;
pub mod callback;
pub mod chart;
pub mod codec;
pub mod error;
pub mod runner;
mod xml;

pub use builder::{ChartBuilder, ChartDescription, StateDescription};
pub use callback::{
    CallbackRegistry, CallbackResolver, HookKind, InjectedSources, NoCallbacks, ProcessingMap,
};
pub use chart::{HistoryRecord, State, StateChart, TransitionStatus, OWNER_KEY};
pub use codec::{ChartDump, Format};
pub use error::{CoreError, ErrorKind};
pub use runner::{FlushError, FlushHook, Runner, RunnerOptions, RunnerProxy};
