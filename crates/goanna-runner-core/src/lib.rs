//! Goanna runner core - platform-independent pieces of the browser runner
//!
//! This crate provides the lifecycle state machine, the traits backends
//! implement, configuration, profiles, output capture and error types that
//! are shared by the local and device runners.

mod backend;
mod config;
mod device;
mod error;
mod output;
mod process;
mod profile;
mod runner;
mod settings;
mod state;

pub use backend::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use output::*;
pub use process::*;
pub use profile::*;
pub use runner::{Runner, Supervisor, WaitOutcome};
pub use settings::*;
pub use state::*;
