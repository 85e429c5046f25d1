//! Unix process management for the Goanna runner: process groups, signals
//! and the local-process backend.

mod unix_process_manager;

#[cfg(unix)]
mod local_backend;

pub use unix_process_manager::*;

#[cfg(unix)]
pub use local_backend::{UnixLocalBackend, UnixLocalBackendFactory};
