//! # build-governor
//!
//! A memory-pressure-aware admission controller for parallel native builds.
//! Compiler and linker invocations are intercepted by small shim binaries
//! that negotiate a token lease with a long-lived governor process before
//! running the real tool, so a build driver's `-j N` never outruns the
//! machine's available memory.
//!
//! ## Crate structure
//!
//! - **`error`**: the governor's consolidated error type.
//! - **`validation`**: small range/ordering checks shared by configuration
//!   validation.
//! - **`memory_probe`**: host and per-process memory sampling.
//! - **`budget`**: the pure function translating a memory snapshot into a
//!   token budget and throttle level.
//! - **`classifier`**: the pure function translating exit-time evidence
//!   into a failure classification.
//! - **`protocol`**: the shim<->governor wire format.
//! - **`ipc`**: the cross-platform local transport and single-instance
//!   discipline the protocol rides on.
//! - **`pool`**: the token pool and lease manager, the governor's only
//!   mutable state.
//! - **`config`**: layered configuration loading and validation.
//! - **`logging`**: tracing subscriber initialization.
//! - **`server`**: the governor's IPC accept loop and maintenance task.
//! - **`shim`**: the tool shim lifecycle shared by the compiler and linker
//!   shim binaries.

pub mod budget;
pub mod classifier;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod memory_probe;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod shim;
pub mod validation;
