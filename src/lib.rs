//! hush - machine-wide domain blocking and display grayscale
//!
//! Keeps two user-visible toggles consistent with the real system state even
//! when the underlying operation is slow, privileged or fails half-way.
//!
//! # Architecture
//!
//! - [`core`] - State coordination: PAC generation, system proxy configuration,
//!   display transfer tables, toggle state machines and replay
//! - [`elevation`] - Single-flight authorization broker
//! - [`elevated_shell`] - Long-lived privileged shell behind a credential
//! - [`audit`] - Audit logging of every privileged transition
//! - [`validators`] - Domain normalization and validation
//! - [`config`] - Durable desired state and block list
//! - [`utils`] - Utility functions (application directories, file URLs)
//!
//! # Safety Features
//!
//! - `On` is only reported after the system confirmed the change
//! - Lock transactions with rollback on commit or apply failure
//! - Exact restore of captured display curves
//! - Atomic file operations with explicit permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevated_shell;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::blocklist::BlockList;
pub use core::coordinator::{Feature, StateCoordinator, SystemEvent, ToggleState};
pub use core::error::{Error, Result};
