//! Core state-coordination functionality
//!
//! - [`blocklist`]: Block list and proxy auto-config script rendering
//! - [`netconfig`]: Network configuration store abstraction and lock guard
//! - [`networksetup`]: `networksetup`-backed configuration store
//! - [`blocking`]: Network blocking controller
//! - [`gamma`]: Display transfer tables, snapshots and grayscale
//! - [`coordinator`]: Per-feature toggle state machines and replay
//! - [`lifecycle`]: Wake and display topology event sources
//! - [`error`]: Error types and user-facing translations

pub mod blocking;
pub mod blocklist;
pub mod coordinator;
pub mod error;
pub mod gamma;
#[cfg(target_os = "macos")]
pub mod gamma_macos;
pub mod lifecycle;
pub mod netconfig;
pub mod networksetup;

#[cfg(test)]
pub mod test_helpers;
