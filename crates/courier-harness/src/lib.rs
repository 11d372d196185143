//! Deterministic simulation harness for Courier.
//!
//! Seeded implementations of the [`courier_core::Environment`] trait plus
//! in-process clients and routing, so end-to-end delivery scenarios run
//! without a network and replay identically from a seed.
//!
//! # Components
//!
//! - [`SimEnv`]: virtual clock and ChaCha RNG
//! - [`SimClient`]: a user with its own key manager and inbox
//! - [`SimWorld`]: the real relay driver wired to clients and storage

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod client;
pub mod sim_env;
pub mod world;

pub use client::SimClient;
pub use sim_env::{SIM_EPOCH_MILLIS, SimEnv};
pub use world::SimWorld;
