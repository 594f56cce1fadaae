//! Central lottery server library crate.
//!
//! # Purpose
//! Stores the bets agencies submit, tracks which agencies finished, and
//! publishes each agency's winners once the round is closed.
//!
//! # Notes
//! Exposed as a library so the agency client's end-to-end tests can run the
//! real server in-process.
pub mod config;
pub mod registry;
pub mod server;

pub use config::CentralConfig;
pub use registry::{DoneStatus, Registry};
pub use server::{CentralServer, handle_connection, serve};
