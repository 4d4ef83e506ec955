//! Fleet Warmer - keeps a fleet of messaging accounts talking to each other
//!
//! Each browser-side device owns one provider session. Ready devices run
//! paced conversations with other funded devices, auto-reply to each other,
//! and pay for every message out of a per-identity credit balance.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
