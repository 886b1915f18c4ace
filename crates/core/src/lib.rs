//! Core types, errors, and well-known names for the Concourse worker operator.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod names;
pub mod types;

pub use error::{Error, Result};
pub use types::{Keypair, LocalAnnouncement, PeerFacts, PrivateKeyRef, Relation, UnitHealth};
