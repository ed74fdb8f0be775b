//! NSC Core - Remote-signer connection logic for the point-of-sale client.
//!
//! This crate implements:
//! - The connection/authentication state machine (pure transitions)
//! - The connection controller actor that executes its effects
//! - Stage-scoped, cancellable timers
//! - Collaborator traits for the signer connection service and the
//!   authentication completer
//! - Bunker URL and connect-request helpers

#![forbid(unsafe_code)]

// Core state machine
pub mod machine;
pub mod session;

// Runtime
pub mod controller;
pub mod timers;

// Collaborators
pub mod auth;
pub mod signer;

// Supporting modules
pub mod bunker;
pub mod config;
pub mod connect_uri;
pub mod errors;
pub mod types;
pub mod harness;

pub use config::ConnectTimings;
pub use controller::{ConnectionController, ConnectionHandle};
pub use errors::{ConnectError, ErrorInfo, FailureKind, Recovery};
pub use machine::{ConnectUpdate, Effect, Event, SessionMachine};
pub use session::{ConnectionSession, SecretDisposition, SessionSnapshot};
pub use types::{AuthStage, PublicKey, Stage};
