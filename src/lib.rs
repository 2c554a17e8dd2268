//! keywarden — a credential-custody sidecar.
//!
//! Stores third-party API secrets encrypted at rest, hands an autonomous
//! agent only permanently-safe "read" secrets by default, and grants
//! elevated "read-write" secrets only after a human approves a request,
//! revoking them automatically at a deadline. Granted secrets are propagated
//! into the downstream host process's configuration (env file or structured
//! config) over the gateway's authenticated WebSocket protocol.

pub mod cli;
pub mod config;
pub mod elevation;
pub mod error;
pub mod gateway;
pub mod inject;
pub mod vault;
