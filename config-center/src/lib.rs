//! Configuration center and service registry on top of [`raft_store`].
//!
//! Applications register instances, send heartbeats over a websocket and
//! subscribe to namespaced configuration documents. Releasing a namespace
//! pushes the per-key changes to every subscriber, whichever node it is
//! connected to.
//!
//! - [`keys`] names identifiers and the store key layout.
//! - [`codec`] flattens YAML, JSON and properties documents.
//! - [`diff`] compares flattened documents.
//! - [`namespace`] versions documents through current, draft and history.
//! - [`instance`] keeps registrations, heartbeats and subscription markers.
//! - [`connection`] tracks subscriber sessions.
//! - [`propagation`] delivers released changes locally and to peers.
//! - [`permission`] checks per-app roles.
//! - [`api`] exposes all of it over HTTP; [`server`] wires the process.

pub mod api;
pub mod codec;
pub mod config;
pub mod connection;
pub mod diff;
pub mod error;
pub mod instance;
pub mod keys;
pub mod message;
pub mod namespace;
pub mod permission;
pub mod propagation;
pub mod server;

pub use error::ConfigError;
