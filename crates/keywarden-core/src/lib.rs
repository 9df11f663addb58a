//! keywarden-core - managed API key agent internals.
//!
//! The agent keeps one managed API key valid against a remote authority and
//! optionally supervises a workload that consumes it. The pieces:
//!
//! - [`config`]: TOML agent configuration and the persisted JSON state file.
//! - [`credential`]: in-process cache of the live key value.
//! - [`binder`]: the bind operation, the single source of new key material.
//! - [`rotation`]: the scheduler that keeps the key fresh through the
//!   primary timer, grace polls, heartbeat checks, and push events.
//! - [`connection`]: the push channel to the authority.
//! - [`degraded`]: degraded-mode tracking and reprovision recovery.
//! - [`secrets`]: secret resolution for the supervised workload.
//! - [`supervisor`]: the workload process lifecycle.
//! - [`keyfile`]: the durable on-disk mirror of the key.
//! - [`events`]: the event bus tying the subsystems together.
//!
//! Layering is strict: `binder` talks to `config` and `credential`,
//! `rotation` drives `binder`, `connection` drives `rotation` and
//! `degraded`, and the daemon binary wires the rest.

pub mod binder;
pub mod config;
pub mod connection;
pub mod credential;
pub mod degraded;
pub mod events;
pub mod keyfile;
pub mod rotation;
pub mod secrets;
pub mod supervisor;
