//! Orchestrates isolated development container sessions.
//!
//! - [`naming`] maps a workspace and slot to a deterministic container name.
//! - [`session`] persists per-session metadata on disk.
//! - [`container`] drives the container runtime.
//! - [`network`] manages per-container network ACLs.
//! - [`lifecycle`] composes them into launch, run, persist, stop, shutdown,
//!   kill and delete.

pub mod config;
pub mod container;
pub mod lifecycle;
pub mod naming;
pub mod network;
pub mod session;
