//! Core of the nopea GitOps controller: per-repository workers, the
//! three-way drift engine, the sync executor, the in-memory state store and
//! the watch/lifecycle controller, gated by lease-based leader election.

pub mod api;
pub mod config;
pub mod controller;
pub mod drift;
pub mod events;
pub mod gitops;
pub mod k8s;
pub mod leader;
pub mod model;
pub mod store;
pub mod supervisor;
pub mod sync;
pub mod util;
pub mod webhook;
pub mod worker;

/// In-memory fakes for the collaborator seams. Compiled only for tests and
/// for crates that opt into the `test-harness` feature.
#[cfg(any(feature = "test-harness", test))]
pub mod testing;

pub use util::errors::{Error, Result};
