//! Core discovery engine.
//!
//! The ladder, confidence model, cache, snapshots and differ live here, along
//! with the shared store, config, locking and audit plumbing they run on.
//! Nothing in `core` knows how a particular target kind is inspected; that is
//! the job of the probes in `crate::plugins`.

pub mod cache;
pub mod confidence;
pub mod config;
pub mod diff;
pub mod error;
pub mod external;
pub mod ladder;
pub mod lock;
pub mod matcher;
pub mod model;
pub mod output;
pub mod probe;
pub mod snapshot;
pub mod store;
pub mod time;
pub mod trace;
