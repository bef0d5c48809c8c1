//! Host-side lifecycle management for virtual machines with pluggable execution
//! engines.
//!
//! The crate reconciles three independent sources of truth, the in-memory device
//! configuration, the persisted per-VM runtime registry and the live engine state,
//! under concurrent, cancellable, fallible async operations, while guaranteeing that
//! every scoped resource acquisition is released exactly once regardless of which path
//! (success, failure, cancellation) an operation takes.

pub mod backend;

pub mod registry;

pub mod resource;

pub mod vm;
