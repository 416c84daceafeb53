//! Synchronization backend for GitLab servers.
//!
//! The core is a deduplicating priority task queue with a single
//! pull-loop. Change notifications from storage and inbound webhook
//! deliveries are mapped to tasks; tasks run importers that reconcile
//! GitLab state into local rows, an exporter that pushes issues the
//! other way, and hook maintenance that keeps webhook registrations on
//! every server pointing back at this installation.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod export;
pub mod gitlab;
pub mod hooks;
pub mod http;
pub mod import;
pub mod model;
pub mod queue;
pub mod store;
pub mod tasklog;
pub mod tasks;

pub use error::{Error, Result};
