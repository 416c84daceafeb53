//! Fetch-and-diff reconcilers that pull GitLab state into local storage.
//!
//! All importers follow the same shape: fetch the locally tracked superset,
//! fetch the live external list, soft-delete what vanished, then merge
//! external fields into cloned local rows, skipping the write when nothing
//! changed, so reconciliation never produces spurious change events.
//! Locally-owned fields are never overwritten.

pub mod events;
pub mod milestones;
pub mod repos;
pub mod snapshot;
pub mod users;
pub mod wiki;
