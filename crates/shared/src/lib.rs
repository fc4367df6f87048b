#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Draftmill Shared Crate
//!
//! Types and database plumbing used by both the API server and the
//! billing core.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{PlanId, SubscriptionStatus, Workspace};
