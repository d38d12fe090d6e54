//! Shared infrastructure for the billmirror workspace.
//!
//! Currently just database pool construction and the embedded migrations.

pub mod db;

pub use db::{create_pool, run_migrations};
