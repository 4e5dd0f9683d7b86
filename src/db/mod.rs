//! Database module: view models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: insert payloads and row-level view models used by repositories.
//! - `repo`: SQL-only functions that map rows into domain entities.
//!
//! Every query is keyed by an owner id or a site id that was resolved through
//! its owner; callers never scan other owners' data.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{NewDiff, NewSnapshot};
