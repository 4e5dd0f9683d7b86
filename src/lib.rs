pub mod config;
pub mod db;
pub mod diff;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod schedule;
pub mod scheduler;
pub mod sites;
pub mod vault;
pub mod vendor;
