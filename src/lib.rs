#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod auth;
pub mod backfill;
pub mod blob;
pub mod config;
pub mod error;
pub mod feed;
pub mod format;
pub mod model;
pub mod posts;
pub mod profile;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{run, Board};
