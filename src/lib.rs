//! Client-side query cache and sync engine for the projects dashboard.

pub mod api;
pub mod cache;
pub mod config;
pub mod logging;
pub mod query;
pub mod session;
pub mod sync;

#[cfg(test)]
mod testing;
