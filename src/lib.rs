//! Traffic - HTTP traffic statistics with a live log viewer
//!
//! - Per-request statistics buffer merged into daily aggregate rows
//! - Shared, bounded live log polled by the admin viewer
//! - HTTP API for reported calls, statistics and the live log

pub mod config;
pub mod conversion;
pub mod db;
pub mod key;
pub mod lifecycle;
pub mod livelog;
pub mod web;
