//! CLI command handlers.

pub mod chat;
pub mod config;
pub mod keys;
