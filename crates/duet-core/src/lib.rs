//! Core duet library (generation orchestration, providers, credentials, config).

pub mod config;
pub mod core;
pub mod credentials;
pub mod providers;
pub mod session_file;
