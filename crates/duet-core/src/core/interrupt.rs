//! Process-wide Ctrl+C state.
//!
//! The first Ctrl+C only raises a flag so the front end can stop running
//! generations; the second one is counted so it can exit.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};

static INTERRUPTS: AtomicU32 = AtomicU32::new(0);

#[derive(Debug)]
pub struct InterruptedError;

impl std::fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted")
    }
}

impl std::error::Error for InterruptedError {}

/// Installs the Ctrl+C handler. The handler never prints.
///
/// # Errors
/// Returns an error if a handler is already installed.
pub fn init() -> Result<()> {
    ctrlc::set_handler(trigger_ctrl_c).context("Error setting Ctrl+C handler")
}

/// Records one Ctrl+C.
pub fn trigger_ctrl_c() {
    INTERRUPTS.fetch_add(1, Ordering::SeqCst);
}

/// Number of Ctrl+C presses since startup.
pub fn count() -> u32 {
    INTERRUPTS.load(Ordering::SeqCst)
}

pub fn is_interrupted() -> bool {
    count() > 0
}
