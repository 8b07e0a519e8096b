//! SIGINT/SIGTERM flag, checked once per event-loop iteration. The handler
//! itself does nothing but flip the flag; all actual teardown happens on the
//! main thread between ticks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;

use crate::CliResult;

pub fn install() -> CliResult<Arc<AtomicBool>> {
    let requested = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&requested)).map_err(|e| format!("failed to register SIGINT handler: {e}"))?;
    flag::register(SIGTERM, Arc::clone(&requested)).map_err(|e| format!("failed to register SIGTERM handler: {e}"))?;
    Ok(requested)
}

pub fn requested(flag: &Arc<AtomicBool>) -> bool {
    flag.load(Ordering::Relaxed)
}
