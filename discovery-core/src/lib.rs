use std::time::Instant;

use once_cell::sync::Lazy;

pub mod prelude;
pub mod readiness;
pub mod signal;
pub mod strng;

/// Process start time, used for readiness reporting.
pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
