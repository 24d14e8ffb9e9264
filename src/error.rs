//! Error taxonomy (spec §7). Construction/config problems are recoverable at
//! the call site and use `anyhow`; protocol violations are not recoverable
//! and abort via [`fatal!`].

pub use anyhow::{bail, Context, Result};

/// Unconditionally logs at `error!` with the `"AppMgr"` target and then
/// panics. Modeled on `shadow-shadow`'s `debug_panic!` (`src/main/utility/
/// macros.rs`), but unconditional: spec §7 classifies protocol violations
/// ("the simulator has lost track of its state") as always-fatal, not a
/// debug-only assertion.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!(target: "AppMgr", $($arg)*);
        panic!($($arg)*);
    }};
}
