//! Pluggable scheduling policies (spec §4.4), selected by configuration
//! string key at construction time.
//!
//! The original dispatches through a stringly-typed factory onto a class
//! hierarchy with a single run-time down-cast (`IfCoreOversubscribed`'s gate
//! checking whether the context scheduler happens to be `MutableMap`). Per
//! the design notes this is replaced with plain sum types: each policy
//! family is an enum matched at the handful of call sites, and
//! cross-policy compatibility (`IfCoreOversubscribed` requires
//! `CtxSchedPolicy::MutableMap`) is a one-time check in the coordinator's
//! constructor rather than a downcast performed on every gate query.

pub mod app_sched;
pub mod ctx_sched;
pub mod swap_gate;

pub use app_sched::AppSchedPolicy;
pub use ctx_sched::CtxSchedPolicy;
pub use swap_gate::SwapGatePolicy;
