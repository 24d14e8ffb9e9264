//! `PendingMigration` / `PendingHalt` registries (spec §3, §4.6): track
//! in-flight asynchronous requests, their recheck/timeout callbacks, and
//! completion callbacks.

use std::collections::{BTreeMap, BTreeSet};

use crate::collab::HaltStyle;
use crate::event::CallbackHandle;
use crate::ids::{AppId, CoreId, CtxId};
use crate::time::Cycle;

/// A migration's completion callback, invoked exactly once when the app
/// reaches `Running` on its target.
pub type MigrateDoneCallback = Box<dyn FnOnce()>;

pub struct PendingMigration {
    pub app_id: AppId,
    pub targ_core_id: CoreId,
    pub reserved_ctx_id: Option<CtxId>,
    pub done_cb: Option<MigrateDoneCallback>,
    /// Owning handle on the event queue's recheck callback, if one is
    /// outstanding. `None` once the migration has begun or been cancelled.
    pub recheck_handle: Option<CallbackHandle>,
    pub timeout_handle: Option<CallbackHandle>,
    pub earliest: Cycle,
    pub cancel_on_move: bool,
    pub expire_cyc: Option<Cycle>,
    pub halt_style: HaltStyle,
    pub origin_ctx: Option<CtxId>,
    /// True once the halt/swap-out has actually started. Cancelling after
    /// this point is undefined by design (spec §5) — callers must not.
    pub in_progress: bool,
}

#[derive(Default)]
pub struct PendingMigrationRegistry {
    entries: BTreeMap<AppId, PendingMigration>,
}

impl PendingMigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, app: AppId) -> bool {
        self.entries.contains_key(&app)
    }

    pub fn get(&self, app: AppId) -> Option<&PendingMigration> {
        self.entries.get(&app)
    }

    pub fn get_mut(&mut self, app: AppId) -> Option<&mut PendingMigration> {
        self.entries.get_mut(&app)
    }

    /// Inserts a new pending migration. Fail-fast on duplicate (spec §4.6:
    /// "insertion is fail-fast on duplicates"; callers are expected to wrap
    /// with a prior cancel, per spec §4.5 item 6).
    pub fn insert(&mut self, entry: PendingMigration) {
        let app = entry.app_id;
        if self.entries.insert(app, entry).is_some() {
            crate::fatal!("duplicate pending migration inserted for app {app}");
        }
    }

    /// Removes the entry for `app`, cancelling any still-queued recheck
    /// callback via `cancel`. Returns the removed entry so the caller can
    /// clear reservations/invoke or drop the completion callback as
    /// appropriate.
    pub fn remove<F: FnMut(CallbackHandle)>(&mut self, app: AppId, mut cancel: F) -> Option<PendingMigration> {
        let entry = self.entries.remove(&app)?;
        if let Some(h) = entry.recheck_handle {
            cancel(h);
        }
        if let Some(h) = entry.timeout_handle {
            cancel(h);
        }
        Some(entry)
    }
}

#[derive(Default)]
pub struct PendingHaltRegistry {
    pending: BTreeSet<AppId>,
}

impl PendingHaltRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, app: AppId) -> bool {
        self.pending.contains(&app)
    }

    /// Returns `true` if this is a new halt request (the caller should call
    /// `halt_app_soon`); `false` if one was already pending.
    pub fn begin(&mut self, app: AppId) -> bool {
        self.pending.insert(app)
    }

    pub fn complete(&mut self, app: AppId) {
        self.pending.remove(&app);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(app: AppId) -> PendingMigration {
        PendingMigration {
            app_id: app,
            targ_core_id: CoreId::new(0),
            reserved_ctx_id: None,
            done_cb: None,
            recheck_handle: None,
            timeout_handle: None,
            earliest: Cycle(0),
            cancel_on_move: false,
            expire_cyc: None,
            halt_style: HaltStyle::Migrate,
            origin_ctx: None,
            in_progress: false,
        }
    }

    #[test]
    #[should_panic(expected = "duplicate pending migration")]
    fn insert_duplicate_panics() {
        let mut reg = PendingMigrationRegistry::new();
        reg.insert(sample(AppId::new(0)));
        reg.insert(sample(AppId::new(0)));
    }

    #[test]
    fn remove_returns_entry_and_calls_cancel_hook() {
        let mut reg = PendingMigrationRegistry::new();
        reg.insert(sample(AppId::new(0)));
        let mut cancelled = false;
        let removed = reg.remove(AppId::new(0), |_h| cancelled = true);
        assert!(removed.is_some());
        // No recheck handle was set on `sample`, so the cancel hook never
        // fires; that's exercised at the coordinator level where a real
        // `CallbackHandle` exists.
        assert!(!cancelled);
        assert!(!reg.is_pending(AppId::new(0)));
    }

    #[test]
    fn pending_halt_begin_is_once_per_app() {
        let mut reg = PendingHaltRegistry::new();
        assert!(reg.begin(AppId::new(0)));
        assert!(!reg.begin(AppId::new(0)));
        reg.complete(AppId::new(0));
        assert!(reg.begin(AppId::new(0)));
    }
}
