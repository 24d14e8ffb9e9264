//! `AppRecord`: per-application state machine and accounting (spec §3, §4.2).

use std::collections::HashSet;

use crate::ids::{AppId, CtxId};
use crate::stats::{BasicStat, HistCount};
use crate::time::Cycle;

/// The nine states an application can occupy. Order here is not meaningful;
/// it only needs `Ord`/`Hash` so it can key a [`HistCount`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum AppState {
    Ready,
    SwapIn,
    Running,
    RunningLongMiss,
    SwapOutLongMiss,
    SwapOutLongMissCancel,
    SwapOutMigrate,
    SwapOutSched,
    WaitLongMiss,
}

impl AppState {
    /// True for the three "winding down" states that precede a halted
    /// context (used by `core_swapout_apps` and the swap-gate "active
    /// count" queries).
    pub fn is_swapout(self) -> bool {
        matches!(
            self,
            AppState::SwapOutLongMiss | AppState::SwapOutMigrate | AppState::SwapOutSched
        )
    }
}

/// A callback invoked exactly once when an app next reaches `Ready` from any
/// `SwapOut*` state. Callbacks own whatever handle they need back into the
/// coordinator (an index, a shared cell, ...) rather than AppRecord knowing
/// about the coordinator type — see the cyclic-reference note in the design
/// notes.
pub type PostHaltCallback = Box<dyn FnOnce()>;

/// The ordered, duplicate-free collection of post-halt callbacks (spec §3,
/// invariant 7 in spec §8: `ord.size() == uniq.size()` at all times).
#[derive(Default)]
pub struct PostHaltCallbacks {
    order: Vec<u64>,
    seen: HashSet<u64>,
    cbs: Vec<(u64, PostHaltCallback)>,
}

impl PostHaltCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `cb` under `id`. Duplicate ids are silently ignored — the
    /// collection is a *set* of callbacks keyed by registration identity.
    pub fn register(&mut self, id: u64, cb: PostHaltCallback) {
        if self.seen.insert(id) {
            self.order.push(id);
            self.cbs.push((id, cb));
        }
    }

    pub fn len(&self) -> usize {
        self.cbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cbs.is_empty()
    }

    /// Snapshots and clears the registration, returning the callbacks in
    /// registration order. The caller invokes them after this call so that a
    /// callback which re-enters the coordinator (and even destroys this
    /// `AppRecord`) never observes a half-cleared list.
    pub fn drain_in_order(&mut self) -> Vec<PostHaltCallback> {
        self.order.clear();
        self.seen.clear();
        self.cbs.drain(..).map(|(_, cb)| cb).collect()
    }
}

/// Fixed per-app migrate-latency decomposition stats (spec §3, §6).
#[derive(Default)]
pub struct MigrateTimingStats {
    pub deact_halt: BasicStat,
    pub deact_swapout: BasicStat,
    pub deact_sum: BasicStat,
    pub activ_fetch: BasicStat,
    pub activ_commit: BasicStat,
    pub migrate_fetch: BasicStat,
    pub migrate_commit: BasicStat,
}

pub struct AppRecord {
    pub id: AppId,
    pub state: AppState,
    pub curr_ctx: Option<CtxId>,
    pub prev_ctx: Option<CtxId>,
    /// Valid only while `state == SwapOutMigrate`: the context reserved as
    /// the migration's destination.
    pub migrate_target: Option<CtxId>,

    pub created_cyc: Cycle,

    /// Whether this migration is a currently in-progress reservation (used
    /// by `is_migrate_pending`-style queries layered on top by the pending
    /// registry; kept here too since state alone doesn't distinguish a
    /// reserved-but-not-yet-halted migrate from a plain halt).
    pub residency_cyc: HistCount<CtxId>,
    pub swapin_count: HistCount<CtxId>,
    pub state_residence_cyc: HistCount<AppState>,
    pub run_before_swap: BasicStat,

    pub long_misses: u64,
    pub swap_outs: u64,
    pub swapin_repeats: u64,
    pub migrates: u64,

    pub last_swapin_cyc: Option<Cycle>,
    pub last_swapout_cyc: Option<Cycle>,
    pub last_halt_start: Option<Cycle>,
    pub last_migrate_start: Option<Cycle>,
    pub last_halt_done: Option<Cycle>,
    pub last_swapin_done: Option<Cycle>,
    pub last_finalfill_commit: Option<Cycle>,

    pub timing: MigrateTimingStats,

    pub post_halt_cbs: PostHaltCallbacks,

    /// The cycle at which the last transition into `state` occurred. Used to
    /// account elapsed time into `state_residence_cyc` and `residency_cyc`
    /// when the next transition fires; funnels every state write through
    /// `set_state` per the design notes (no scattered histogram updates).
    state_since: Cycle,
    /// The cycle the app last started residing on `curr_ctx`, used to
    /// compute `curr_run_cyc` for the residency invariant (spec §8 item 5).
    resident_since: Option<Cycle>,

    /// Whether the app has committed at least one instruction since its last
    /// swap-in. Cleared on swap-in, set by the driver-reported commit
    /// signal (`note_commit`). Backs `any_progress_since_swapin`.
    committed_since_swapin: bool,
    /// Cycles elapsed on the current residency before any progress check;
    /// used together with `min_swapin_cyc`/`min_swapin_commits`.
    commits_since_swapin: u64,
}

impl AppRecord {
    pub fn new(id: AppId, now: Cycle) -> Self {
        Self {
            id,
            state: AppState::Ready,
            curr_ctx: None,
            prev_ctx: None,
            migrate_target: None,
            created_cyc: now,
            residency_cyc: HistCount::new(),
            swapin_count: HistCount::new(),
            state_residence_cyc: HistCount::new(),
            run_before_swap: BasicStat::new(),
            long_misses: 0,
            swap_outs: 0,
            swapin_repeats: 0,
            migrates: 0,
            last_swapin_cyc: None,
            last_swapout_cyc: None,
            last_halt_start: None,
            last_migrate_start: None,
            last_halt_done: None,
            last_swapin_done: None,
            last_finalfill_commit: None,
            timing: MigrateTimingStats::default(),
            post_halt_cbs: PostHaltCallbacks::new(),
            state_since: now,
            resident_since: None,
            committed_since_swapin: false,
            commits_since_swapin: 0,
        }
    }

    /// Funnel point for every state write (design notes: "funnel every
    /// state write through a single set_state that updates the residence
    /// histogram").
    pub fn set_state(&mut self, new: AppState, now: Cycle) {
        let elapsed = now.saturating_sub(self.state_since);
        self.state_residence_cyc.add(self.state, elapsed);
        self.state = new;
        self.state_since = now;
    }

    /// Cycles resident on `curr_ctx` so far, if hosted.
    pub fn state_since(&self) -> Cycle {
        self.state_since
    }

    /// Total cycles attributed to every state since creation, including the
    /// interval currently open (not yet folded into `state_residence_cyc`
    /// by a future `set_state` call). Backs the debug invariant check in
    /// spec §8 item 4.
    pub fn state_residence_total(&self, now: Cycle) -> u64 {
        self.state_residence_cyc.total() + now.saturating_sub(self.state_since)
    }

    pub fn curr_run_cyc(&self, now: Cycle) -> u64 {
        match self.resident_since {
            Some(since) => now.saturating_sub(since),
            None => 0,
        }
    }

    pub fn cyc_before_swapin(&self) -> u64 {
        self.residency_cyc.total()
    }

    /// Binds the app onto `ctx` at `now`, recording residency bookkeeping.
    /// Increments `swapin_repeats` when `prev_ctx` shares a core with `ctx`.
    pub fn begin_residency(&mut self, ctx: CtxId, now: Cycle, same_core_as_prev: bool) {
        self.curr_ctx = Some(ctx);
        self.resident_since = Some(now);
        self.swapin_count.add(ctx, 1);
        self.committed_since_swapin = false;
        self.commits_since_swapin = 0;
        if same_core_as_prev {
            self.swapin_repeats += 1;
        }
    }

    /// Ends the current residency, folding elapsed cycles into the
    /// per-context residency histogram and the run-before-swap sample.
    pub fn end_residency(&mut self, now: Cycle) {
        if let (Some(ctx), Some(since)) = (self.curr_ctx, self.resident_since) {
            let elapsed = now.saturating_sub(since);
            self.residency_cyc.add(ctx, elapsed);
            self.run_before_swap.sample(elapsed as f64);
        }
        self.prev_ctx = self.curr_ctx;
        self.curr_ctx = None;
        self.resident_since = None;
    }

    pub fn note_commit(&mut self) {
        self.committed_since_swapin = true;
        self.commits_since_swapin = self.commits_since_swapin.saturating_add(1);
    }

    pub fn commits_since_swapin(&self) -> u64 {
        self.commits_since_swapin
    }

    /// Feasibility predicate used by migration begin-checks (spec §4.5):
    /// at least one commit since the last swap-in.
    pub fn any_progress_since_swapin(&self) -> bool {
        self.committed_since_swapin
    }

    /// Distinct from `any_progress_since_swapin`: the long-miss progress
    /// threshold gate, which additionally requires a minimum resident cycle
    /// count (spec §9 open question: keep these two predicates separate,
    /// they serve different policies).
    pub fn enough_progress_since_swapin(
        &self,
        now: Cycle,
        min_commits: u64,
        min_cyc: u64,
    ) -> bool {
        let resident_cyc = self.resident_since.map(|s| now.saturating_sub(s)).unwrap_or(0);
        self.commits_since_swapin >= min_commits && resident_cyc >= min_cyc
    }

    /// IPC over the app's entire resident lifetime, supplementing spec §6's
    /// "per-app resident IPC" stat column (original: `resident_ipc_commit`).
    pub fn resident_ipc(&self, total_commits: i64) -> f64 {
        let cyc = self.residency_cyc.total();
        if cyc == 0 {
            0.0
        } else {
            total_commits as f64 / cyc as f64
        }
    }

    /// Fraction of swap-outs followed by a same-core swap-in (original:
    /// `swapin_repeat_frac`), guarding the zero-denominator case.
    pub fn swapin_repeat_frac(&self) -> f64 {
        let currently_scheduled = !matches!(self.state, AppState::Ready | AppState::WaitLongMiss);
        let denom = self.swap_outs.saturating_sub(if currently_scheduled { 0 } else { 1 });
        if denom == 0 {
            0.0
        } else {
            self.swapin_repeats as f64 / denom as f64
        }
    }

    /// Mean swapped-in cycle length including any in-progress residency
    /// (original: `mean_swappedin_cyc`).
    pub fn mean_swappedin_cyc(&self, now: Cycle) -> f64 {
        let mut s = self.run_before_swap;
        if let Some(since) = self.resident_since {
            s.sample(now.saturating_sub(since) as f64);
        }
        s.mean()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_state_accumulates_residence_histogram() {
        let mut a = AppRecord::new(AppId::new(0), Cycle(0));
        a.set_state(AppState::SwapIn, Cycle(10));
        a.set_state(AppState::Running, Cycle(15));
        assert_eq!(a.state_residence_cyc.get(AppState::Ready), 10);
        assert_eq!(a.state_residence_cyc.get(AppState::SwapIn), 5);
    }

    #[test]
    fn begin_and_end_residency_track_histogram_and_repeats() {
        let mut a = AppRecord::new(AppId::new(0), Cycle(0));
        a.begin_residency(CtxId::new(0), Cycle(0), false);
        a.end_residency(Cycle(100));
        assert_eq!(a.residency_cyc.get(CtxId::new(0)), 100);
        assert_eq!(a.swapin_repeats, 0);

        a.begin_residency(CtxId::new(1), Cycle(100), true);
        assert_eq!(a.swapin_repeats, 1);
    }

    #[test]
    fn post_halt_callbacks_are_deduplicated_and_ordered() {
        let mut cbs = PostHaltCallbacks::new();
        let order = std::cell::RefCell::new(Vec::new());
        cbs.register(1, Box::new(|| {}));
        cbs.register(2, Box::new(|| {}));
        cbs.register(1, Box::new(|| {})); // duplicate id, ignored
        assert_eq!(cbs.len(), 2);
        let drained = cbs.drain_in_order();
        assert_eq!(drained.len(), 2);
        assert!(cbs.is_empty());
        drop(order);
    }

    #[test]
    fn progress_predicates() {
        let mut a = AppRecord::new(AppId::new(0), Cycle(0));
        a.begin_residency(CtxId::new(0), Cycle(0), false);
        assert!(!a.any_progress_since_swapin());
        assert!(!a.enough_progress_since_swapin(Cycle(5), 1, 0));
        a.note_commit();
        assert!(a.any_progress_since_swapin());
        assert!(a.enough_progress_since_swapin(Cycle(5), 1, 0));
    }
}
