//! `CoreRecord`: per-core occupancy counters and TLP histograms (spec §3).

use std::collections::{BTreeMap, HashSet};

use crate::ids::{AppId, CtxId};
use crate::stats::HistCount;
use crate::time::Cycle;

pub struct CoreRecord {
    pub ctxs: Vec<CtxId>,
    pub num_apps_sched: u32,
    pub num_apps_stalled: u32,
    /// Histogram by number of scheduled apps.
    pub tlp_sched: HistCount<u32>,
    /// Histogram by "scheduled minus stalled".
    pub tlp_sched_minus_stalled: HistCount<u32>,
    pub last_stop_cyc: BTreeMap<AppId, Cycle>,
    /// Apps currently long-missing but not evicted (drives `num_apps_stalled`
    /// and `core_running_apps`/load-factor `only_running` exclusion).
    stalled_apps: HashSet<AppId>,
    tlp_since: Cycle,
}

impl CoreRecord {
    pub fn new(ctxs: Vec<CtxId>, now: Cycle) -> Self {
        Self {
            ctxs,
            num_apps_sched: 0,
            num_apps_stalled: 0,
            tlp_sched: HistCount::new(),
            tlp_sched_minus_stalled: HistCount::new(),
            last_stop_cyc: BTreeMap::new(),
            stalled_apps: HashSet::new(),
            tlp_since: now,
        }
    }

    pub fn ctx_count(&self) -> usize {
        self.ctxs.len()
    }

    /// Folds elapsed cycles at the *previous* TLP level into both
    /// histograms, then updates the level. Call before mutating
    /// `num_apps_sched`/stalled so the histogram reflects cycles actually
    /// spent at the old level.
    fn retire_tlp_interval(&mut self, now: Cycle) {
        let elapsed = now.saturating_sub(self.tlp_since);
        if elapsed > 0 {
            self.tlp_sched.add(self.num_apps_sched, elapsed);
            self.tlp_sched_minus_stalled.add(
                self.num_apps_sched.saturating_sub(self.num_apps_stalled),
                elapsed,
            );
        }
        self.tlp_since = now;
    }

    pub fn app_scheduled(&mut self, now: Cycle) {
        self.retire_tlp_interval(now);
        self.num_apps_sched += 1;
    }

    pub fn app_unscheduled(&mut self, now: Cycle) {
        self.retire_tlp_interval(now);
        self.num_apps_sched = self.num_apps_sched.saturating_sub(1);
    }

    pub fn app_stalled(&mut self, app: AppId, now: Cycle) {
        if self.stalled_apps.insert(app) {
            self.retire_tlp_interval(now);
            self.num_apps_stalled += 1;
        }
    }

    pub fn app_stalldone_noevict(&mut self, app: AppId, now: Cycle) {
        if self.stalled_apps.remove(&app) {
            self.retire_tlp_interval(now);
            self.num_apps_stalled = self.num_apps_stalled.saturating_sub(1);
        }
    }

    pub fn note_stop(&mut self, app: AppId, now: Cycle) {
        self.last_stop_cyc.insert(app, now);
    }

    pub fn last_stop(&self, app: AppId) -> Option<Cycle> {
        self.last_stop_cyc.get(&app).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlp_histogram_accumulates_by_level() {
        let mut c = CoreRecord::new(vec![CtxId::new(0), CtxId::new(1)], Cycle(0));
        c.app_scheduled(Cycle(0));
        c.app_scheduled(Cycle(10));
        c.app_unscheduled(Cycle(20));
        assert_eq!(c.tlp_sched.get(0), 10);
        assert_eq!(c.tlp_sched.get(1), 10);
        assert_eq!(c.tlp_sched.get(2), 0);
        assert_eq!(c.num_apps_sched, 1);
    }

    #[test]
    fn stalled_tracking_is_idempotent_per_app() {
        let mut c = CoreRecord::new(vec![CtxId::new(0)], Cycle(0));
        c.app_stalled(AppId::new(0), Cycle(0));
        c.app_stalled(AppId::new(0), Cycle(5)); // already stalled, no double-count
        assert_eq!(c.num_apps_stalled, 1);
        c.app_stalldone_noevict(AppId::new(0), Cycle(10));
        assert_eq!(c.num_apps_stalled, 0);
    }
}
