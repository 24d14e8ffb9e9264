//! `Records` storage and the read-only [`ManagerView`] query layer consulted
//! by every policy (spec §4.1). Mirrors the original's `MgrSchedInfo`.

use std::collections::BTreeMap;
use std::fmt;

use crate::app::{AppRecord, AppState};
use crate::collab::PipelineHost;
use crate::core_rec::CoreRecord;
use crate::ctx::CtxRecord;
use crate::ids::{AppId, CoreId, CtxId};
use crate::rng::DeterministicRng;

#[derive(Debug)]
pub enum ViewError {
    UnknownId(String),
    NoCandidate,
}

impl fmt::Display for ViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewError::UnknownId(s) => write!(f, "unknown id: {s}"),
            ViewError::NoCandidate => write!(f, "no candidate core available"),
        }
    }
}

impl std::error::Error for ViewError {}

pub type ViewResult<T> = Result<T, ViewError>;

/// Owns every `AppRecord`/`CtxRecord`/`CoreRecord`. Created during setup
/// (contexts/cores) and grown/shrunk as apps are added/removed (spec §3
/// "Lifecycle").
#[derive(Default)]
pub struct Records {
    pub apps: BTreeMap<AppId, AppRecord>,
    pub ctxs: BTreeMap<CtxId, CtxRecord>,
    pub cores: BTreeMap<CoreId, CoreRecord>,
}

impl Records {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self) -> ManagerView<'_> {
        ManagerView { records: self }
    }
}

/// Read-only aggregate over [`Records`]. Every query here is pure over the
/// records as they stand at call time (spec §4.1).
pub struct ManagerView<'a> {
    records: &'a Records,
}

impl<'a> ManagerView<'a> {
    pub fn new(records: &'a Records) -> Self {
        Self { records }
    }

    pub fn app_count(&self) -> usize {
        self.records.apps.len()
    }

    pub fn ctx_count(&self) -> usize {
        self.records.ctxs.len()
    }

    pub fn core_count(&self) -> usize {
        self.records.cores.len()
    }

    pub fn core_ids(&self) -> Vec<CoreId> {
        self.records.cores.keys().copied().collect()
    }

    pub fn apps_iter(&self) -> impl Iterator<Item = (&AppId, &AppRecord)> {
        self.records.apps.iter()
    }

    pub fn get_app(&self, id: AppId) -> ViewResult<&AppRecord> {
        self.records
            .apps
            .get(&id)
            .ok_or_else(|| ViewError::UnknownId(id.to_string()))
    }

    pub fn get_ctx(&self, id: CtxId) -> ViewResult<&CtxRecord> {
        self.records
            .ctxs
            .get(&id)
            .ok_or_else(|| ViewError::UnknownId(id.to_string()))
    }

    pub fn get_core(&self, id: CoreId) -> ViewResult<&CoreRecord> {
        self.records
            .cores
            .get(&id)
            .ok_or_else(|| ViewError::UnknownId(id.to_string()))
    }

    /// Apps currently running on contexts of `core`; excludes
    /// reserved-but-not-running contexts.
    pub fn core_apps(&self, core: CoreId) -> ViewResult<Vec<AppId>> {
        let core_rec = self.get_core(core)?;
        Ok(core_rec
            .ctxs
            .iter()
            .filter_map(|ctx_id| self.records.ctxs.get(ctx_id))
            .filter_map(|ctx| ctx.curr_app)
            .collect())
    }

    pub fn core_running_apps(&self, core: CoreId) -> ViewResult<usize> {
        let apps = self.core_apps(core)?;
        Ok(apps
            .iter()
            .filter(|a| matches!(self.records.apps.get(a).map(|r| r.state), Some(AppState::Running)))
            .count())
    }

    pub fn core_swapout_apps(&self, core: CoreId) -> ViewResult<usize> {
        let apps = self.core_apps(core)?;
        Ok(apps
            .iter()
            .filter(|a| {
                self.records
                    .apps
                    .get(a)
                    .map(|r| r.state.is_swapout())
                    .unwrap_or(false)
            })
            .count())
    }

    pub fn core_free_ctxs(&self, core: CoreId) -> ViewResult<usize> {
        let core_rec = self.get_core(core)?;
        Ok(core_rec
            .ctxs
            .iter()
            .filter_map(|id| self.records.ctxs.get(id))
            .filter(|c| c.is_free())
            .count())
    }

    pub fn total_free_ctxs(&self) -> usize {
        self.records.ctxs.values().filter(|c| c.is_free()).count()
    }

    pub fn total_notsched_apps(&self) -> usize {
        self.records
            .apps
            .values()
            .filter(|a| a.curr_ctx.is_none())
            .count()
    }

    /// Count of apps contributing to load at `core`, per the `only_running`/
    /// `deduct_swapout` flags (spec §4.1).
    fn core_load_count(&self, core: CoreId, only_running: bool, deduct_swapout: bool) -> ViewResult<usize> {
        let core_rec = self.get_core(core)?;
        let sched = core_rec.num_apps_sched as usize;
        if only_running {
            return self.core_running_apps(core);
        }
        if deduct_swapout {
            let swapout = self.core_swapout_apps(core)?;
            return Ok(sched.saturating_sub(swapout));
        }
        Ok(sched)
    }

    pub fn core_full(&self, core: CoreId, only_running: bool, deduct_swapout: bool) -> ViewResult<bool> {
        let count = self.core_load_count(core, only_running, deduct_swapout)?;
        let ctx_count = self.get_core(core)?.ctx_count();
        Ok(count >= ctx_count)
    }

    pub fn core_load_factor(&self, core: CoreId, only_running: bool) -> ViewResult<f64> {
        let count = self.core_load_count(core, only_running, false)?;
        let ctx_count = self.get_core(core)?.ctx_count();
        if ctx_count == 0 {
            Ok(0.0)
        } else {
            Ok(count as f64 / ctx_count as f64)
        }
    }

    pub fn core_recent_ipc(&self, core: CoreId, only_running: bool, host: &dyn PipelineHost) -> ViewResult<f64> {
        let apps = self.core_apps(core)?;
        let mut sum = 0.0;
        for a in apps {
            let counts = if only_running {
                matches!(self.records.apps.get(&a).map(|r| r.state), Some(AppState::Running))
            } else {
                true
            };
            if counts {
                sum += host.recent_ipc_commit(a);
            }
        }
        Ok(sum)
    }

    /// Argmin of load factor over `cores` with at least one free context.
    /// Ties broken by most-recent last-stop timestamp for `tie_app` if
    /// given, else by the deterministic shuffle order (spec §4.7).
    pub fn least_loaded_core(
        &self,
        cores: &[CoreId],
        only_running: bool,
        tie_app: Option<AppId>,
        rng: &mut DeterministicRng,
    ) -> ViewResult<CoreId> {
        let mut candidates: Vec<CoreId> = Vec::new();
        for &c in cores {
            if self.core_free_ctxs(c)? > 0 {
                candidates.push(c);
            }
        }
        if candidates.is_empty() {
            return Err(ViewError::NoCandidate);
        }
        rng.shuffle(&mut candidates);

        let mut best: Option<(CoreId, f64, i64)> = None;
        for c in candidates {
            let lf = self.core_load_factor(c, only_running)?;
            let tie_key = match tie_app {
                Some(app) => self
                    .get_core(c)?
                    .last_stop(app)
                    .map(|cyc| cyc.0 as i64)
                    .unwrap_or(i64::MIN),
                None => 0,
            };
            best = Some(match best {
                None => (c, lf, tie_key),
                Some((bc, blf, btie)) => {
                    if lf < blf || (lf == blf && tie_key > btie) {
                        (c, lf, tie_key)
                    } else {
                        (bc, blf, btie)
                    }
                }
            });
        }
        Ok(best.unwrap().0)
    }

    pub fn least_ipc_core(&self, only_running: bool, host: &dyn PipelineHost) -> ViewResult<CoreId> {
        let mut candidates: Vec<CoreId> = Vec::new();
        for (&id, _) in &self.records.cores {
            if self.core_free_ctxs(id)? > 0 {
                candidates.push(id);
            }
        }
        if candidates.is_empty() {
            return Err(ViewError::NoCandidate);
        }
        let mut best: Option<(CoreId, f64)> = None;
        for c in candidates {
            let ipc = self.core_recent_ipc(c, only_running, host)?;
            best = Some(match best {
                None => (c, ipc),
                Some((bc, bipc)) => if ipc < bipc { (c, ipc) } else { (bc, bipc) },
            });
        }
        Ok(best.unwrap().0)
    }

    pub fn core_idle_ctx(&self, core: CoreId) -> ViewResult<Option<CtxId>> {
        let core_rec = self.get_core(core)?;
        Ok(core_rec
            .ctxs
            .iter()
            .find(|id| self.records.ctxs.get(id).map(|c| c.is_free()).unwrap_or(false))
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Cycle;

    fn two_ctx_one_core() -> Records {
        let mut r = Records::new();
        let core = CoreId::new(0);
        let c0 = CtxId::new(0);
        let c1 = CtxId::new(1);
        r.ctxs.insert(c0, CtxRecord::new(c0, core));
        r.ctxs.insert(c1, CtxRecord::new(c1, core));
        r.cores.insert(core, CoreRecord::new(vec![c0, c1], Cycle(0)));
        r
    }

    #[test]
    fn core_idle_ctx_finds_a_free_context() {
        let mut r = two_ctx_one_core();
        let core = CoreId::new(0);
        let view = r.view();
        assert!(view.core_idle_ctx(core).unwrap().is_some());
        drop(view);
        r.ctxs.get_mut(&CtxId::new(0)).unwrap().start_app(AppId::new(0));
        r.ctxs.get_mut(&CtxId::new(1)).unwrap().start_app(AppId::new(1));
        assert_eq!(r.view().core_idle_ctx(core).unwrap(), None);
    }

    #[test]
    fn unknown_id_is_an_error() {
        let r = two_ctx_one_core();
        assert!(matches!(r.view().get_core(CoreId::new(99)), Err(ViewError::UnknownId(_))));
    }
}
