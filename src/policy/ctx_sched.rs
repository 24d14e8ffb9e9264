//! `CtxScheduler`: chooses a target context for a ready application (spec
//! §4.4).

use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::collab::PipelineHost;
use crate::ids::{AppId, CoreId, CtxId};
use crate::rng::DeterministicRng;
use crate::view::ManagerView;

#[derive(Debug, Clone)]
pub enum CtxSchedPolicy {
    FirstIdle {
        idle: VecDeque<CtxId>,
    },
    LightestLoad {
        deduct_nonrun: bool,
    },
    LeastIpc {
        deduct_nonrun: bool,
    },
    Static {
        map: BTreeMap<AppId, CtxId>,
        allow_missing_apps: bool,
    },
    StaticSetAffin {
        affin: BTreeMap<AppId, Vec<CoreId>>,
        force_sched: bool,
    },
    MutableMap {
        map: BTreeMap<AppId, CoreId>,
    },
}

impl CtxSchedPolicy {
    pub fn first_idle() -> Self {
        CtxSchedPolicy::FirstIdle { idle: VecDeque::new() }
    }

    pub fn lightest_load(deduct_nonrun: bool) -> Self {
        CtxSchedPolicy::LightestLoad { deduct_nonrun }
    }

    pub fn least_ipc(deduct_nonrun: bool) -> Self {
        CtxSchedPolicy::LeastIpc { deduct_nonrun }
    }

    /// Duplicate-target check happens here, at construction time. Bounds
    /// checking against the actual context count is deferred to
    /// [`Self::validate_bounds`], called once `setup_done` is known (the
    /// context set isn't populated yet when policies are constructed —
    /// spec §4.5's constructor runs before any `register_idle_ctx`).
    pub fn static_map(map: BTreeMap<AppId, CtxId>, allow_missing_apps: bool) -> anyhow::Result<Self> {
        let mut seen = HashSet::new();
        for (&app, &ctx) in &map {
            if !seen.insert(ctx) {
                anyhow::bail!("Static sched target {ctx} for app {app} assigned to more than one app");
            }
        }
        Ok(CtxSchedPolicy::Static { map, allow_missing_apps })
    }

    /// Bounds-checks every `Static` target against the now-known set of
    /// registered context ids (spec §4.4: "bounds-checked").
    pub fn validate_bounds(&self, known_ctxs: &std::collections::BTreeSet<CtxId>) -> anyhow::Result<()> {
        if let CtxSchedPolicy::Static { map, .. } = self {
            for (&app, &ctx) in map {
                if !known_ctxs.contains(&ctx) {
                    anyhow::bail!("Static sched target {ctx} for app {app} is out of bounds");
                }
            }
        }
        Ok(())
    }

    pub fn static_set_affin(affin: BTreeMap<AppId, Vec<CoreId>>, force_sched: bool) -> Self {
        CtxSchedPolicy::StaticSetAffin { affin, force_sched }
    }

    pub fn mutable_map(map: BTreeMap<AppId, CoreId>) -> Self {
        CtxSchedPolicy::MutableMap { map }
    }

    pub fn is_mutable_map(&self) -> bool {
        matches!(self, CtxSchedPolicy::MutableMap { .. })
    }

    pub fn ctx_idle(&mut self, id: CtxId) {
        if let CtxSchedPolicy::FirstIdle { idle } = self {
            if !idle.contains(&id) {
                idle.push_back(id);
            }
        }
    }

    pub fn ctx_notidle(&mut self, id: CtxId) {
        if let CtxSchedPolicy::FirstIdle { idle } = self {
            idle.retain(|&c| c != id);
        }
    }

    pub fn will_schedule(&self) -> bool {
        match self {
            CtxSchedPolicy::FirstIdle { idle } => !idle.is_empty(),
            _ => true,
        }
    }

    pub fn schedule_one(
        &mut self,
        app: AppId,
        view: &ManagerView,
        rng: &mut DeterministicRng,
        host: &dyn PipelineHost,
    ) -> Option<CtxId> {
        match self {
            CtxSchedPolicy::FirstIdle { idle } => idle.pop_front(),
            CtxSchedPolicy::LightestLoad { deduct_nonrun } => {
                let cores = view.core_ids();
                let core = view
                    .least_loaded_core(&cores, *deduct_nonrun, None, rng)
                    .ok()?;
                view.core_idle_ctx(core).ok().flatten()
            }
            CtxSchedPolicy::LeastIpc { deduct_nonrun } => {
                let core = view.least_ipc_core(*deduct_nonrun, host).ok()?;
                view.core_idle_ctx(core).ok().flatten()
            }
            CtxSchedPolicy::Static { map, allow_missing_apps } => match map.get(&app) {
                Some(&ctx) => Some(ctx),
                None => {
                    if *allow_missing_apps {
                        None
                    } else {
                        crate::fatal!("Static ctx scheduler has no mapping for app {app}");
                    }
                }
            },
            CtxSchedPolicy::StaticSetAffin { affin, force_sched } => {
                let cores = affin.get(&app).cloned().unwrap_or_default();
                if let Ok(core) = view.least_loaded_core(&cores, false, None, rng) {
                    return view.core_idle_ctx(core).ok().flatten();
                }
                if *force_sched {
                    let all = view.core_ids();
                    let core = view.least_loaded_core(&all, false, None, rng).ok()?;
                    return view.core_idle_ctx(core).ok().flatten();
                }
                None
            }
            CtxSchedPolicy::MutableMap { map } => {
                let core = *map.get(&app)?;
                if view.core_full(core, false, false).ok()? {
                    return None;
                }
                view.core_idle_ctx(core).ok().flatten()
            }
        }
    }

    /// Used by the "swap-suppress guess" veto (spec §4.5): guesses which
    /// core an app would land on without actually scheduling it. Only
    /// `MutableMap` implements this; other variants return `None`.
    pub fn schedule_guess_core(&self, app: AppId) -> Option<CoreId> {
        match self {
            CtxSchedPolicy::MutableMap { map } => map.get(&app).copied(),
            _ => None,
        }
    }

    /// `MutableMap`-only runtime mutation (spec §4.4).
    pub fn sched_add_app(&mut self, app: AppId, core: CoreId) {
        if let CtxSchedPolicy::MutableMap { map } = self {
            map.insert(app, core);
        }
    }

    pub fn sched_remove_app(&mut self, app: AppId) {
        if let CtxSchedPolicy::MutableMap { map } = self {
            map.remove(&app);
        }
    }

    pub fn g_core_sched_count(&self, core: CoreId) -> usize {
        match self {
            CtxSchedPolicy::MutableMap { map } => map.values().filter(|&&c| c == core).count(),
            _ => 0,
        }
    }

    /// Whether `core` has more apps mapped to it than it has contexts
    /// (spec §4.4, backing `SwapGatePolicy::IfCoreOversubscribed`).
    pub fn is_core_oversubscribed(&self, core: CoreId, view: &ManagerView) -> bool {
        match self {
            CtxSchedPolicy::MutableMap { .. } => {
                let ctx_count = view.get_core(core).map(|c| c.ctx_count()).unwrap_or(0);
                self.g_core_sched_count(core) > ctx_count
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_idle_is_fifo() {
        let mut p = CtxSchedPolicy::first_idle();
        p.ctx_idle(CtxId::new(0));
        p.ctx_idle(CtxId::new(1));
        p.ctx_notidle(CtxId::new(0));
        p.ctx_idle(CtxId::new(0));
        assert_eq!(p.will_schedule(), true);
    }

    #[test]
    fn static_rejects_duplicate_targets() {
        let mut map = BTreeMap::new();
        map.insert(AppId::new(0), CtxId::new(0));
        map.insert(AppId::new(1), CtxId::new(0));
        let result = CtxSchedPolicy::static_map(map, false);
        assert!(result.is_err());
    }

    #[test]
    fn static_validate_bounds_rejects_unknown_target() {
        let mut map = BTreeMap::new();
        map.insert(AppId::new(0), CtxId::new(5));
        let policy = CtxSchedPolicy::static_map(map, false).unwrap();
        let mut known = std::collections::BTreeSet::new();
        known.insert(CtxId::new(0));
        known.insert(CtxId::new(1));
        assert!(policy.validate_bounds(&known).is_err());
    }
}
