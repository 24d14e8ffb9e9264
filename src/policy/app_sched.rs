//! `AppScheduler`: chooses which ready application to dispatch next (spec
//! §4.4). The only variant named in the configuration contract is
//! `OldestApp`, a FIFO.

use std::collections::VecDeque;

use crate::ids::AppId;

#[derive(Debug, Clone)]
pub enum AppSchedPolicy {
    OldestApp { ready: VecDeque<AppId> },
}

impl AppSchedPolicy {
    pub fn oldest_app() -> Self {
        AppSchedPolicy::OldestApp { ready: VecDeque::new() }
    }

    /// Parses the `sched_app` configuration key (spec §6).
    pub fn from_config_key(key: &str) -> anyhow::Result<Self> {
        match key {
            "OldestApp" => Ok(Self::oldest_app()),
            other => anyhow::bail!("unknown sched_app policy {other:?}"),
        }
    }

    pub fn app_ready(&mut self, id: AppId) {
        match self {
            AppSchedPolicy::OldestApp { ready } => ready.push_back(id),
        }
    }

    pub fn app_notready(&mut self, id: AppId) {
        match self {
            AppSchedPolicy::OldestApp { ready } => ready.retain(|&a| a != id),
        }
    }

    pub fn will_schedule(&self) -> bool {
        match self {
            AppSchedPolicy::OldestApp { ready } => !ready.is_empty(),
        }
    }

    pub fn schedule_one(&mut self) -> Option<AppId> {
        match self {
            AppSchedPolicy::OldestApp { ready } => ready.pop_front(),
        }
    }

    /// Returns `id` to the front of the queue, preserving relative order of
    /// the remaining ready apps (spec §4.4).
    pub fn undo_schedule(&mut self, id: AppId) {
        match self {
            AppSchedPolicy::OldestApp { ready } => ready.push_front(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_app_is_fifo_and_undo_pushes_front() {
        let mut p = AppSchedPolicy::oldest_app();
        p.app_ready(AppId::new(1));
        p.app_ready(AppId::new(2));
        assert_eq!(p.schedule_one(), Some(AppId::new(1)));
        p.undo_schedule(AppId::new(1));
        assert_eq!(p.schedule_one(), Some(AppId::new(1)));
        assert_eq!(p.schedule_one(), Some(AppId::new(2)));
        assert_eq!(p.schedule_one(), None);
    }

    #[test]
    fn app_notready_removes_from_queue() {
        let mut p = AppSchedPolicy::oldest_app();
        p.app_ready(AppId::new(1));
        p.app_ready(AppId::new(2));
        p.app_notready(AppId::new(1));
        assert_eq!(p.schedule_one(), Some(AppId::new(2)));
    }
}
