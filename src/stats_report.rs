//! Stats report formatting (spec §6 "Stats output"). Statistics
//! *formatting* for a human report is an external collaborator per spec §1
//! ("statistics formatting" is out of scope) — but producing the
//! machine-readable rows driver code hands to that formatter is in scope,
//! matching the original's `printstats`, which both computes and writes in
//! one pass. We split the two: this module computes rows; a caller-supplied
//! `Write` receives them, prefixed as the original prefixes every line.

use std::fmt::Write as _;

use crate::collab::{CacheLevel, PipelineHost};
use crate::ids::AppId;
use crate::time::Cycle;
use crate::view::ManagerView;

/// One line of a `BasicStat` report: `prefix name n mean min max stddev`.
fn stat_line(out: &mut String, prefix: &str, name: &str, stat: &crate::stats::BasicStat) {
    let _ = writeln!(
        out,
        "{prefix}{name} n={} mean={:.3} min={:.3} max={:.3} stddev={:.3}",
        stat.n(),
        stat.mean(),
        stat.min(),
        stat.max(),
        stat.stddev()
    );
}

/// Renders the full stats report described in spec §6 into `out`, prefixed
/// by `prefix` on every line (mirroring the original `printstats(out,
/// prefix)`).
pub fn print_stats(out: &mut String, prefix: &str, view: &ManagerView, host: &dyn PipelineHost, now: Cycle) {
    for (&app_id, app) in view_apps(view) {
        let ctx_run = app.state_residence_cyc.get(crate::app::AppState::Running);
        let ctx_stalled = app.state_residence_cyc.get(crate::app::AppState::RunningLongMiss);
        let ready = app.state_residence_cyc.get(crate::app::AppState::Ready);
        let swapping = [
            crate::app::AppState::SwapIn,
            crate::app::AppState::SwapOutLongMiss,
            crate::app::AppState::SwapOutLongMissCancel,
            crate::app::AppState::SwapOutMigrate,
            crate::app::AppState::SwapOutSched,
        ]
        .iter()
        .map(|s| app.state_residence_cyc.get(*s))
        .sum::<u64>();
        let waiting = app.state_residence_cyc.get(crate::app::AppState::WaitLongMiss);

        let _ = writeln!(
            out,
            "{prefix}app {app_id} ctx_run={ctx_run} ctx_stalled={ctx_stalled} ready={ready} swapping={swapping} waiting={waiting}"
        );

        for (ctx, cyc) in app.residency_cyc.iter() {
            let _ = writeln!(out, "{prefix}app {app_id} resident_cyc ctx={ctx} cyc={cyc}");
        }
        for (ctx, n) in app.swapin_count.iter() {
            let _ = writeln!(out, "{prefix}app {app_id} swapin_count ctx={ctx} n={n}");
        }

        let _ = writeln!(
            out,
            "{prefix}app {app_id} swapin_repeat_frac={:.4}",
            app.swapin_repeat_frac()
        );
        let _ = writeln!(
            out,
            "{prefix}app {app_id} mean_swappedin_cyc={:.3}",
            app.mean_swappedin_cyc(now)
        );
        let _ = writeln!(
            out,
            "{prefix}app {app_id} resident_ipc={:.4}",
            app.resident_ipc(host.app_commits(app_id))
        );

        for (level, name) in [(CacheLevel::L1d, "l1d"), (CacheLevel::L2, "l2"), (CacheLevel::L3, "l3")] {
            let pop = host.cache_get_population(level, app_id);
            let _ = writeln!(out, "{prefix}app {app_id} cache_pop_{name}={pop}");
        }

        stat_line(out, prefix, &format!("app {app_id} deact_halt"), &app.timing.deact_halt);
        stat_line(out, prefix, &format!("app {app_id} deact_swapout"), &app.timing.deact_swapout);
        stat_line(out, prefix, &format!("app {app_id} deact_sum"), &app.timing.deact_sum);
        stat_line(out, prefix, &format!("app {app_id} activ_fetch"), &app.timing.activ_fetch);
        stat_line(out, prefix, &format!("app {app_id} activ_commit"), &app.timing.activ_commit);
        stat_line(out, prefix, &format!("app {app_id} migrate_fetch"), &app.timing.migrate_fetch);
        stat_line(out, prefix, &format!("app {app_id} migrate_commit"), &app.timing.migrate_commit);
    }

    for core in view.core_ids() {
        if let Ok(core_rec) = view.get_core(core) {
            for (tlp, cyc) in core_rec.tlp_sched.iter() {
                let _ = writeln!(out, "{prefix}core {core} tlp_sched={tlp} cyc={cyc}");
            }
            for (tlp, cyc) in core_rec.tlp_sched_minus_stalled.iter() {
                let _ = writeln!(out, "{prefix}core {core} tlp_sched_minus_stalled={tlp} cyc={cyc}");
            }
        }
    }
}

fn view_apps<'a>(view: &'a ManagerView) -> impl Iterator<Item = (&'a AppId, &'a crate::app::AppRecord)> {
    view.apps_iter()
}
