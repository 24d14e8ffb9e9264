//! Trait interfaces for the external collaborators AppMgr consumes but does
//! not own (spec §1, §6): the simulated pipeline/contexts/buses/caches/TLBs,
//! and the global event queue. AppMgr is generic over these so tests can
//! supply a mock implementation (spec's own testing expansion) while a real
//! driver supplies the simulator.

use crate::ids::{AppId, CoreId, CtxId};
use crate::time::Cycle;

/// How a context halt should be carried out; passed through opaquely to
/// `context_halt_signal`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HaltStyle {
    Normal,
    Migrate,
    LongMiss,
}

/// Which memory-hierarchy cache level a population query targets (spec §6
/// stats: per-app L1D/L2/L3 block populations).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CacheLevel {
    L1d,
    L2,
    L3,
}

/// Opaque operations on the simulated pipeline, contexts, cores, buses,
/// caches and TLBs (spec §6 "Collaborator interfaces consumed").
pub trait PipelineHost {
    fn context_halt_signal(&mut self, ctx: CtxId, style: HaltStyle);
    fn context_go(&mut self, ctx: CtxId, app: AppId, start_cyc: Cycle);

    /// Returns the completion cycle of a bus access that takes `op_time`
    /// cycles.
    fn corebus_access(&mut self, ctx: CtxId, op_time: u64) -> Cycle;

    /// `false` = registration succeeded (swap-out may proceed), `true` =
    /// registration failed and the swap-out must be abandoned.
    fn cache_register_blocked_app(&mut self, ctx: CtxId, miss_id: u64) -> bool;

    fn cache_get_population(&self, cache: CacheLevel, app: AppId) -> i64;

    /// Per-app total retired-instruction count, backing `resident_ipc`.
    fn app_commits(&self, app: AppId) -> i64;
    /// Per-app IPC since its last swap-in, backing `core_recent_ipc`.
    fn recent_ipc_commit(&self, app: AppId) -> f64;

    /// Whether register `reg` holds state not yet written back (spill-dirty
    /// filtering, spec §4.3).
    fn reg_is_dirty(&self, ctx: CtxId, reg: u32) -> bool;
    /// Live DTLB entries for `ctx`, used by the fill pass to decide which
    /// entries predate the spill cycle (spec §4.3, §8 item 10).
    fn dtlb_entries(&self, ctx: CtxId) -> Vec<DtlbEntry>;

    fn inject_alloc(&mut self, ctx: CtxId) -> Option<u64>;
    fn inject_set_bmtspill(&mut self, slot: u64, reg: u32, is_final: bool, is_block_boundary: bool);
    fn inject_set_bmtfill(&mut self, slot: u64, reg: u32, is_final: bool, is_block_boundary: bool);
    fn inject_at_rename(&mut self, ctx: CtxId, slot: u64);

    fn tlb_inject(&mut self, ctx: CtxId, cyc: Cycle, base_addr: u64, app: AppId);
    fn rs_push(&mut self, ctx: CtxId, pc: u64);
    /// Returns 0 when the return stack is empty.
    fn rs_pop(&mut self, ctx: CtxId) -> u64;

    /// Returns core owning `ctx`; used only by tests/mocks that need to
    /// assert on topology already known to `Records`.
    fn core_of(&self, ctx: CtxId) -> CoreId;
}

/// A single DTLB entry as tracked for spill/fill replay (spec §4.3, §8 item
/// 10): entries with `ready_time` strictly earlier than the spill cycle are
/// re-injected on fill; newer ones are discarded.
#[derive(Debug, Copy, Clone)]
pub struct DtlbEntry {
    pub base_addr: u64,
    pub ready_time: Cycle,
}

/// The global callback queue is an external collaborator per spec §1/§6
/// (`callbackq_enqueue`/`callbackq_cancel_ret`), but its callbacks need
/// mutable access to the coordinator itself, not just to `PipelineHost` — so
/// it is not expressed as a trait here. [`crate::event::EventQueue`] is a
/// concrete queue generic over the coordinator type, following the same
/// `BinaryHeap`-of-timestamped-callbacks shape this trait's sibling
/// interfaces describe.
