//! `SpillFillEngine`: per-context register/return-stack/DTLB/GHR spill and
//! fill micro-op generator (spec §4.3).

use crate::collab::{DtlbEntry, PipelineHost};
use crate::ctx::{CtxRecord, CursorPhase, SpillFillCursor};
use crate::ids::{AppId, CtxId};
use crate::time::Cycle;

pub const ZERO_REG: u32 = 0;
const NUM_REGS: u32 = 64;

/// Process-wide, immutable-after-init spill/fill parameters (spec §4.3).
#[derive(Debug, Clone)]
pub struct SpillFillConfig {
    pub spill_dirty_only: bool,
    pub spill_ghr: bool,
    pub spill_retstack_size: u32,
    pub spill_dtlb_size: u32,
    pub inst_spill_fill: bool,
    pub inst_spill_fill_early: bool,
    pub thread_swapin_cyc: u64,
    pub thread_swapout_cyc: u64,
    pub regs_per_sf_block: u32,
    pub migrate_fills_are_free: bool,
}

/// One planned micro-op in a spill or fill sequence.
#[derive(Debug, Clone, Copy)]
pub struct PlannedStep {
    pub reg: u32,
    pub is_block_boundary: bool,
    pub is_final: bool,
    pub kind: StepKind,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StepKind {
    Register,
    Ghr,
    RetStack,
    /// `true` = virtual half of the pair, `false` = physical half.
    Dtlb(bool),
}

/// Result of attempting to emit one step of an in-progress spill/fill.
#[derive(Debug)]
pub enum StepResult {
    /// The slot was unavailable; the engine rescheduled itself for
    /// `now + 1` and the cursor was left untouched.
    BackPressure,
    /// A step was emitted. `is_final` marks the last step of the sequence.
    Emitted { is_final: bool },
    /// The cursor had already completed; nothing to do.
    Done,
}

pub struct SpillFillEngine {
    pub config: SpillFillConfig,
}

impl SpillFillEngine {
    pub fn new(config: SpillFillConfig) -> Self {
        Self { config }
    }

    /// Builds the ordered plan for a spill on `ctx`: registers (skipping the
    /// zero register, and clean registers when `spill_dirty_only`), then the
    /// GHR if enabled, then return-stack steps, then DTLB steps (spec §4.3,
    /// verified against spec's Scenario F ordering and block-boundary
    /// indices).
    pub fn plan_spill(&self, ctx: CtxId, host: &dyn PipelineHost) -> Vec<PlannedStep> {
        let mut regs = Vec::new();
        for reg in 1..NUM_REGS {
            if self.config.spill_dirty_only && !host.reg_is_dirty(ctx, reg) {
                continue;
            }
            regs.push(reg);
        }
        let ghr = self.config.spill_ghr;
        let retstack_steps = self.config.spill_retstack_size;
        let dtlb_steps = self.config.spill_dtlb_size * 2;
        self.assemble(regs, ghr, retstack_steps, dtlb_steps)
    }

    /// Builds the fill plan mirroring the spill ordering. Unlike spill,
    /// register/retstack selection for fill is driven by what was actually
    /// spilled, so the caller passes the exact register list and DTLB entry
    /// count that the matching spill emitted.
    pub fn plan_fill(&self, spilled_regs: Vec<u32>, retstack_steps: u32, dtlb_entry_count: u32) -> Vec<PlannedStep> {
        let ghr = self.config.spill_ghr;
        self.assemble(spilled_regs, ghr, retstack_steps, dtlb_entry_count * 2)
    }

    fn assemble(
        &self,
        regs: Vec<u32>,
        ghr: bool,
        retstack_steps: u32,
        dtlb_steps: u32,
    ) -> Vec<PlannedStep> {
        let mut steps: Vec<(u32, StepKind)> = Vec::new();
        for r in regs {
            steps.push((r, StepKind::Register));
        }
        if ghr {
            steps.push((ZERO_REG, StepKind::Ghr));
        }
        for _ in 0..retstack_steps {
            steps.push((ZERO_REG, StepKind::RetStack));
        }
        for i in 0..dtlb_steps {
            // Alternates virtual, physical per entry (spec §4.3: "twice the
            // cap: one step for virtual, one for physical").
            steps.push((ZERO_REG, StepKind::Dtlb(i % 2 == 0)));
        }

        let total = steps.len();
        let block = self.config.regs_per_sf_block.max(1);
        steps
            .into_iter()
            .enumerate()
            .map(|(i, (reg, kind))| PlannedStep {
                reg,
                is_block_boundary: (i as u32) % block == 0 || i + 1 == total,
                is_final: i + 1 == total,
                kind,
            })
            .collect()
    }

    /// DTLB entries eligible for re-injection on fill: those whose
    /// `ready_time` is strictly earlier than `spill_cyc` (spec §8 item 10).
    pub fn eligible_dtlb_entries(
        &self,
        ctx: CtxId,
        spill_cyc: Cycle,
        host: &dyn PipelineHost,
    ) -> Vec<DtlbEntry> {
        host.dtlb_entries(ctx)
            .into_iter()
            .filter(|e| e.ready_time < spill_cyc)
            .take(self.config.spill_dtlb_size as usize)
            .collect()
    }

    /// Starts a spill on `ctx`, installing a fresh cursor driven by
    /// `plan_spill`. The caller is responsible for stepping it via
    /// [`Self::step`].
    pub fn start_spill(&self, ctx: &mut CtxRecord, spilling_app: AppId) {
        ctx.spilling_app = Some(spilling_app);
        ctx.cursor = Some(SpillFillCursor::new(true));
    }

    pub fn start_fill(&self, ctx: &mut CtxRecord) {
        ctx.cursor = Some(SpillFillCursor::new(false));
    }

    /// Attempts to emit the next step of `ctx`'s in-progress cursor against
    /// the precomputed `plan`. On back-pressure (no active-list slot), the
    /// cursor is left exactly where it was so a later retry resumes cleanly.
    pub fn step(
        &self,
        ctx_id: CtxId,
        ctx: &mut CtxRecord,
        plan: &[PlannedStep],
        host: &mut dyn PipelineHost,
    ) -> StepResult {
        let cursor = match &mut ctx.cursor {
            Some(c) => c,
            None => return StepResult::Done,
        };
        if cursor.phase == CursorPhase::Done {
            return StepResult::Done;
        }
        let idx = cursor.step as usize;
        let Some(planned) = plan.get(idx) else {
            cursor.phase = CursorPhase::Done;
            return StepResult::Done;
        };

        let Some(slot) = host.inject_alloc(ctx_id) else {
            return StepResult::BackPressure;
        };

        if cursor.is_spill {
            host.inject_set_bmtspill(slot, planned.reg, planned.is_final, planned.is_block_boundary);
        } else {
            host.inject_set_bmtfill(slot, planned.reg, planned.is_final, planned.is_block_boundary);
            if self.config.inst_spill_fill_early {
                host.inject_at_rename(ctx_id, slot);
            }
        }

        cursor.step += 1;
        cursor.phase = match planned.kind {
            StepKind::Register => CursorPhase::Registers,
            StepKind::Ghr => CursorPhase::Ghr,
            StepKind::RetStack => CursorPhase::RetStack,
            StepKind::Dtlb(_) => CursorPhase::Dtlb,
        };
        if planned.is_final {
            cursor.phase = CursorPhase::Done;
        }
        StepResult::Emitted { is_final: planned.is_final }
    }
}
