//! `CtxRecord`: per-context state (spec §3) plus the spill/fill cursor
//! (§4.3), which tracks progress through register/return-stack/DTLB/GHR
//! enumeration independently of the app-level state machine.

use crate::ids::{AppId, CoreId, CtxId};

/// Which step the spill/fill cursor is currently on. Order matches spec
/// §4.3: registers, then GHR, then return-stack, then DTLB.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CursorPhase {
    Registers,
    Ghr,
    RetStack,
    Dtlb,
    Done,
}

/// Cursor over the ordered sequence of spill (or fill) steps for one
/// context. Reused across back-pressure reschedules: `step` is the only
/// mutable progress marker, so resuming after a stall just continues from
/// where it left off.
#[derive(Debug, Clone)]
pub struct SpillFillCursor {
    pub phase: CursorPhase,
    /// 0-based index within the current phase.
    pub step: u32,
    pub is_spill: bool,
}

impl SpillFillCursor {
    pub fn new(is_spill: bool) -> Self {
        Self {
            phase: CursorPhase::Registers,
            step: 0,
            is_spill,
        }
    }
}

pub struct CtxRecord {
    pub id: CtxId,
    pub core_id: CoreId,
    pub curr_app: Option<AppId>,
    pub reserved_app: Option<AppId>,
    pub spilling_app: Option<AppId>,
    pub cursor: Option<SpillFillCursor>,
    /// Last cycle this context stopped hosting each app (spec §3 CoreRecord
    /// "per-app last-stop timestamps" are aggregated at the core level, but
    /// we additionally keep the immediately-preceding one here since
    /// `least_loaded_core`'s tie-break reads it per context's owning core).
    pub last_stop_cyc: Option<crate::time::Cycle>,
}

impl CtxRecord {
    pub fn new(id: CtxId, core_id: CoreId) -> Self {
        Self {
            id,
            core_id,
            curr_app: None,
            reserved_app: None,
            spilling_app: None,
            cursor: None,
            last_stop_cyc: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.curr_app.is_none() && self.reserved_app.is_none()
    }

    /// Reserves this context for `app`. Fatal if already occupied — callers
    /// must unreserve/free before reserving again (spec §3 CtxRecord note).
    pub fn reserve(&mut self, app: AppId) {
        if self.reserved_app.is_some() || self.curr_app.is_some() {
            crate::fatal!(
                "context {} reserved for {} while already occupied (curr={:?}, reserved={:?})",
                self.id,
                app,
                self.curr_app,
                self.reserved_app
            );
        }
        self.reserved_app = Some(app);
    }

    pub fn unreserve(&mut self) {
        self.reserved_app = None;
    }

    pub fn start_app(&mut self, app: AppId) {
        self.reserved_app = None;
        self.curr_app = Some(app);
    }

    pub fn free(&mut self) {
        self.curr_app = None;
        self.spilling_app = None;
        self.cursor = None;
    }
}
