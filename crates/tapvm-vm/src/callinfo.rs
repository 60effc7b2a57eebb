//! Call frame information.
//!
//! Frames live on a Vec-backed chain owned by the execution state; index 0
//! is the base frame, which is never popped. Discipline: a frame's `top`
//! never exceeds its successor's `base`, and the chain's last entry is the
//! currently executing frame.

/// Per-variant activation data.
#[derive(Clone, Copy, Debug)]
pub enum FrameKind {
    /// A frame running bytecode.
    Scripted {
        /// First register slot of this activation.
        base: usize,
        /// Saved program counter while a callee runs.
        saved_pc: usize,
    },
    /// A frame running a native function.
    Native {
        /// Resumption context for future yield support.
        ctx: i32,
        status: u8,
    },
}

/// One activation record.
#[derive(Clone, Copy, Debug)]
pub struct CallInfo {
    /// Stack slot holding the function being run.
    pub func: usize,
    /// Stack top bound for this activation.
    pub top: usize,
    /// Expected number of results (-1 = all).
    pub num_results: i32,
    pub call_status: u8,
    pub kind: FrameKind,
}

impl CallInfo {
    pub fn scripted(func: usize, base: usize, top: usize, num_results: i32) -> Self {
        CallInfo {
            func,
            top,
            num_results,
            call_status: 0,
            kind: FrameKind::Scripted { base, saved_pc: 0 },
        }
    }

    pub fn native(func: usize, top: usize, num_results: i32) -> Self {
        CallInfo {
            func,
            top,
            num_results,
            call_status: 0,
            kind: FrameKind::Native { ctx: 0, status: 0 },
        }
    }

    pub fn is_scripted(&self) -> bool {
        matches!(self.kind, FrameKind::Scripted { .. })
    }

    /// First stack slot belonging to this activation.
    pub fn base(&self) -> usize {
        match self.kind {
            FrameKind::Scripted { base, .. } => base,
            FrameKind::Native { .. } => self.func + 1,
        }
    }
}
