//! Execution states, shared global state, and the runtime that owns both.
//!
//! A [`State`] is one logical flow of control: a value stack plus a call
//! chain. [`GlobalState`] is created once per runtime instance and shared by
//! every state: the string table, the heap, the registry, the open-upvalue
//! list, and the diagnostic sink. Nothing here locks internally; a host
//! with concurrently firing probe contexts serializes through
//! [`Runtime::into_shared`] (one coarse lock — allocation never blocks
//! inside it, so the hold time is bounded by the probe body).

use crate::callinfo::{CallInfo, FrameKind};
use std::sync::{Arc, Mutex};
use tapvm_core::closure::{UpvalLink, Upvalue};
use tapvm_core::error::RtError;
use tapvm_core::gc::{GcIdx, Heap};
use tapvm_core::object::type_name;
use tapvm_core::string::StringTable;
use tapvm_core::table::Table;
use tapvm_core::value::{ThreadId, Value};

/// Registry slot holding the main thread.
pub const RIDX_MAINTHREAD: i64 = 1;
/// Registry slot holding the globals table.
pub const RIDX_GLOBALS: i64 = 2;

pub const MAIN_THREAD: ThreadId = ThreadId(0);

/// Slots reserved for a native frame's scratch space.
const MIN_FRAME_SLOTS: usize = 20;

const BASIC_STACK_SIZE: usize = 256;
const MAX_STACK_SIZE: usize = 1 << 20;
const MAX_CALL_DEPTH: usize = 200;

/// Where diagnostics go. The runtime-error path formats a message and hands
/// it here; it never writes to the host's output directly.
pub trait DiagSink: Send {
    fn emit(&mut self, line: &str);
}

/// Default sink for user-space embedding.
pub struct StdoutSink;

impl DiagSink for StdoutSink {
    fn emit(&mut self, line: &str) {
        println!("{line}");
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadStatus {
    Ok,
    Dead,
}

struct OpenUpval {
    thread: ThreadId,
    slot: usize,
    upval: GcIdx<Upvalue>,
}

/// Process-wide shared state, created once per runtime instance.
pub struct GlobalState {
    pub strings: StringTable,
    pub heap: Heap,
    pub registry: GcIdx<Table>,
    /// All open upvalues, ordered by (thread, slot) descending so a frame's
    /// span closes in one forward sweep.
    open_upvals: Vec<OpenUpval>,
    pub diag: Box<dyn DiagSink>,
}

impl GlobalState {
    /// The string-hash seed.
    pub fn seed(&self) -> u32 {
        self.strings.seed()
    }
}

/// One execution state: a value stack and a call chain.
pub struct State {
    pub stack: Vec<Value>,
    /// Index of the first free stack slot.
    pub top: usize,
    /// Call chain; index 0 is the base frame and is never popped.
    frames: Vec<CallInfo>,
    pub status: ThreadStatus,
    tracing: bool,
}

impl State {
    fn new() -> Self {
        State {
            stack: vec![Value::Nil; BASIC_STACK_SIZE],
            top: 0,
            frames: vec![CallInfo::native(0, MIN_FRAME_SLOTS, -1)],
            status: ThreadStatus::Ok,
            tracing: false,
        }
    }

    pub fn push(&mut self, v: Value) -> Result<(), RtError> {
        self.ensure_stack(1)?;
        self.stack[self.top] = v;
        self.top += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Value {
        debug_assert!(self.top > 0, "pop on empty stack");
        self.top -= 1;
        self.stack[self.top]
    }

    /// Guarantee `extra` slots above the current top.
    pub fn ensure_stack(&mut self, extra: usize) -> Result<(), RtError> {
        let needed = self.top + extra;
        if needed > self.stack.len() {
            if needed > MAX_STACK_SIZE {
                return Err(RtError::StackOverflow);
            }
            let new_len = needed.max(self.stack.len() * 2).min(MAX_STACK_SIZE);
            self.stack.resize(new_len, Value::Nil);
        }
        Ok(())
    }

    /// Number of frames on the chain, the base frame included.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// The currently executing frame.
    pub fn current_frame(&self) -> &CallInfo {
        self.frames.last().expect("call chain empty")
    }

    pub fn is_tracing(&self) -> bool {
        self.tracing
    }
}

/// A runtime instance: the shared global state plus its execution states.
/// Thread 0 is the main thread.
pub struct Runtime {
    pub global: GlobalState,
    threads: Vec<State>,
}

/// The documented concurrency discipline for shared global state: a single
/// coarse lock around the whole runtime.
pub type SharedRuntime = Arc<Mutex<Runtime>>;

impl Runtime {
    pub fn new() -> Result<Self, RtError> {
        Self::with_mem_limit(usize::MAX)
    }

    /// A runtime whose heap fails allocation past `limit` bytes.
    pub fn with_mem_limit(limit: usize) -> Result<Self, RtError> {
        let seed = make_seed();
        let mut heap = Heap::with_limit(limit);
        let strings = StringTable::new(seed);
        let registry = heap.alloc_table()?;
        let globals = heap.alloc_table()?;
        let reg = heap.table_mut(registry);
        reg.set_int(RIDX_MAINTHREAD, Value::Thread(MAIN_THREAD), &strings)?;
        reg.set_int(RIDX_GLOBALS, Value::Table(globals), &strings)?;
        Ok(Runtime {
            global: GlobalState {
                strings,
                heap,
                registry,
                open_upvals: Vec::new(),
                diag: Box::new(StdoutSink),
            },
            threads: vec![State::new()],
        })
    }

    pub fn into_shared(self) -> SharedRuntime {
        Arc::new(Mutex::new(self))
    }

    pub fn set_diag(&mut self, sink: Box<dyn DiagSink>) {
        self.global.diag = sink;
    }

    // ---- Threads ----

    pub fn thread(&self, th: ThreadId) -> &State {
        &self.threads[th.0 as usize]
    }

    pub fn thread_mut(&mut self, th: ThreadId) -> &mut State {
        &mut self.threads[th.0 as usize]
    }

    /// Spawn a fresh execution state sharing this runtime's global state.
    pub fn new_thread(&mut self) -> ThreadId {
        let id = ThreadId(self.threads.len() as u32);
        self.threads.push(State::new());
        id
    }

    /// The globals table, from its registry slot.
    pub fn globals(&self) -> GcIdx<Table> {
        self.global
            .heap
            .table(self.global.registry)
            .get_int(RIDX_GLOBALS)
            .as_table()
            .expect("registry globals slot corrupted")
    }

    // ---- Call frames ----

    /// Extend the call chain with an activation of the function at
    /// `func_slot`. Arguments are the slots between `func_slot` and the
    /// state's top.
    pub fn push_frame(
        &mut self,
        th: ThreadId,
        func_slot: usize,
        num_results: i32,
    ) -> Result<(), RtError> {
        let state = self.thread_mut(th);
        if state.frames.len() >= MAX_CALL_DEPTH {
            return Err(RtError::StackOverflow);
        }
        let func = state.stack[func_slot];
        let base = func_slot + 1;
        // Frames nest: a callee's window starts inside its caller's.
        debug_assert!(base >= state.current_frame().base());
        let ci = match func {
            Value::ScriptedClosure(c) => {
                let proto = self.global.heap.scripted(c).proto;
                let max_stack = self.global.heap.proto(proto).max_stack_size as usize;
                let state = self.thread_mut(th);
                let top = base + max_stack;
                state.ensure_stack(top.saturating_sub(state.top))?;
                state.top = top;
                CallInfo::scripted(func_slot, base, top, num_results)
            }
            Value::NativeFunc(_) | Value::NativeClosure(_) => {
                let top = base + MIN_FRAME_SLOTS;
                state.ensure_stack(top.saturating_sub(state.top))?;
                CallInfo::native(func_slot, top, num_results)
            }
            other => {
                return Err(RtError::TypeMismatch {
                    expected: "function",
                    found: type_name(other),
                })
            }
        };
        self.thread_mut(th).frames.push(ci);
        Ok(())
    }

    /// Unwind the current frame: close every upvalue opened on its slots,
    /// then drop it and give its stack window back to the caller.
    pub fn pop_frame(&mut self, th: ThreadId) -> Result<(), RtError> {
        if self.thread(th).frames.len() <= 1 {
            return Err(RtError::Runtime("no frame to pop".to_string()));
        }
        let frame = *self.thread(th).current_frame();
        self.close_upvals_from(th, frame.base());
        let state = self.thread_mut(th);
        state.frames.pop();
        state.top = frame.func;
        Ok(())
    }

    /// Save the program counter of the current scripted frame.
    pub fn save_pc(&mut self, th: ThreadId, pc: usize) {
        if let Some(CallInfo {
            kind: FrameKind::Scripted { saved_pc, .. },
            ..
        }) = self.thread_mut(th).frames.last_mut()
        {
            *saved_pc = pc;
        }
    }

    // ---- Upvalues ----

    /// The open upvalue aliasing `slot` on `th`, creating and linking one
    /// if none exists yet.
    pub fn find_or_open_upval(
        &mut self,
        th: ThreadId,
        slot: usize,
    ) -> Result<GcIdx<Upvalue>, RtError> {
        for ou in &self.global.open_upvals {
            if ou.thread == th && ou.slot == slot {
                return Ok(ou.upval);
            }
        }
        let upval = self
            .global
            .heap
            .alloc_upvalue(UpvalLink::Open { thread: th, slot })?;
        self.global.open_upvals.push(OpenUpval { thread: th, slot, upval });
        self.global
            .open_upvals
            .sort_by(|a, b| (b.thread.0, b.slot).cmp(&(a.thread.0, a.slot)));
        Ok(upval)
    }

    /// Close every open upvalue of `th` whose slot is at or above `level`.
    pub fn close_upvals_from(&mut self, th: ThreadId, level: usize) {
        let stack = &self.threads[th.0 as usize].stack;
        let GlobalState {
            heap, open_upvals, ..
        } = &mut self.global;
        open_upvals.retain(|ou| {
            if ou.thread == th && ou.slot >= level {
                heap.upvalue_mut(ou.upval).close(stack[ou.slot]);
                false
            } else {
                true
            }
        });
    }

    /// Close one upvalue: copy the aliased value into the cell, repoint the
    /// indirection, and unlink it. A second close is a no-op.
    pub fn close_upvalue(&mut self, uv: GcIdx<Upvalue>) {
        if let UpvalLink::Open { thread, slot } = self.global.heap.upvalue(uv).link {
            let v = self.threads[thread.0 as usize].stack[slot];
            self.global.heap.upvalue_mut(uv).close(v);
            self.global.open_upvals.retain(|ou| ou.upval != uv);
        }
    }

    /// Read through an upvalue's indirection.
    pub fn upval_value(&self, uv: GcIdx<Upvalue>) -> Value {
        match self.global.heap.upvalue(uv).link {
            UpvalLink::Open { thread, slot } => self.threads[thread.0 as usize].stack[slot],
            UpvalLink::Closed(v) => v,
        }
    }

    /// Write through an upvalue's indirection.
    pub fn set_upval_value(&mut self, uv: GcIdx<Upvalue>, v: Value) {
        match self.global.heap.upvalue(uv).link {
            UpvalLink::Open { thread, slot } => {
                self.threads[thread.0 as usize].stack[slot] = v;
            }
            UpvalLink::Closed(_) => {
                self.global.heap.upvalue_mut(uv).link = UpvalLink::Closed(v);
            }
        }
    }

    /// Open upvalues currently tracked for `th`.
    pub fn open_upval_count(&self, th: ThreadId) -> usize {
        self.global
            .open_upvals
            .iter()
            .filter(|ou| ou.thread == th)
            .count()
    }

    // ---- Probe re-entrancy guard ----

    /// Mark `th` as running a probe handler. Re-entry from the same probe
    /// context is a hard error, not a retry point: tracing callbacks must
    /// never recursively trigger themselves.
    pub fn begin_trace(&mut self, th: ThreadId) -> Result<(), RtError> {
        let state = self.thread_mut(th);
        if state.tracing {
            return Err(RtError::ReentrantTrace);
        }
        state.tracing = true;
        Ok(())
    }

    pub fn end_trace(&mut self, th: ThreadId) {
        self.thread_mut(th).tracing = false;
    }

    // ---- Error escalation ----

    /// The single runtime-error path: format, emit through the diagnostic
    /// sink, mark the state dead, and hand the error back to the caller.
    pub fn run_error(&mut self, th: ThreadId, msg: impl Into<String>) -> RtError {
        let msg = msg.into();
        self.global.diag.emit(&msg);
        self.thread_mut(th).status = ThreadStatus::Dead;
        RtError::Runtime(msg)
    }
}

/// Seed for string hashing, mixed from the clock and an address so a fresh
/// runtime is not trivially predictable to a hostile script.
fn make_seed() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ d.as_secs() as u32)
        .unwrap_or(0x2545_f491);
    let local = 0u32;
    let addr = &local as *const u32 as usize as u32;
    t ^ addr.rotate_left(16)
}
