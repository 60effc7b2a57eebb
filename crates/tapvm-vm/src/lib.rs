//! tapvm execution layer: call frames, execution states, global state.

pub mod callinfo;
pub mod state;

pub use state::{
    DiagSink, GlobalState, Runtime, SharedRuntime, State, StdoutSink, ThreadStatus, MAIN_THREAD,
    RIDX_GLOBALS, RIDX_MAINTHREAD,
};
