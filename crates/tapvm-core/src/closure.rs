//! Closures, upvalue cells, and the native-function calling surface.

use crate::error::RtError;
use crate::gc::{GcIdx, Heap};
use crate::proto::Proto;
use crate::string::StringTable;
use crate::table::Table;
use crate::value::{ThreadId, Value};

/// Context handed to native functions: arguments plus the shared structures
/// a builtin may touch.
pub struct NativeCtx<'a> {
    pub args: &'a [Value],
    pub heap: &'a mut Heap,
    pub strings: &'a mut StringTable,
}

/// A native function callable from scripts.
pub type NativeFn = fn(&mut NativeCtx) -> Result<Vec<Value>, RtError>;

/// A closure over script code: a prototype plus its captured upvalues.
/// Slots are reserved at allocation and filled as captures are resolved.
#[derive(Debug)]
pub struct ScriptedClosure {
    pub proto: GcIdx<Proto>,
    pub upvals: Vec<Option<GcIdx<Upvalue>>>,
}

impl ScriptedClosure {
    pub fn nupvalues(&self) -> usize {
        self.upvals.len()
    }
}

/// A native function bundled with captured values stored inline.
pub struct NativeClosure {
    pub func: NativeFn,
    pub upvalues: Vec<Value>,
}

/// Opaque host data with an optional metatable.
#[derive(Debug)]
pub struct Userdata {
    pub data: Vec<u8>,
    pub metatable: Option<GcIdx<Table>>,
}

/// Where an upvalue's value lives.
#[derive(Clone, Copy, Debug)]
pub enum UpvalLink {
    /// Aliases a live stack slot of a still-executing frame, resolved
    /// through the owning execution state at access time.
    Open { thread: ThreadId, slot: usize },
    /// Owns a copy; the originating frame has returned.
    Closed(Value),
}

/// A shared mutable cell for a captured variable.
///
/// The open→closed transition is one-way and happens at most once; closing
/// an already-closed upvalue is a no-op.
#[derive(Debug)]
pub struct Upvalue {
    pub link: UpvalLink,
}

impl Upvalue {
    pub fn is_open(&self) -> bool {
        matches!(self.link, UpvalLink::Open { .. })
    }

    /// Close with the given captured value. Idempotent: a second close
    /// leaves the first captured value untouched.
    pub fn close(&mut self, value: Value) {
        if self.is_open() {
            self.link = UpvalLink::Closed(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_closure_reserves_upvalue_room() {
        let mut heap = Heap::new();
        let proto = heap.alloc_proto().unwrap();
        let c = heap.alloc_scripted_closure(proto, 3).unwrap();
        let clo = heap.scripted(c);
        assert_eq!(clo.nupvalues(), 3);
        assert!(clo.upvals.iter().all(|u| u.is_none()));
    }

    #[test]
    fn test_native_closure_holds_captures() {
        fn nop(_: &mut NativeCtx) -> Result<Vec<Value>, RtError> {
            Ok(Vec::new())
        }
        let mut heap = Heap::new();
        let c = heap
            .alloc_native_closure(nop, vec![Value::Number(1), Value::Boolean(true)])
            .unwrap();
        let clo = heap.native(c);
        assert_eq!(clo.upvalues.len(), 2);
        assert_eq!(clo.upvalues[0].as_number(), Some(1));
    }

    #[test]
    fn test_upvalue_close_idempotent() {
        let mut uv = Upvalue {
            link: UpvalLink::Open {
                thread: ThreadId(0),
                slot: 4,
            },
        };
        assert!(uv.is_open());
        uv.close(Value::Number(7));
        assert!(matches!(uv.link, UpvalLink::Closed(Value::Number(7))));
        uv.close(Value::Number(99));
        assert!(matches!(uv.link, UpvalLink::Closed(Value::Number(7))));
    }
}
