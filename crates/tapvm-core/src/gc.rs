//! GC heap: per-kind arenas with typed indices, the all-objects list, and
//! the non-blocking allocation gauge.
//!
//! Objects live in arenas and are addressed by stable `GcIdx<T>` indices;
//! the collector-facing "intrusive list" is an index chain threaded through
//! each object's [`GcHeader`], rooted at [`Heap::allgc`]. The heap only
//! promises to keep that list correct and to fail allocation fast when the
//! byte gauge is exhausted; the mark/sweep algorithm itself is external and
//! drives itself off [`GcFlags`].

use crate::closure::{NativeClosure, NativeFn, ScriptedClosure, Upvalue, UpvalLink, Userdata};
use crate::error::RtError;
use crate::object::GcKind;
use crate::proto::Proto;
use crate::table::Table;
use crate::value::Value;
use std::marker::PhantomData;

/// A typed index into one of the heap arenas.
pub struct GcIdx<T>(u32, PhantomData<T>);

impl<T> std::fmt::Debug for GcIdx<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcIdx({})", self.0)
    }
}

impl<T> GcIdx<T> {
    #[inline]
    pub fn new(index: u32) -> Self {
        GcIdx(index, PhantomData)
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Untyped reference to any object on the all-objects list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GcRef {
    pub kind: GcKind,
    pub index: u32,
}

/// Header shared by every collectable object: the all-objects forward link
/// and the collector's mark bit. The kind tag is carried by the arena (and
/// by [`GcRef`]), so it is not duplicated here.
#[derive(Clone, Copy, Debug)]
pub struct GcHeader {
    pub next: Option<GcRef>,
    pub marked: bool,
}

impl GcHeader {
    fn unmarked() -> Self {
        GcHeader {
            next: None,
            marked: false,
        }
    }
}

/// An arena slot: header plus the object payload.
#[derive(Debug)]
pub struct GcBox<T> {
    pub header: GcHeader,
    pub obj: T,
}

/// Collector state, read and written by the external collector.
#[derive(Clone, Copy, Debug, Default)]
pub struct GcFlags {
    pub gcstate: u8,
    pub gckind: u8,
    pub gcrunning: bool,
}

/// Arena-based heap with byte-gauge accounting.
pub struct Heap {
    pub flags: GcFlags,
    /// Head of the all-objects list; newest allocation first.
    pub allgc: Option<GcRef>,
    used: usize,
    limit: usize,
    tables: Vec<Option<GcBox<Table>>>,
    tables_free: Vec<u32>,
    protos: Vec<Option<GcBox<Proto>>>,
    protos_free: Vec<u32>,
    scripted: Vec<Option<GcBox<ScriptedClosure>>>,
    scripted_free: Vec<u32>,
    natives: Vec<Option<GcBox<NativeClosure>>>,
    natives_free: Vec<u32>,
    upvals: Vec<Option<GcBox<Upvalue>>>,
    upvals_free: Vec<u32>,
    udata: Vec<Option<GcBox<Userdata>>>,
    udata_free: Vec<u32>,
}

fn insert_slot<T>(arena: &mut Vec<Option<GcBox<T>>>, free: &mut Vec<u32>, boxed: GcBox<T>) -> u32 {
    if let Some(idx) = free.pop() {
        arena[idx as usize] = Some(boxed);
        idx
    } else {
        let idx = arena.len() as u32;
        arena.push(Some(boxed));
        idx
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap::with_limit(usize::MAX)
    }

    /// A heap that fails allocation once `limit` bytes are accounted.
    pub fn with_limit(limit: usize) -> Self {
        Heap {
            flags: GcFlags::default(),
            allgc: None,
            used: 0,
            limit,
            tables: Vec::new(),
            tables_free: Vec::new(),
            protos: Vec::new(),
            protos_free: Vec::new(),
            scripted: Vec::new(),
            scripted_free: Vec::new(),
            natives: Vec::new(),
            natives_free: Vec::new(),
            upvals: Vec::new(),
            upvals_free: Vec::new(),
            udata: Vec::new(),
            udata_free: Vec::new(),
        }
    }

    /// Bytes currently accounted against the gauge.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    /// The non-blocking allocation check: debit `bytes` or fail immediately
    /// with `OutOfMemory`. Never blocks, never retries.
    pub fn reserve(&mut self, bytes: usize) -> Result<(), RtError> {
        let needed = self.used.checked_add(bytes).ok_or(RtError::OutOfMemory)?;
        if needed > self.limit {
            return Err(RtError::OutOfMemory);
        }
        self.used = needed;
        Ok(())
    }

    /// Credit bytes back on free; used by the external sweep.
    pub fn release(&mut self, bytes: usize) {
        self.used = self.used.saturating_sub(bytes);
    }

    fn link(&mut self, kind: GcKind, index: u32) -> GcHeader {
        let header = GcHeader {
            next: self.allgc,
            marked: false,
        };
        self.allgc = Some(GcRef { kind, index });
        header
    }

    // ---- Tables ----

    pub fn alloc_table(&mut self) -> Result<GcIdx<Table>, RtError> {
        self.reserve(std::mem::size_of::<GcBox<Table>>())?;
        let idx = insert_slot(
            &mut self.tables,
            &mut self.tables_free,
            GcBox {
                header: GcHeader::unmarked(),
                obj: Table::new(),
            },
        );
        let header = self.link(GcKind::Table, idx);
        self.tables[idx as usize].as_mut().unwrap().header = header;
        Ok(GcIdx::new(idx))
    }

    pub fn table(&self, idx: GcIdx<Table>) -> &Table {
        &self.tables[idx.0 as usize]
            .as_ref()
            .expect("table was freed")
            .obj
    }

    pub fn table_mut(&mut self, idx: GcIdx<Table>) -> &mut Table {
        &mut self.tables[idx.0 as usize]
            .as_mut()
            .expect("table was freed")
            .obj
    }

    // ---- Prototypes ----

    pub fn alloc_proto(&mut self) -> Result<GcIdx<Proto>, RtError> {
        self.reserve(std::mem::size_of::<GcBox<Proto>>())?;
        let idx = insert_slot(
            &mut self.protos,
            &mut self.protos_free,
            GcBox {
                header: GcHeader::unmarked(),
                obj: Proto::new(),
            },
        );
        let header = self.link(GcKind::Proto, idx);
        self.protos[idx as usize].as_mut().unwrap().header = header;
        Ok(GcIdx::new(idx))
    }

    pub fn proto(&self, idx: GcIdx<Proto>) -> &Proto {
        &self.protos[idx.0 as usize]
            .as_ref()
            .expect("proto was freed")
            .obj
    }

    pub fn proto_mut(&mut self, idx: GcIdx<Proto>) -> &mut Proto {
        &mut self.protos[idx.0 as usize]
            .as_mut()
            .expect("proto was freed")
            .obj
    }

    // ---- Closures ----

    /// Allocate a scripted closure with room for `nupvals` upvalue handles,
    /// and remember it as the prototype's most recent closure.
    pub fn alloc_scripted_closure(
        &mut self,
        proto: GcIdx<Proto>,
        nupvals: usize,
    ) -> Result<GcIdx<ScriptedClosure>, RtError> {
        self.reserve(
            std::mem::size_of::<GcBox<ScriptedClosure>>()
                + nupvals * std::mem::size_of::<GcIdx<Upvalue>>(),
        )?;
        let idx = insert_slot(
            &mut self.scripted,
            &mut self.scripted_free,
            GcBox {
                header: GcHeader::unmarked(),
                obj: ScriptedClosure {
                    proto,
                    upvals: vec![None; nupvals],
                },
            },
        );
        let header = self.link(GcKind::ScriptedClosure, idx);
        self.scripted[idx as usize].as_mut().unwrap().header = header;
        let clo = GcIdx::new(idx);
        self.proto_mut(proto).cache = Some(clo);
        Ok(clo)
    }

    /// The prototype's cached closure, reusable only when it captures
    /// nothing (no upvalue descriptors means no captures can vary).
    pub fn closure_from_cache(&self, proto: GcIdx<Proto>) -> Option<GcIdx<ScriptedClosure>> {
        let p = self.proto(proto);
        if p.upvalues.is_empty() {
            p.cache
        } else {
            None
        }
    }

    pub fn scripted(&self, idx: GcIdx<ScriptedClosure>) -> &ScriptedClosure {
        &self.scripted[idx.0 as usize]
            .as_ref()
            .expect("closure was freed")
            .obj
    }

    pub fn scripted_mut(&mut self, idx: GcIdx<ScriptedClosure>) -> &mut ScriptedClosure {
        &mut self.scripted[idx.0 as usize]
            .as_mut()
            .expect("closure was freed")
            .obj
    }

    /// Allocate a native closure with its captured values stored inline.
    pub fn alloc_native_closure(
        &mut self,
        func: NativeFn,
        captured: Vec<Value>,
    ) -> Result<GcIdx<NativeClosure>, RtError> {
        self.reserve(
            std::mem::size_of::<GcBox<NativeClosure>>()
                + captured.len() * std::mem::size_of::<Value>(),
        )?;
        let idx = insert_slot(
            &mut self.natives,
            &mut self.natives_free,
            GcBox {
                header: GcHeader::unmarked(),
                obj: NativeClosure {
                    func,
                    upvalues: captured,
                },
            },
        );
        let header = self.link(GcKind::NativeClosure, idx);
        self.natives[idx as usize].as_mut().unwrap().header = header;
        Ok(GcIdx::new(idx))
    }

    pub fn native(&self, idx: GcIdx<NativeClosure>) -> &NativeClosure {
        &self.natives[idx.0 as usize]
            .as_ref()
            .expect("native closure was freed")
            .obj
    }

    // ---- Upvalues ----

    pub fn alloc_upvalue(&mut self, link: UpvalLink) -> Result<GcIdx<Upvalue>, RtError> {
        self.reserve(std::mem::size_of::<GcBox<Upvalue>>())?;
        let idx = insert_slot(
            &mut self.upvals,
            &mut self.upvals_free,
            GcBox {
                header: GcHeader::unmarked(),
                obj: Upvalue { link },
            },
        );
        let header = self.link(GcKind::Upvalue, idx);
        self.upvals[idx as usize].as_mut().unwrap().header = header;
        Ok(GcIdx::new(idx))
    }

    pub fn upvalue(&self, idx: GcIdx<Upvalue>) -> &Upvalue {
        &self.upvals[idx.0 as usize]
            .as_ref()
            .expect("upvalue was freed")
            .obj
    }

    pub fn upvalue_mut(&mut self, idx: GcIdx<Upvalue>) -> &mut Upvalue {
        &mut self.upvals[idx.0 as usize]
            .as_mut()
            .expect("upvalue was freed")
            .obj
    }

    // ---- Userdata ----

    pub fn alloc_userdata(&mut self, size: usize) -> Result<GcIdx<Userdata>, RtError> {
        self.reserve(std::mem::size_of::<GcBox<Userdata>>() + size)?;
        let idx = insert_slot(
            &mut self.udata,
            &mut self.udata_free,
            GcBox {
                header: GcHeader::unmarked(),
                obj: Userdata {
                    data: vec![0; size],
                    metatable: None,
                },
            },
        );
        let header = self.link(GcKind::Userdata, idx);
        self.udata[idx as usize].as_mut().unwrap().header = header;
        Ok(GcIdx::new(idx))
    }

    pub fn userdata(&self, idx: GcIdx<Userdata>) -> &Userdata {
        &self.udata[idx.0 as usize]
            .as_ref()
            .expect("userdata was freed")
            .obj
    }

    pub fn userdata_mut(&mut self, idx: GcIdx<Userdata>) -> &mut Userdata {
        &mut self.udata[idx.0 as usize]
            .as_mut()
            .expect("userdata was freed")
            .obj
    }

    /// The header of any object on the all-objects list, for the external
    /// collector's walk.
    pub fn header(&self, r: GcRef) -> Option<&GcHeader> {
        let i = r.index as usize;
        match r.kind {
            GcKind::Table => self.tables.get(i)?.as_ref().map(|b| &b.header),
            GcKind::Proto => self.protos.get(i)?.as_ref().map(|b| &b.header),
            GcKind::ScriptedClosure => self.scripted.get(i)?.as_ref().map(|b| &b.header),
            GcKind::NativeClosure => self.natives.get(i)?.as_ref().map(|b| &b.header),
            GcKind::Upvalue => self.upvals.get(i)?.as_ref().map(|b| &b.header),
            GcKind::Userdata => self.udata.get(i)?.as_ref().map(|b| &b.header),
            // Strings are swept via the string table, threads via the runtime.
            GcKind::ShortStr | GcKind::LongStr | GcKind::Thread => None,
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
