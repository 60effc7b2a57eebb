/// Script strings: interned short strings and standalone long strings.
///
/// Short strings (<= 40 bytes) are stored inline and interned through a
/// bucket-chained hash table, so at most one live instance of a given byte
/// sequence exists and equality is handle identity. Long strings bypass the
/// table entirely; their hash is computed on first demand and cached once,
/// and equality is length-then-byte comparison.
///
/// Hashing is seeded from global state, so an adversarial script cannot
/// pre-compute a colliding key set.
use crate::error::RtError;
use crate::gc::Heap;
use crate::value::Value;
use std::fmt;

/// Maximum bytes for an inline, interned (short) string.
pub const SHORT_STR_MAX: usize = 40;

/// Initial bucket count; always a power of two.
const MIN_TABLE_SIZE: usize = 32;

/// Bucket-count ceiling; interning fails rather than grow past this.
const MAX_TABLE_SIZE: usize = 1 << 26;

/// An opaque handle to a string owned by the string table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StringId(pub u32);

#[derive(Clone)]
enum StrData {
    Short { buf: [u8; SHORT_STR_MAX], len: u8 },
    Long(Vec<u8>),
}

/// A string record: bytes, cached length and hash, and the intrusive chain
/// link (bucket chain for shorts, the all-longs chain for longs).
pub struct TString {
    data: StrData,
    hash: u32,
    /// For long strings: nonzero once `hash` has been computed. Reserved
    /// for keyword indices on short strings.
    extra: u8,
    hnext: Option<StringId>,
    pub marked: bool,
}

impl TString {
    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            StrData::Short { buf, len } => &buf[..*len as usize],
            StrData::Long(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        match &self.data {
            StrData::Short { len, .. } => *len as usize,
            StrData::Long(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_short(&self) -> bool {
        matches!(&self.data, StrData::Short { .. })
    }

    /// Whether the lazy hash of a long string has been computed yet.
    pub fn has_hash(&self) -> bool {
        self.is_short() || self.extra != 0
    }
}

impl fmt::Debug for TString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = std::str::from_utf8(self.as_bytes()) {
            write!(f, "\"{s}\"")
        } else {
            write!(f, "<binary string len={}>", self.len())
        }
    }
}

/// Seeded string hash. Long inputs are sampled (at most 32 bytes feed the
/// hash), keeping the cost bounded for megabyte payloads.
pub fn str_hash(bytes: &[u8], seed: u32) -> u32 {
    let mut h = seed ^ bytes.len() as u32;
    let step = (bytes.len() >> 5) + 1;
    let mut i = bytes.len();
    while i >= step {
        h ^= (h << 5)
            .wrapping_add(h >> 2)
            .wrapping_add(bytes[i - 1] as u32);
        i -= step;
    }
    h
}

/// Owns every string and deduplicates the short ones.
pub struct StringTable {
    strings: Vec<Option<TString>>,
    free: Vec<u32>,
    /// Bucket heads for interned short strings; chains run through
    /// `TString::hnext`.
    buckets: Vec<Option<StringId>>,
    /// Number of interned short strings.
    nuse: usize,
    /// Head of the chain of all long strings.
    longs: Option<StringId>,
    seed: u32,
}

impl StringTable {
    pub fn new(seed: u32) -> Self {
        StringTable {
            strings: Vec::new(),
            free: Vec::new(),
            buckets: vec![None; MIN_TABLE_SIZE],
            nuse: 0,
            longs: None,
            seed,
        }
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Number of interned short strings.
    pub fn nuse(&self) -> usize {
        self.nuse
    }

    /// Current bucket count; always a power of two.
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Intern `bytes`. Short inputs are deduplicated: a second call with
    /// equal bytes returns the same handle. Long inputs always allocate a
    /// fresh record.
    pub fn intern(&mut self, heap: &mut Heap, bytes: &[u8]) -> Result<StringId, RtError> {
        if bytes.len() > SHORT_STR_MAX {
            return self.new_long(heap, bytes);
        }
        let h = str_hash(bytes, self.seed);
        let mut cur = self.buckets[h as usize & (self.buckets.len() - 1)];
        while let Some(id) = cur {
            let ts = self.get(id);
            if ts.as_bytes() == bytes {
                return Ok(id);
            }
            cur = ts.hnext;
        }
        // Not found: grow first if the table is at its load threshold, then
        // insert at the bucket head.
        if self.nuse >= self.buckets.len() {
            if self.buckets.len() > MAX_TABLE_SIZE / 2 {
                return Err(RtError::OutOfMemory);
            }
            self.resize(self.buckets.len() * 2);
        }
        heap.reserve(std::mem::size_of::<TString>())?;
        let b = h as usize & (self.buckets.len() - 1);
        let mut buf = [0u8; SHORT_STR_MAX];
        buf[..bytes.len()].copy_from_slice(bytes);
        let id = self.insert_slot(TString {
            data: StrData::Short {
                buf,
                len: bytes.len() as u8,
            },
            hash: h,
            extra: 0,
            hnext: self.buckets[b],
            marked: false,
        });
        self.buckets[b] = Some(id);
        self.nuse += 1;
        Ok(id)
    }

    /// Intern and wrap in the correctly-tagged value variant.
    pub fn intern_value(&mut self, heap: &mut Heap, bytes: &[u8]) -> Result<Value, RtError> {
        let id = self.intern(heap, bytes)?;
        Ok(if self.get(id).is_short() {
            Value::ShortStr(id)
        } else {
            Value::LongStr(id)
        })
    }

    fn new_long(&mut self, heap: &mut Heap, bytes: &[u8]) -> Result<StringId, RtError> {
        heap.reserve(std::mem::size_of::<TString>() + bytes.len())?;
        let id = self.insert_slot(TString {
            data: StrData::Long(bytes.to_vec()),
            hash: 0,
            extra: 0,
            hnext: self.longs,
            marked: false,
        });
        self.longs = Some(id);
        Ok(id)
    }

    fn insert_slot(&mut self, ts: TString) -> StringId {
        if let Some(idx) = self.free.pop() {
            self.strings[idx as usize] = Some(ts);
            StringId(idx)
        } else {
            let idx = self.strings.len() as u32;
            self.strings.push(Some(ts));
            StringId(idx)
        }
    }

    /// Rebuild the bucket array at `new_size` (a power of two), re-chaining
    /// every interned string under the new mask. Chain order within a bucket
    /// is not preserved; nothing depends on it.
    pub fn resize(&mut self, new_size: usize) {
        debug_assert!(new_size.is_power_of_two());
        let old = std::mem::replace(&mut self.buckets, vec![None; new_size]);
        for head in old {
            let mut cur = head;
            while let Some(id) = cur {
                let ts = self.get(id);
                let next = ts.hnext;
                let b = ts.hash as usize & (new_size - 1);
                let head = self.buckets[b];
                self.get_mut(id).hnext = head;
                self.buckets[b] = Some(id);
                cur = next;
            }
        }
    }

    pub fn get(&self, id: StringId) -> &TString {
        self.strings[id.0 as usize]
            .as_ref()
            .expect("string was freed")
    }

    fn get_mut(&mut self, id: StringId) -> &mut TString {
        self.strings[id.0 as usize]
            .as_mut()
            .expect("string was freed")
    }

    pub fn bytes(&self, id: StringId) -> &[u8] {
        self.get(id).as_bytes()
    }

    /// The hash of any string. For a long string whose hash has not been
    /// cached yet this computes it on the fly without caching (this method
    /// stays pure for read paths); use [`Self::long_hash`] on write paths.
    pub fn hash_of(&self, id: StringId) -> u32 {
        let ts = self.get(id);
        if ts.has_hash() {
            ts.hash
        } else {
            str_hash(ts.as_bytes(), self.seed)
        }
    }

    /// The hash of a string, computing and caching a long string's hash on
    /// first use. The cached transition happens at most once.
    pub fn long_hash(&mut self, id: StringId) -> u32 {
        if self.get(id).has_hash() {
            return self.get(id).hash;
        }
        let h = str_hash(self.get(id).as_bytes(), self.seed);
        let ts = self.get_mut(id);
        ts.hash = h;
        ts.extra = 1;
        h
    }

    /// Long-string equality: length, then bytes. (Short strings never take
    /// this path; their equality is handle identity.)
    pub fn eq_long(&self, a: StringId, b: StringId) -> bool {
        if a == b {
            return true;
        }
        let (ta, tb) = (self.get(a), self.get(b));
        ta.len() == tb.len() && ta.as_bytes() == tb.as_bytes()
    }
}

impl fmt::Debug for StringTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StringTable(nuse={}, size={})",
            self.nuse,
            self.buckets.len()
        )
    }
}
