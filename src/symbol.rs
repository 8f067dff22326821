//! Process-global symbol identifiers and the common symbol header.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Identifier of one parsed debug-information file, unique for the whole process.
pub type FileId = u32;

const FILE_ID_SHIFT: u32 = 48;
const OFFSET_MASK: u64 = (1 << FILE_ID_SHIFT) - 1;

static NEXT_FILE_ID: AtomicU32 = AtomicU32::new(0);

/// Allocate the next file id. File id 0 is reserved for "no file".
pub fn next_file_id() -> FileId {
    NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Process-global symbol identifier.
///
/// Packs a file id (top 16 bits) and a file-local DIE offset (low 48 bits)
/// into one opaque value. Offsets of real `.debug_info` sections fit 48 bits
/// with a lot of room to spare. `SymbolId::NONE` (all zeroes) means "no symbol".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SymbolId(u64);

impl SymbolId {
    pub const NONE: SymbolId = SymbolId(0);

    /// Combine a file id and a file-global DIE offset into a symbol id.
    #[inline]
    pub fn combine(file_id: FileId, die_offset: u64) -> Self {
        debug_assert!(die_offset <= OFFSET_MASK, "die offset exceeds 48 bits");
        SymbolId(((file_id as u64) << FILE_ID_SHIFT) | (die_offset & OFFSET_MASK))
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn file_id(&self) -> FileId {
        (self.0 >> FILE_ID_SHIFT) as FileId
    }

    #[inline]
    pub fn die_offset(&self) -> u64 {
        self.0 & OFFSET_MASK
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.file_id(), self.die_offset())
    }
}

impl fmt::Debug for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolId({self})")
    }
}

/// Header shared by every entity in the graph: primary id, name and the set
/// of alternative ids under which other translation units know this symbol.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub id: SymbolId,
    pub name: String,
    alternative_ids: HashSet<SymbolId>,
}

impl Symbol {
    pub fn new(id: SymbolId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            alternative_ids: HashSet::new(),
        }
    }

    /// Record an id of another DIE that resolved to this symbol.
    /// The primary id is never stored as an alternative.
    pub fn add_alternative_id(&mut self, id: SymbolId) {
        if id != self.id {
            self.alternative_ids.insert(id);
        }
    }

    pub fn alternative_ids(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.alternative_ids.iter().copied()
    }

    pub fn has_alternative_id(&self, id: SymbolId) -> bool {
        self.alternative_ids.contains(&id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_combine_none() {
        assert_eq!(SymbolId::combine(0, 0), SymbolId::NONE);
        assert!(SymbolId::combine(0, 0).is_none());
        assert!(!SymbolId::combine(1, 0).is_none());
    }

    #[test]
    fn test_combine_roundtrip() {
        let id = SymbolId::combine(7, 0x1234_5678);
        assert_eq!(id.file_id(), 7);
        assert_eq!(id.die_offset(), 0x1234_5678);
    }

    #[test]
    fn test_combine_injective() {
        let a = SymbolId::combine(1, 0x40);
        let b = SymbolId::combine(2, 0x40);
        let c = SymbolId::combine(1, 0x80);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn test_file_ids_are_unique() {
        let f1 = next_file_id();
        let f2 = next_file_id();
        assert_ne!(f1, 0);
        assert!(f2 > f1);
    }

    #[test]
    fn test_no_primary_in_alternatives() {
        let mut sym = Symbol::new(SymbolId::combine(1, 0x40), "foo");
        sym.add_alternative_id(SymbolId::combine(1, 0x40));
        assert_eq!(sym.alternative_ids().count(), 0);
        sym.add_alternative_id(SymbolId::combine(2, 0x80));
        assert!(sym.has_alternative_id(SymbolId::combine(2, 0x80)));
        assert_eq!(sym.alternative_ids().count(), 1);
    }
}
