//! Owner of the symbol graph: id and name indices over all parsed entities.

use crate::error::Error;
use crate::r#type::{Entity, EntityKind, RefModifier, SymbolRef};
use crate::symbol::{FileId, SymbolId};
use log::warn;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct ManagerInner {
    /// Entities by primary id.
    symbols: HashMap<SymbolId, SymbolRef>,
    /// Any id, primary or alternative, to the primary id.
    id_index: HashMap<SymbolId, SymbolId>,
    /// Name indices per kind family. The first registration of a name wins,
    /// later ones become alternative ids of it.
    types: HashMap<String, SymbolId>,
    ref_types: HashMap<String, SymbolId>,
    functions: HashMap<String, SymbolId>,
    variables: HashMap<String, SymbolId>,
    types_updated: bool,
}

/// Owns every entity of the graph and answers id- and name-based lookups.
///
/// Inserts are serialized behind one lock so that several files can be
/// parsed in parallel. Queries are expected after the bulk parse and after
/// [`SymbolManager::update_types`]; earlier queries may observe ids that do
/// not resolve yet.
#[derive(Default)]
pub struct SymbolManager {
    inner: RwLock<ManagerInner>,
}

impl SymbolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pure translation of a file-global DIE offset into a symbol id.
    #[inline]
    pub fn get_id(&self, die_offset: u64, file_id: FileId) -> SymbolId {
        SymbolId::combine(file_id, die_offset)
    }

    /// Take ownership of an entity and index it by id and name.
    /// Arrays and anonymous entities are reachable by id only.
    pub fn register(&self, entity: Entity) -> SymbolRef {
        let id = entity.id();
        let kind = entity.kind();
        let name = entity.name().to_string();
        let sref: SymbolRef = Arc::new(RwLock::new(entity));

        let mut inner = self.inner.write().expect("unexpected: lock poisoned");
        inner.id_index.insert(id, id);
        if !name.is_empty() {
            match kind {
                EntityKind::Function => {
                    inner.functions.entry(name).or_insert(id);
                }
                EntityKind::Variable => {
                    inner.variables.entry(name).or_insert(id);
                }
                // arrays are never merged, keep them out of the name index
                EntityKind::Array => {}
                EntityKind::Typedef | EntityKind::ConstType | EntityKind::Pointer => {
                    inner.ref_types.entry(name.clone()).or_insert(id);
                    inner.types.entry(name).or_insert(id);
                }
                _ => {
                    inner.types.entry(name).or_insert(id);
                }
            }
        }
        inner.symbols.insert(id, sref.clone());
        sref
    }

    /// Record that another DIE resolved to an already known entity.
    pub fn add_alternative_id(&self, entity: &SymbolRef, alt: SymbolId) {
        let primary = entity.read().expect("unexpected: lock poisoned").id();
        self.inner
            .write()
            .expect("unexpected: lock poisoned")
            .id_index
            .insert(alt, primary);
        entity
            .write()
            .expect("unexpected: lock poisoned")
            .symbol_mut()
            .add_alternative_id(alt);
    }

    /// Entity lookup through any of its ids.
    pub fn find_by_id(&self, id: SymbolId) -> Option<SymbolRef> {
        if id.is_none() {
            return None;
        }
        let inner = self.inner.read().expect("unexpected: lock poisoned");
        let primary = inner.id_index.get(&id)?;
        inner.symbols.get(primary).cloned()
    }

    fn find_named(
        &self,
        pick: impl FnOnce(&ManagerInner) -> Option<SymbolId>,
    ) -> Option<SymbolRef> {
        let inner = self.inner.read().expect("unexpected: lock poisoned");
        let id = pick(&inner)?;
        inner.symbols.get(&id).cloned()
    }

    /// Any type-kind entity with this name.
    pub fn find_base_type_by_name(&self, name: &str) -> Option<SymbolRef> {
        self.find_named(|inner| inner.types.get(name).copied())
    }

    /// A reference-qualifier type (typedef, const, pointer) with this name.
    pub fn find_ref_base_type_by_name(&self, name: &str) -> Option<SymbolRef> {
        self.find_named(|inner| inner.ref_types.get(name).copied())
    }

    pub fn find_variable_by_name(&self, name: &str) -> Option<SymbolRef> {
        self.find_named(|inner| inner.variables.get(name).copied())
    }

    pub fn find_function_by_name(&self, name: &str) -> Option<SymbolRef> {
        self.find_named(|inner| inner.functions.get(name).copied())
    }

    /// Name lookup constrained to one entity kind. A name registered under a
    /// different kind yields `None`.
    pub fn find_type_of_kind(&self, name: &str, kind: EntityKind) -> Option<SymbolRef> {
        let sref = match kind {
            EntityKind::Function => self.find_function_by_name(name),
            EntityKind::Variable => self.find_variable_by_name(name),
            EntityKind::Typedef | EntityKind::ConstType | EntityKind::Pointer => {
                self.find_ref_base_type_by_name(name)
            }
            _ => self.find_base_type_by_name(name),
        }?;
        let matches = sref.read().expect("unexpected: lock poisoned").kind() == kind;
        matches.then_some(sref)
    }

    /// All named types whose name matches the pattern.
    pub fn find_base_types_by_regex(&self, regex: &Regex) -> Vec<SymbolRef> {
        let inner = self.inner.read().expect("unexpected: lock poisoned");
        inner
            .types
            .iter()
            .filter(|(name, _)| regex.find(name).is_some())
            .filter_map(|(_, id)| inner.symbols.get(id).cloned())
            .collect()
    }

    pub fn symbol_count(&self) -> usize {
        self.inner
            .read()
            .expect("unexpected: lock poisoned")
            .symbols
            .len()
    }

    /// All entities, ordered by primary id.
    pub fn symbols(&self) -> Vec<SymbolRef> {
        let inner = self.inner.read().expect("unexpected: lock poisoned");
        let mut all: Vec<_> = inner
            .symbols
            .iter()
            .map(|(id, sref)| (*id, sref.clone()))
            .collect();
        all.sort_unstable_by_key(|(id, _)| *id);
        all.into_iter().map(|(_, sref)| sref).collect()
    }

    /// Terminal pass after all files are parsed: collapse every stored
    /// reference id onto the primary id of its referent.
    ///
    /// Ids without a known referent stay in place and are reported back;
    /// lookups through them keep returning `None`. Parsing into this manager
    /// after the rewrite is undefined.
    pub fn update_types(&self) -> Vec<Error> {
        let mut inner = self.inner.write().expect("unexpected: lock poisoned");
        if mem::replace(&mut inner.types_updated, true) {
            warn!(target: "dwarfdb", "repeated update_types call, references are already rewritten");
        }

        let inner = &*inner;
        let mut missing = HashSet::new();
        for sref in inner.symbols.values() {
            let mut entity = sref.write().expect("unexpected: lock poisoned");
            for id in entity.referenced_ids_mut() {
                if id.is_none() {
                    continue;
                }
                match inner.id_index.get(id) {
                    Some(primary) => *id = *primary,
                    None => {
                        missing.insert(*id);
                    }
                }
            }
        }

        missing.into_iter().map(Error::MissingReferent).collect()
    }

    /// Resolve a type through its reference-qualifier chain down to a
    /// concrete type. Returns the primary id of the last resolvable link.
    pub fn concrete_type(&self, id: SymbolId) -> SymbolId {
        let mut seen = HashSet::new();
        let mut current = id;
        loop {
            let Some(sref) = self.find_by_id(current) else {
                return current;
            };
            let entity = sref.read().expect("unexpected: lock poisoned");
            let Some(ref_type) = entity.as_ref_type() else {
                return entity.id();
            };
            if ref_type.refers_to.is_none() {
                return entity.id();
            }
            if !seen.insert(entity.id()) {
                warn!(target: "dwarfdb", "reference cycle through type {}", entity.id());
                return entity.id();
            }
            current = ref_type.refers_to;
        }
    }

    /// Byte size of a type, resolving qualifiers and array elements.
    /// 0 means unknown.
    pub fn byte_size_of(&self, id: SymbolId) -> u64 {
        self.byte_size_of_guarded(id, &mut HashSet::new())
    }

    fn byte_size_of_guarded(&self, id: SymbolId, seen: &mut HashSet<SymbolId>) -> u64 {
        if id.is_none() || !seen.insert(id) {
            return 0;
        }
        let Some(sref) = self.find_by_id(id) else {
            return 0;
        };
        let entity = sref.read().expect("unexpected: lock poisoned");
        match &*entity {
            Entity::Base(base) => base.byte_size,
            Entity::Enum(e) => e.byte_size,
            Entity::Structured(s) => s.byte_size,
            Entity::Array(array) => {
                if array.byte_size != 0 {
                    array.byte_size
                } else {
                    array.length * self.byte_size_of_guarded(array.element_type, seen)
                }
            }
            Entity::Ref(ref_type) => {
                if ref_type.byte_size != 0 {
                    ref_type.byte_size
                } else if ref_type.modifier == RefModifier::Pointer {
                    mem::size_of::<usize>() as u64
                } else {
                    self.byte_size_of_guarded(ref_type.refers_to, seen)
                }
            }
            Entity::Function(_) | Entity::Variable(_) => 0,
        }
    }
}
