//! The parser driver: walks DIE trees of every compilation unit and turns
//! them into graph entities.
//!
//! The walk is pre-order (node, then children, then siblings). Entities are
//! deduplicated by name through the manager; a DIE whose name and kind match
//! an already known entity updates that entity and is recorded as an
//! alternative id of it. Reference attributes stay raw `(file, offset)` ids
//! until [`SymbolManager::update_types`] runs.

use crate::die::object::ObjectDebugInfo;
use crate::die::{DebugSource, DieCursor};
use crate::error::Error;
use crate::manager::SymbolManager;
use crate::r#type::{
    ArrayType, BaseType, Entity, EntityKind, EnumType, Function, RefBaseType, RefModifier,
    Structured, StructuredKind, SymbolRef, Variable,
};
use crate::symbol::{next_file_id, FileId, Symbol, SymbolId};
use gimli::{
    DW_AT_declaration, DW_AT_const_value, DW_AT_location, DW_AT_low_pc, DW_AT_specification,
    DW_TAG_array_type, DW_TAG_base_type, DW_TAG_class_type, DW_TAG_const_type,
    DW_TAG_enumeration_type, DW_TAG_enumerator, DW_TAG_formal_parameter, DW_TAG_member,
    DW_TAG_pointer_type, DW_TAG_structure_type, DW_TAG_subprogram, DW_TAG_subrange_type,
    DW_TAG_typedef, DW_TAG_union_type, DW_TAG_variable,
};
use log::{debug, warn};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// Driver over one debug-information file.
///
/// Each driver gets a fresh process-global file id at construction. The
/// manager may be shared between drivers running on different threads.
pub struct DwarfParser<'a, S: DebugSource> {
    source: S,
    manager: &'a SymbolManager,
    file_id: FileId,
}

impl<'a, S: DebugSource> DwarfParser<'a, S> {
    pub fn new(source: S, manager: &'a SymbolManager) -> Self {
        Self {
            source,
            manager,
            file_id: next_file_id(),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Walk all compilation units. A decode error aborts this file's parse;
    /// entities registered so far stay valid in the manager.
    pub fn parse(&mut self) -> Result<(), Error> {
        while let Some((cu_offset, cu_die)) = self.source.next_cu()? {
            debug!(target: "dwarfdb", "file {}: compilation unit at {cu_offset:#x}", self.file_id);
            self.walk(cu_die, None)?;
        }
        Ok(())
    }

    fn die_id<C: DieCursor>(&self, die: &C) -> SymbolId {
        SymbolId::combine(self.file_id, die.offset())
    }

    /// Visit a sibling chain: classify each DIE, then descend into its
    /// children with the freshly built entity as parent.
    fn walk(&self, die: S::Cursor, parent: Option<&SymbolRef>) -> Result<(), Error> {
        let mut current = Some(die);
        while let Some(die) = current {
            let symbol = self.classify(&die, parent)?;
            if let Some(child) = die.first_child()? {
                self.walk(child, symbol.as_ref())?;
            }
            current = die.sibling()?;
        }
        Ok(())
    }

    fn classify(
        &self,
        die: &S::Cursor,
        parent: Option<&SymbolRef>,
    ) -> Result<Option<SymbolRef>, Error> {
        let name = die.name().unwrap_or_default();

        let symbol = match die.tag() {
            DW_TAG_typedef => Some(self.get_or_create_ref(die, &name, RefModifier::Typedef)?),
            DW_TAG_structure_type | DW_TAG_class_type => {
                if die.attr_flag(DW_AT_declaration) {
                    None
                } else {
                    Some(self.get_or_create(die, &name, EntityKind::Struct)?)
                }
            }
            DW_TAG_union_type => Some(self.get_or_create(die, &name, EntityKind::Union)?),
            DW_TAG_member => {
                match parent {
                    Some(parent) => {
                        let mut entity = parent.write().expect("unexpected: lock poisoned");
                        match entity.as_structured_mut() {
                            Some(structured) => {
                                structured.add_member(die, &name, self.file_id)?;
                            }
                            None => warn!(
                                target: "dwarfdb",
                                "member `{name}` parent is not a structured type"
                            ),
                        }
                    }
                    None => warn!(target: "dwarfdb", "member `{name}` without a parent"),
                }
                None
            }
            DW_TAG_base_type => Some(self.get_or_create(die, &name, EntityKind::BaseType)?),
            DW_TAG_pointer_type => Some(self.get_or_create_ref(die, &name, RefModifier::Pointer)?),
            DW_TAG_const_type => Some(self.get_or_create_ref(die, &name, RefModifier::Const)?),
            DW_TAG_enumeration_type => Some(self.get_or_create(die, &name, EntityKind::Enum)?),
            DW_TAG_enumerator => {
                let value = die.attr_number(DW_AT_const_value)? as i64;
                match parent.and_then(|parent| {
                    parent
                        .write()
                        .expect("unexpected: lock poisoned")
                        .as_enum_mut()
                        .map(|e| e.add_enumerator(name.as_str(), value))
                }) {
                    Some(()) => {}
                    None => warn!(target: "dwarfdb", "enumerator `{name}` outside of an enum"),
                }
                None
            }
            DW_TAG_variable => {
                if die.has_attr(DW_AT_specification) {
                    // an initializer for a variable declared elsewhere
                    if die.has_attr(DW_AT_location) {
                        let referent = die.attr_number(DW_AT_specification)?;
                        let id = self.manager.get_id(referent, self.file_id);
                        if let Some(sref) = self.manager.find_by_id(id) {
                            let mut entity = sref.write().expect("unexpected: lock poisoned");
                            if let Some(variable) = entity.as_variable_mut() {
                                variable.update(die)?;
                            }
                        }
                    }
                    None
                } else {
                    Some(self.get_or_create(die, &name, EntityKind::Variable)?)
                }
            }
            DW_TAG_array_type => {
                // a fresh entity per die, arrays are never merged
                let array =
                    ArrayType::new(Symbol::new(self.die_id(die), name), die, self.file_id)?;
                Some(self.manager.register(Entity::Array(array)))
            }
            DW_TAG_subrange_type => {
                match parent {
                    Some(parent) => {
                        let mut entity = parent.write().expect("unexpected: lock poisoned");
                        match entity.as_array_mut() {
                            Some(array) => array.update_bounds(die)?,
                            None => {
                                warn!(target: "dwarfdb", "subrange parent is not an array type")
                            }
                        }
                    }
                    None => warn!(target: "dwarfdb", "subrange without a parent"),
                }
                None
            }
            DW_TAG_subprogram => {
                if die.has_attr(DW_AT_specification) {
                    // a definition for a function declared elsewhere
                    if die.has_attr(DW_AT_low_pc) {
                        let referent = die.attr_number(DW_AT_specification)?;
                        let id = self.manager.get_id(referent, self.file_id);
                        if let Some(sref) = self.manager.find_by_id(id) {
                            let mut entity = sref.write().expect("unexpected: lock poisoned");
                            if let Some(function) = entity.as_function_mut() {
                                function.update(die, self.file_id)?;
                            }
                        }
                    }
                    None
                } else {
                    Some(self.get_or_create(die, &name, EntityKind::Function)?)
                }
            }
            DW_TAG_formal_parameter => {
                if let Some(parent) = parent {
                    let mut entity = parent.write().expect("unexpected: lock poisoned");
                    if let Some(function) = entity.as_function_mut() {
                        function.add_param(die, self.file_id)?;
                    }
                }
                None
            }
            // compile units, namespaces, imported declarations, lexical
            // blocks and every other tag carry no entity of their own,
            // children are still visited
            _ => None,
        };

        Ok(symbol)
    }

    /// Find an entity of this name and kind or create one from the DIE.
    /// On a hit the canonical entity is updated and the DIE becomes its
    /// alternative id.
    fn get_or_create(
        &self,
        die: &S::Cursor,
        name: &str,
        kind: EntityKind,
    ) -> Result<SymbolRef, Error> {
        if !name.is_empty() {
            if let Some(sref) = self.manager.find_type_of_kind(name, kind) {
                sref.write()
                    .expect("unexpected: lock poisoned")
                    .update(die, self.file_id)?;
                self.manager.add_alternative_id(&sref, self.die_id(die));
                return Ok(sref);
            }
        }

        let symbol = Symbol::new(self.die_id(die), name);
        let entity = match kind {
            EntityKind::BaseType => Entity::Base(BaseType::new(symbol, die)?),
            EntityKind::Struct => {
                Entity::Structured(Structured::new(symbol, StructuredKind::Struct, die)?)
            }
            EntityKind::Union => {
                Entity::Structured(Structured::new(symbol, StructuredKind::Union, die)?)
            }
            EntityKind::Enum => Entity::Enum(EnumType::new(symbol, die)?),
            EntityKind::Function => Entity::Function(Function::new(symbol, die, self.file_id)?),
            EntityKind::Variable => Entity::Variable(Variable::new(symbol, die, self.file_id)?),
            EntityKind::Typedef
            | EntityKind::ConstType
            | EntityKind::Pointer
            | EntityKind::Array => {
                unreachable!("ref types and arrays have dedicated constructors")
            }
        };
        Ok(self.manager.register(entity))
    }

    /// Reference-qualifier variant of [`Self::get_or_create`]. A name hit of
    /// a different qualifier kind is a hard error.
    fn get_or_create_ref(
        &self,
        die: &S::Cursor,
        name: &str,
        modifier: RefModifier,
    ) -> Result<SymbolRef, Error> {
        if !name.is_empty() {
            if let Some(sref) = self.manager.find_ref_base_type_by_name(name) {
                {
                    let mut entity = sref.write().expect("unexpected: lock poisoned");
                    let found = entity.kind();
                    match entity.as_ref_type_mut() {
                        Some(ref_type) if ref_type.modifier == modifier => {
                            ref_type.update(die, self.file_id)?;
                        }
                        _ => {
                            warn!(
                                target: "dwarfdb",
                                "ref type `{name}` with same name but different kind: {expected} vs {found}, previous id {prev}, current die {cur:#x}",
                                expected = modifier.kind(),
                                prev = entity.id(),
                                cur = die.offset(),
                            );
                            return Err(Error::KindMismatch {
                                name: name.to_string(),
                                expected: modifier.kind(),
                                found,
                            });
                        }
                    }
                }
                self.manager.add_alternative_id(&sref, self.die_id(die));
                return Ok(sref);
            }
        }

        let symbol = Symbol::new(self.die_id(die), name);
        let entity = Entity::Ref(RefBaseType::new(symbol, modifier, die, self.file_id)?);
        Ok(self.manager.register(entity))
    }
}

/// Parse the object file at `path` into the manager.
/// Returns the file id assigned to this parse.
pub fn parse_path(path: impl AsRef<Path>, manager: &SymbolManager) -> Result<FileId, Error> {
    let source = ObjectDebugInfo::open(path)?;
    let mut parser = DwarfParser::new(source, manager);
    parser.parse()?;
    Ok(parser.file_id())
}

/// Parse several object files in parallel, one driver per file.
/// Failed files are reported back, successful ones stay in the manager.
/// Call [`SymbolManager::update_types`] after this returns.
pub fn parse_paths_parallel(paths: &[PathBuf], manager: &SymbolManager) -> Vec<(PathBuf, Error)> {
    paths
        .par_iter()
        .filter_map(|path| {
            parse_path(path, manager)
                .err()
                .map(|error| (path.clone(), error))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::die::mock::{TestDebugInfo, TestDie};
    use gimli::{
        DW_AT_byte_size, DW_AT_data_member_location, DW_AT_type, DW_AT_upper_bound,
        DW_TAG_compile_unit,
    };

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// `struct foo { int a; int b; }` plus the `int` base type, with every
    /// die offset shifted by `base`.
    fn unit_with_struct_foo(base: u64) -> TestDie {
        TestDie::new(DW_TAG_compile_unit, base + 0xb)
            .child(
                TestDie::new(DW_TAG_structure_type, base + 0x40)
                    .name("foo")
                    .num(DW_AT_byte_size, 8)
                    .child(
                        TestDie::new(DW_TAG_member, base + 0x48)
                            .name("a")
                            .num(DW_AT_type, base + 0x70)
                            .num(DW_AT_data_member_location, 0),
                    )
                    .child(
                        TestDie::new(DW_TAG_member, base + 0x58)
                            .name("b")
                            .num(DW_AT_type, base + 0x70)
                            .num(DW_AT_data_member_location, 4),
                    ),
            )
            .child(
                TestDie::new(DW_TAG_base_type, base + 0x70)
                    .name("int")
                    .num(DW_AT_byte_size, 4),
            )
    }

    fn parse(source: TestDebugInfo, manager: &SymbolManager) -> FileId {
        let mut parser = DwarfParser::new(source, manager);
        parser.parse().expect("parse must succeed");
        parser.file_id()
    }

    #[test]
    fn test_struct_merged_across_files() {
        init_logs();
        let manager = SymbolManager::new();

        let file1 = TestDebugInfo::new().unit(0, unit_with_struct_foo(0));
        let file2 = TestDebugInfo::new().unit(0x80, unit_with_struct_foo(0x80));
        let fid1 = parse(file1, &manager);
        let fid2 = parse(file2, &manager);
        assert!(manager.update_types().is_empty());

        let foo = manager.find_base_type_by_name("foo").unwrap();
        let entity = foo.read().unwrap();
        assert_eq!(entity.id(), SymbolId::combine(fid1, 0x40));
        assert!(entity
            .symbol()
            .has_alternative_id(SymbolId::combine(fid2, 0xc0)));

        let structured = entity.as_structured().unwrap();
        assert_eq!(structured.members().count(), 2);
        assert_eq!(structured.member_by_name("a").unwrap().member_location, 0);
        assert_eq!(structured.member_by_name("b").unwrap().member_location, 4);

        // member types collapse onto the first file's `int`
        let int_id = SymbolId::combine(fid1, 0x70);
        assert_eq!(structured.member_by_name("a").unwrap().type_ref, int_id);
        assert_eq!(structured.member_by_name("b").unwrap().type_ref, int_id);
    }

    #[test]
    fn test_typedef_chain_resolves_to_concrete_type() {
        let manager = SymbolManager::new();
        let unit = TestDie::new(DW_TAG_compile_unit, 0xb)
            .child(
                TestDie::new(DW_TAG_base_type, 0x40)
                    .name("unsigned int")
                    .num(DW_AT_byte_size, 4),
            )
            .child(
                TestDie::new(DW_TAG_typedef, 0x50)
                    .name("u32")
                    .num(DW_AT_type, 0x40),
            )
            .child(
                TestDie::new(DW_TAG_typedef, 0x60)
                    .name("size_t")
                    .num(DW_AT_type, 0x50),
            );
        let fid = parse(TestDebugInfo::new().unit(0, unit), &manager);
        assert!(manager.update_types().is_empty());

        let size_t = manager.find_base_type_by_name("size_t").unwrap();
        let concrete = manager.concrete_type(size_t.read().unwrap().id());
        assert_eq!(concrete, SymbolId::combine(fid, 0x40));

        let concrete = manager.find_by_id(concrete).unwrap();
        let concrete = concrete.read().unwrap();
        assert_eq!(concrete.name(), "unsigned int");
        assert_eq!(concrete.as_base().unwrap().byte_size, 4);
    }

    #[test]
    fn test_array_length_from_subrange() {
        let manager = SymbolManager::new();
        let unit = TestDie::new(DW_TAG_compile_unit, 0xb)
            .child(
                TestDie::new(DW_TAG_array_type, 0x40)
                    .num(DW_AT_type, 0x70)
                    .child(TestDie::new(DW_TAG_subrange_type, 0x48).num(DW_AT_upper_bound, 9)),
            )
            .child(
                TestDie::new(DW_TAG_base_type, 0x70)
                    .name("int")
                    .num(DW_AT_byte_size, 4),
            );
        let fid = parse(TestDebugInfo::new().unit(0, unit), &manager);

        let array = manager.find_by_id(SymbolId::combine(fid, 0x40)).unwrap();
        let entity = array.read().unwrap();
        let array = entity.as_array().unwrap();
        assert_eq!(array.length, 10);
        assert_eq!(array.element_type, SymbolId::combine(fid, 0x70));
    }

    #[test]
    fn test_arrays_are_never_merged() {
        let manager = SymbolManager::new();
        let unit = |base: u64| {
            TestDie::new(DW_TAG_compile_unit, base + 0xb).child(
                TestDie::new(DW_TAG_array_type, base + 0x40)
                    .num(DW_AT_type, base + 0x70)
                    .child(
                        TestDie::new(DW_TAG_subrange_type, base + 0x48).num(DW_AT_upper_bound, 9),
                    ),
            )
        };
        let fid = parse(
            TestDebugInfo::new().unit(0, unit(0)).unit(0x100, unit(0x100)),
            &manager,
        );

        let first = manager.find_by_id(SymbolId::combine(fid, 0x40));
        let second = manager.find_by_id(SymbolId::combine(fid, 0x140));
        assert!(first.is_some());
        assert!(second.is_some());
        assert_eq!(manager.symbol_count(), 2);
    }

    #[test]
    fn test_variable_location_addr_opcode() {
        let manager = SymbolManager::new();
        let unit = TestDie::new(DW_TAG_compile_unit, 0xb).child(
            TestDie::new(DW_TAG_variable, 0x40)
                .name("init_task")
                .num(DW_AT_type, 0x70)
                .block(
                    DW_AT_location,
                    &[0x03, 0x78, 0x56, 0x34, 0x12, 0x00, 0x00, 0x00, 0x00],
                ),
        );
        parse(TestDebugInfo::new().unit(0, unit), &manager);

        let variable = manager.find_variable_by_name("init_task").unwrap();
        let entity = variable.read().unwrap();
        assert_eq!(entity.as_variable().unwrap().location, 0x12345678);
    }

    #[test]
    fn test_variable_location_plus_uconst_opcode() {
        let manager = SymbolManager::new();
        let unit = TestDie::new(DW_TAG_compile_unit, 0xb).child(
            TestDie::new(DW_TAG_variable, 0x40)
                .name("per_cpu_offset")
                .block(DW_AT_location, &[0x23, 0xe5, 0x8e, 0x26]),
        );
        parse(TestDebugInfo::new().unit(0, unit), &manager);

        let variable = manager.find_variable_by_name("per_cpu_offset").unwrap();
        let entity = variable.read().unwrap();
        assert_eq!(entity.as_variable().unwrap().location, 624485);
    }

    #[test]
    fn test_variable_specification_updates_declaration() {
        init_logs();
        let manager = SymbolManager::new();
        let unit = TestDie::new(DW_TAG_compile_unit, 0xb)
            .child(
                TestDie::new(DW_TAG_variable, 0x40)
                    .name("jiffies")
                    .num(DW_AT_type, 0x70),
            )
            .child(
                TestDie::new(DW_TAG_variable, 0x60)
                    .num(DW_AT_specification, 0x40)
                    .block(
                        DW_AT_location,
                        &[0x03, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
                    ),
            );
        let fid = parse(TestDebugInfo::new().unit(0, unit), &manager);

        let variable = manager.find_variable_by_name("jiffies").unwrap();
        let entity = variable.read().unwrap();
        assert_eq!(entity.id(), SymbolId::combine(fid, 0x40));
        assert_eq!(entity.as_variable().unwrap().location, 0x1000);
    }

    #[test]
    fn test_subprogram_specification_updates_address() {
        let manager = SymbolManager::new();
        let unit = TestDie::new(DW_TAG_compile_unit, 0xb)
            .child(
                TestDie::new(DW_TAG_subprogram, 0x40)
                    .name("schedule")
                    .child(
                        TestDie::new(DW_TAG_formal_parameter, 0x48)
                            .name("prev")
                            .num(DW_AT_type, 0x70),
                    ),
            )
            .child(
                TestDie::new(DW_TAG_subprogram, 0x60)
                    .num(DW_AT_specification, 0x40)
                    .addr(DW_AT_low_pc, 0xffff_8000_0001_0000),
            );
        parse(TestDebugInfo::new().unit(0, unit), &manager);

        let function = manager.find_function_by_name("schedule").unwrap();
        let entity = function.read().unwrap();
        let function = entity.as_function().unwrap();
        assert_eq!(function.address, 0xffff_8000_0001_0000);
        assert_eq!(function.params().len(), 1);
        assert_eq!(function.params()[0].0, "prev");
    }

    #[test]
    fn test_struct_declaration_is_skipped() {
        let manager = SymbolManager::new();
        let unit = TestDie::new(DW_TAG_compile_unit, 0xb).child(
            TestDie::new(DW_TAG_structure_type, 0x40)
                .name("opaque")
                .flag(DW_AT_declaration),
        );
        parse(TestDebugInfo::new().unit(0, unit), &manager);

        assert!(manager.find_base_type_by_name("opaque").is_none());
        assert_eq!(manager.symbol_count(), 0);
    }

    #[test]
    fn test_enumerators() {
        let manager = SymbolManager::new();
        let unit = TestDie::new(DW_TAG_compile_unit, 0xb).child(
            TestDie::new(DW_TAG_enumeration_type, 0x40)
                .name("pid_type")
                .num(DW_AT_byte_size, 4)
                .child(TestDie::new(DW_TAG_enumerator, 0x48).name("PIDTYPE_PID").num(DW_AT_const_value, 0))
                .child(TestDie::new(DW_TAG_enumerator, 0x50).name("PIDTYPE_TGID").num(DW_AT_const_value, 1))
                .child(
                    TestDie::new(DW_TAG_enumerator, 0x58)
                        .name("PIDTYPE_INVALID")
                        .num(DW_AT_const_value, (-1i64) as u64),
                ),
        );
        parse(TestDebugInfo::new().unit(0, unit), &manager);

        let pid_type = manager.find_base_type_by_name("pid_type").unwrap();
        let entity = pid_type.read().unwrap();
        let pid_type = entity.as_enum().unwrap();
        assert_eq!(pid_type.enumerator_value("PIDTYPE_PID"), Some(0));
        assert_eq!(pid_type.enumerator_value("PIDTYPE_TGID"), Some(1));
        assert_eq!(pid_type.enumerator_value("PIDTYPE_INVALID"), Some(-1));
        assert_eq!(pid_type.enumerator_name(1), Some("PIDTYPE_TGID"));
    }

    #[test]
    fn test_ref_kind_collision_is_fatal() {
        init_logs();
        let manager = SymbolManager::new();
        let unit = TestDie::new(DW_TAG_compile_unit, 0xb)
            .child(
                TestDie::new(DW_TAG_pointer_type, 0x40)
                    .name("handle")
                    .num(DW_AT_type, 0x70),
            )
            .child(
                TestDie::new(DW_TAG_typedef, 0x50)
                    .name("handle")
                    .num(DW_AT_type, 0x70),
            );

        let mut parser = DwarfParser::new(TestDebugInfo::new().unit(0, unit), &manager);
        let err = parser.parse().unwrap_err();
        assert!(matches!(
            err,
            Error::KindMismatch {
                expected: EntityKind::Typedef,
                found: EntityKind::Pointer,
                ..
            }
        ));
    }

    #[test]
    fn test_same_ref_kind_merges() {
        let manager = SymbolManager::new();
        let unit = TestDie::new(DW_TAG_compile_unit, 0xb)
            .child(
                TestDie::new(DW_TAG_typedef, 0x40)
                    .name("u64")
                    .num(DW_AT_type, 0x70),
            )
            .child(
                TestDie::new(DW_TAG_typedef, 0x50)
                    .name("u64")
                    .num(DW_AT_type, 0x70),
            )
            .child(
                TestDie::new(DW_TAG_base_type, 0x70)
                    .name("long unsigned int")
                    .num(DW_AT_byte_size, 8),
            );
        let fid = parse(TestDebugInfo::new().unit(0, unit), &manager);

        let u64_type = manager.find_ref_base_type_by_name("u64").unwrap();
        let entity = u64_type.read().unwrap();
        assert_eq!(entity.id(), SymbolId::combine(fid, 0x40));
        assert!(entity
            .symbol()
            .has_alternative_id(SymbolId::combine(fid, 0x50)));
    }
}
