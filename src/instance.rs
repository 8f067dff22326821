//! Typed views into a target address space.
//!
//! An [`Instance`] pairs a type with a virtual address and supports member
//! navigation, array indexing and pointer chasing by plain address
//! arithmetic over the graph. Instances never mutate the graph. Violated
//! preconditions (null anchor, unknown member, index past the end) are
//! programmer errors and panic.

use crate::error::Error;
use crate::manager::SymbolManager;
use crate::memory::MemoryReader;
use crate::r#type::{RefModifier, Structured};
use crate::symbol::SymbolId;
use std::collections::HashSet;
use std::fmt;

#[derive(Clone, Copy)]
pub struct Instance<'a> {
    manager: &'a SymbolManager,
    type_id: SymbolId,
    address: u64,
}

impl PartialEq for Instance<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.address == other.address
    }
}

impl Eq for Instance<'_> {}

impl fmt::Debug for Instance<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("type_id", &self.type_id)
            .field("address", &format_args!("{:#x}", self.address))
            .finish()
    }
}

impl<'a> Instance<'a> {
    pub fn new(manager: &'a SymbolManager, type_id: SymbolId, address: u64) -> Self {
        Self {
            manager,
            type_id,
            address,
        }
    }

    /// View of a named variable, anchored at its location.
    pub fn for_variable(manager: &'a SymbolManager, name: &str) -> Option<Self> {
        let sref = manager.find_variable_by_name(name)?;
        let entity = sref.read().expect("unexpected: lock poisoned");
        let variable = entity.as_variable()?;
        Some(Self::new(manager, variable.type_ref, variable.location))
    }

    pub fn type_id(&self) -> SymbolId {
        self.type_id
    }

    /// The concrete type behind the reference-qualifier chain.
    pub fn real_type(&self) -> SymbolId {
        self.manager.concrete_type(self.type_id)
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn set_address(&mut self, address: u64) {
        self.address = address;
    }

    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    /// Byte size of the viewed type, 0 when unknown.
    pub fn size(&self) -> u64 {
        self.manager.byte_size_of(self.type_id)
    }

    /// Element count when the viewed type is an array, 1 otherwise.
    pub fn length(&self) -> u64 {
        let Some(sref) = self.manager.find_by_id(self.type_id) else {
            return 1;
        };
        let entity = sref.read().expect("unexpected: lock poisoned");
        match entity.as_array() {
            Some(array) => array.length,
            None => 1,
        }
    }

    fn with_structured<T>(&self, f: impl FnOnce(&Structured) -> T) -> T {
        let concrete = self.real_type();
        let sref = self
            .manager
            .find_by_id(concrete)
            .unwrap_or_else(|| panic!("type {concrete} of instance is unresolved"));
        let entity = sref.read().expect("unexpected: lock poisoned");
        let structured = entity
            .as_structured()
            .unwrap_or_else(|| panic!("`{}` is not a structured type", entity.name()));
        f(structured)
    }

    /// Resolve a type down the qualifier chain until a pointer shows up.
    fn pointer_target(&self, id: SymbolId) -> Option<SymbolId> {
        let mut seen = HashSet::new();
        let mut current = id;
        loop {
            let sref = self.manager.find_by_id(current)?;
            let entity = sref.read().expect("unexpected: lock poisoned");
            let ref_type = entity.as_ref_type()?;
            if ref_type.modifier == RefModifier::Pointer {
                return Some(ref_type.refers_to);
            }
            if !seen.insert(entity.id()) {
                return None;
            }
            current = ref_type.refers_to;
        }
    }

    /// View of a member, anchored at this address plus the member offset.
    pub fn member_by_name(&self, name: &str) -> Instance<'a> {
        assert!(self.address != 0, "member access through a null instance");
        let (type_ref, location) = self.with_structured(|structured| {
            let member = structured
                .member_by_name(name)
                .unwrap_or_else(|| panic!("no member `{name}` in `{}`", structured.symbol.name));
            (member.type_ref, member.member_location)
        });
        Instance::new(self.manager, type_ref, self.address + location)
    }

    /// Like [`Self::member_by_name`], but when the member is a pointer the
    /// pointer value is read and the view re-anchors at the pointee.
    /// A null pointee panics unless `allow_null` is set.
    pub fn member_by_name_follow(
        &self,
        name: &str,
        memory: &dyn MemoryReader,
        allow_null: bool,
    ) -> Result<Instance<'a>, Error> {
        let member = self.member_by_name(name);
        let Some(target) = self.pointer_target(member.type_id) else {
            return Ok(member);
        };
        let address = memory.read_u64(member.address)?;
        assert!(
            allow_null || address != 0,
            "member `{name}` is a null pointer"
        );
        Ok(Instance::new(self.manager, target, address))
    }

    /// View of the member covering `offset` (the member with the greatest
    /// location not above it).
    pub fn member_by_offset(&self, offset: u64) -> Instance<'a> {
        assert!(
            offset <= self.size(),
            "offset {offset} is out of a type of size {}",
            self.size()
        );
        let (type_ref, location) = self.with_structured(|structured| {
            let member = structured
                .member_by_offset(offset)
                .unwrap_or_else(|| panic!("no member at offset {offset}"));
            (member.type_ref, member.member_location)
        });
        Instance::new(self.manager, type_ref, self.address + location)
    }

    /// Like [`Self::member_by_offset`], chasing pointer members down to a
    /// non-pointer view.
    pub fn member_by_offset_follow(
        &self,
        offset: u64,
        memory: &dyn MemoryReader,
    ) -> Result<Instance<'a>, Error> {
        let mut member = self.member_by_offset(offset);
        while let Some(target) = self.pointer_target(member.type_id) {
            let address = memory.read_u64(member.address)?;
            member = Instance::new(self.manager, target, address);
        }
        Ok(member)
    }

    /// Name of the member located exactly at `offset`, or an empty string.
    pub fn member_name(&self, offset: u64) -> String {
        assert!(self.address != 0, "member access through a null instance");
        self.with_structured(|structured| structured.member_name_by_offset(offset))
    }

    /// Byte offset of a member, `u32::MAX` when there is no such member.
    pub fn member_offset(&self, name: &str) -> u32 {
        self.with_structured(|structured| structured.member_offset(name))
    }

    /// View of one array element.
    pub fn array_elem(&self, index: u64) -> Instance<'a> {
        let sref = self
            .manager
            .find_by_id(self.type_id)
            .unwrap_or_else(|| panic!("type {} of instance is unresolved", self.type_id));
        let entity = sref.read().expect("unexpected: lock poisoned");
        let array = entity
            .as_array()
            .unwrap_or_else(|| panic!("`{}` is not an array type", entity.name()));

        assert!(
            array.length == 0 || index < array.length,
            "array of length {} indexed with {index}",
            array.length
        );
        let element_size = self.manager.byte_size_of(array.element_type);
        assert!(element_size != 0, "array element type has no byte size");

        Instance::new(
            self.manager,
            array.element_type,
            self.address + index * element_size,
        )
    }

    /// Strip the whole qualifier chain, reading the pointer value at every
    /// step.
    pub fn dereference(&self, memory: &dyn MemoryReader) -> Result<Instance<'a>, Error> {
        let mut address = self.address;
        let mut type_id = self.type_id;
        loop {
            let Some(sref) = self.manager.find_by_id(type_id) else {
                break;
            };
            let entity = sref.read().expect("unexpected: lock poisoned");
            let Some(ref_type) = entity.as_ref_type() else {
                break;
            };
            address = memory.read_u64(address)?;
            type_id = ref_type.refers_to;
        }
        Ok(Instance::new(self.manager, type_id, address))
    }

    /// Reinterpret the view as another structured type.
    ///
    /// When the current type is a `list_head` the anchor is pulled back by
    /// the offset of `field_name` inside the new type, turning a view of an
    /// embedded list link into a view of its containing object.
    pub fn change_base_type(&self, new_type: &str, field_name: &str) -> Instance<'a> {
        let target = self
            .manager
            .find_base_type_by_name(new_type)
            .unwrap_or_else(|| panic!("unknown type `{new_type}`"));
        let target = target.read().expect("unexpected: lock poisoned");

        let current_name = self
            .manager
            .find_by_id(self.type_id)
            .map(|sref| {
                sref.read()
                    .expect("unexpected: lock poisoned")
                    .name()
                    .to_string()
            })
            .unwrap_or_default();

        let mut address = self.address;
        if current_name == "list_head" {
            let structured = target
                .as_structured()
                .unwrap_or_else(|| panic!("`{new_type}` is not a structured type"));
            let member = structured
                .member_by_name(field_name)
                .unwrap_or_else(|| panic!("no member `{field_name}` in `{new_type}`"));
            address -= member.member_location;
        }

        Instance::new(self.manager, target.id(), address)
    }
}
