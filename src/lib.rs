//! Unified type and symbol graph over DWARF debug information.
//!
//! Object files are parsed per translation unit and merged into one graph:
//! entries with the same name and kind collapse onto a single entity that
//! remembers every DIE it came from. After all files are parsed,
//! [`SymbolManager::update_types`] rewrites raw cross-DIE references onto
//! canonical entity ids; from then on the graph is frozen and queryable.
//!
//! [`Instance`] is the consumer-facing view: a type anchored at a virtual
//! address, supporting member navigation, array indexing and pointer
//! chasing through a [`MemoryReader`].

pub mod die;
pub mod error;
pub mod instance;
pub mod location;
pub mod manager;
pub mod memory;
pub mod parser;
pub mod symbol;
pub mod r#type;

pub use error::Error;
pub use instance::Instance;
pub use manager::SymbolManager;
pub use memory::MemoryReader;
pub use parser::{parse_path, parse_paths_parallel, DwarfParser};
pub use r#type::{Entity, EntityKind, RefModifier, StructuredKind, SymbolRef};
pub use symbol::{FileId, Symbol, SymbolId};
