use crate::r#type::EntityKind;
use crate::symbol::SymbolId;
use gimli::DwAt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- decode errors ---------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("dwarf decode error: {0}")]
    Dwarf(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),
    #[error("attribute {0} not present in die")]
    MissingAttribute(DwAt),
    #[error("unsupported form of attribute {0}")]
    UnsupportedForm(DwAt),

    // --------------------------------- graph errors ----------------------------------------------
    #[error("`{name}` already registered as a {found}, requested as a {expected}")]
    KindMismatch {
        name: String,
        expected: EntityKind,
        found: EntityKind,
    },
    #[error("referent {0} not found")]
    MissingReferent(SymbolId),
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "dwarfdb", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "dwarfdb", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}
