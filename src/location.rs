//! Evaluator for the location expression blocks this crate cares about.
//!
//! Variable addresses and member offsets arrive as DWARF expression blocks.
//! Only two opcodes carry the values we need: `DW_OP_addr` (a constant
//! machine address) and `DW_OP_plus_uconst` (a constant byte offset).
//! Everything else evaluates to 0.

use log::warn;

/// Evaluate a block or exprloc attribute payload.
pub fn eval_location_block(block: &[u8]) -> u64 {
    let Some(&opcode) = block.first() else {
        return 0;
    };

    match opcode {
        op if op == gimli::DW_OP_addr.0 => {
            if block.len() > 10 {
                warn!(target: "dwarfdb", "DW_OP_addr block length mismatch ({})", block.len());
            }
            let Some(bytes) = block.get(1..9) else {
                warn!(target: "dwarfdb", "DW_OP_addr block too short ({})", block.len());
                return 0;
            };
            u64::from_le_bytes(bytes.try_into().expect("unreachable: 8 byte slice"))
        }
        op if op == gimli::DW_OP_plus_uconst.0 => {
            // unsigned LEB128, see binutils/dwarf.c:256
            let mut result = 0u64;
            for (i, &byte) in block[1..].iter().enumerate() {
                result |= ((byte & 0x7f) as u64) << (i * 7);
                if byte & 0x80 == 0 {
                    break;
                }
            }
            result
        }
        _ => 0,
    }
}
