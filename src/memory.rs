use crate::error::Error;

/// Reads the target address space an [`Instance`](crate::instance::Instance)
/// is anchored in: a live process, a core dump, a VM introspection channel.
pub trait MemoryReader {
    fn read_u64(&self, addr: u64) -> Result<u64, Error>;
}
