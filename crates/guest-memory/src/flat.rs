use crate::GuestMemory;

/// Contiguous guest RAM starting at guest address 0.
///
/// Accesses past the end behave like an open bus: reads return zero and the out-of-range part of a
/// write is dropped.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    data: Vec<u8>,
}

impl FlatMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Returns the in-bounds sub-range `[start, end)` for an access, if any byte of it is mapped.
    fn clamp(&self, paddr: u64, len: usize) -> Option<(usize, usize)> {
        let size = self.data.len() as u64;
        if paddr >= size {
            return None;
        }
        let end = paddr.saturating_add(len as u64).min(size);
        Some((paddr as usize, end as usize))
    }
}

impl GuestMemory for FlatMemory {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) {
        buf.fill(0);
        if let Some((start, end)) = self.clamp(paddr, buf.len()) {
            buf[..end - start].copy_from_slice(&self.data[start..end]);
        }
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        if let Some((start, end)) = self.clamp(paddr, buf.len()) {
            self.data[start..end].copy_from_slice(&buf[..end - start]);
        }
    }
}
