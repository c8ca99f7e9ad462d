//! Guest memory access for device models that talk to a big-endian guest.
//!
//! Device models never own guest RAM; they receive a `&mut dyn GuestMemory` for the duration of a
//! request and use the fixed-width helpers below, which always use the guest's (big-endian) byte
//! order regardless of the host platform.

#![forbid(unsafe_code)]

mod flat;

pub use flat::FlatMemory;

/// Abstraction for guest address space access.
///
/// Reads take `&mut self` so implementations may route to MMIO with side effects.
pub trait GuestMemory {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]);
    fn write_physical(&mut self, paddr: u64, buf: &[u8]);

    fn read_u8(&mut self, addr: u32) -> u8 {
        let mut buf = [0u8; 1];
        self.read_physical(u64::from(addr), &mut buf);
        buf[0]
    }

    fn read_u16(&mut self, addr: u32) -> u16 {
        let mut buf = [0u8; 2];
        self.read_physical(u64::from(addr), &mut buf);
        u16::from_be_bytes(buf)
    }

    fn read_u32(&mut self, addr: u32) -> u32 {
        let mut buf = [0u8; 4];
        self.read_physical(u64::from(addr), &mut buf);
        u32::from_be_bytes(buf)
    }

    fn write_u8(&mut self, addr: u32, val: u8) {
        self.write_physical(u64::from(addr), &[val]);
    }

    fn write_u16(&mut self, addr: u32, val: u16) {
        self.write_physical(u64::from(addr), &val.to_be_bytes());
    }

    fn write_u32(&mut self, addr: u32, val: u32) {
        self.write_physical(u64::from(addr), &val.to_be_bytes());
    }

    /// Copy `len` bytes out of the guest.
    fn read_bytes(&mut self, addr: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.read_physical(u64::from(addr), &mut buf);
        buf
    }

    /// Copy host bytes into the guest.
    fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        self.write_physical(u64::from(addr), data);
    }

    fn fill(&mut self, addr: u32, len: usize, value: u8) {
        // Chunked so a large memset does not allocate a buffer of the full length.
        const CHUNK: usize = 256;
        let chunk = [value; CHUNK];
        let mut offset = 0usize;
        while offset < len {
            let n = (len - offset).min(CHUNK);
            self.write_physical(u64::from(addr) + offset as u64, &chunk[..n]);
            offset += n;
        }
    }
}

impl<T: GuestMemory + ?Sized> GuestMemory for &mut T {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) {
        (**self).read_physical(paddr, buf);
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        (**self).write_physical(paddr, buf);
    }
}
