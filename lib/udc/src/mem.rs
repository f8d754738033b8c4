// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest physical memory access.
//!
//! The device model reads queue heads and transfer descriptors out of guest
//! memory and writes payloads and descriptor updates back. The embedder
//! supplies the backing implementation; every access is bounds-checked there
//! and surfaced as a [`MemError`] rather than a panic.

use std::sync::Mutex;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::common::GuestAddr;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum MemError {
    #[error("guest access at {0:#x} of {1} bytes is out of range")]
    OutOfRange(u64, usize),
}

pub type Result<T> = std::result::Result<T, MemError>;

pub trait GuestMemory: Send + Sync + 'static {
    fn read_into(&self, addr: GuestAddr, buf: &mut [u8]) -> Result<()>;
    fn write_from(&self, addr: GuestAddr, buf: &[u8]) -> Result<()>;
}

/// Typed accessors layered on [`GuestMemory`] via `zerocopy`.
pub trait GuestMemoryExt: GuestMemory {
    fn read_obj<T: FromBytes + IntoBytes>(&self, addr: GuestAddr) -> Result<T> {
        let mut obj = T::new_zeroed();
        self.read_into(addr, obj.as_mut_bytes())?;
        Ok(obj)
    }
    fn write_obj<T: IntoBytes + Immutable>(
        &self,
        addr: GuestAddr,
        obj: &T,
    ) -> Result<()> {
        self.write_from(addr, obj.as_bytes())
    }
}
impl<M: GuestMemory + ?Sized> GuestMemoryExt for M {}

/// Vec-backed guest memory for tests and simple embedders.
pub struct GuestRam {
    base: GuestAddr,
    buf: Mutex<Vec<u8>>,
}

impl GuestRam {
    pub fn new(base: GuestAddr, size: usize) -> Self {
        Self { base, buf: Mutex::new(vec![0; size]) }
    }

    fn range(&self, addr: GuestAddr, len: usize) -> Result<(usize, usize)> {
        let size = self.buf.lock().unwrap().len();
        let start = addr
            .0
            .checked_sub(self.base.0)
            .map(|off| off as usize)
            .ok_or(MemError::OutOfRange(addr.0, len))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= size)
            .ok_or(MemError::OutOfRange(addr.0, len))?;
        Ok((start, end))
    }
}

impl GuestMemory for GuestRam {
    fn read_into(&self, addr: GuestAddr, buf: &mut [u8]) -> Result<()> {
        let (start, end) = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.buf.lock().unwrap()[start..end]);
        Ok(())
    }
    fn write_from(&self, addr: GuestAddr, buf: &[u8]) -> Result<()> {
        let (start, end) = self.range(addr, buf.len())?;
        self.buf.lock().unwrap()[start..end].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_round_trip() {
        let ram = GuestRam::new(GuestAddr(0x1000), 0x100);
        ram.write_from(GuestAddr(0x1010), &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        ram.read_into(GuestAddr(0x1010), &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn ram_bounds() {
        let ram = GuestRam::new(GuestAddr(0x1000), 0x100);
        let mut buf = [0u8; 8];
        assert!(ram.read_into(GuestAddr(0xff8), &mut buf).is_err());
        assert!(ram.read_into(GuestAddr(0x10fc), &mut buf).is_err());
        assert!(ram.write_from(GuestAddr(0x10fc), &buf).is_err());
        assert!(ram.read_into(GuestAddr(0x10f8), &mut buf).is_ok());
    }

    #[test]
    fn typed_access() {
        let ram = GuestRam::new(GuestAddr(0), 0x100);
        ram.write_obj(GuestAddr(0x20), &0xdead_beefu32).unwrap();
        let val: u32 = ram.read_obj(GuestAddr(0x20)).unwrap();
        assert_eq!(val, 0xdead_beef);
    }
}
