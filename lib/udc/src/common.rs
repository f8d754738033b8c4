// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ops::Add;
use std::slice::SliceIndex;

/// Represents an abstract requested read operation.
///
/// Exposes an API with various "write" methods, which fulfill the request.
pub struct ReadOp<'a> {
    buf: &'a mut [u8],
    offset: usize,
    write_offset: usize,
}

impl<'a> ReadOp<'a> {
    /// Initializes a new read operation from a buffer.
    ///
    /// `op_offset` is an auxiliary offset stored within the operation,
    /// identifying the region which should be accessed to populate `buf`.
    pub fn from_buf(op_offset: usize, buf: &'a mut [u8]) -> Self {
        Self { buf, offset: op_offset, write_offset: 0 }
    }

    /// Constructs a child read operation covering `range` of an existing
    /// operation. The child's offset need not correlate to the parent's.
    pub fn new_child<'b, R>(
        op_offset: usize,
        parent: &'a mut ReadOp,
        range: R,
    ) -> ReadOp<'b>
    where
        'a: 'b,
        R: SliceIndex<[u8], Output = [u8]>,
    {
        ReadOp {
            buf: &mut parent.buf[range],
            offset: op_offset,
            write_offset: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn avail(&self) -> usize {
        self.len().checked_sub(self.write_offset).unwrap()
    }
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn write_u8(&mut self, val: u8) {
        self.write_bytes(&val.to_le_bytes()[..]);
    }
    pub fn write_u16(&mut self, val: u16) {
        self.write_bytes(&val.to_le_bytes()[..]);
    }
    pub fn write_u32(&mut self, val: u32) {
        self.write_bytes(&val.to_le_bytes()[..]);
    }
    pub fn write_u64(&mut self, val: u64) {
        self.write_bytes(&val.to_le_bytes()[..]);
    }
    pub fn write_bytes(&mut self, data: &[u8]) {
        let wr_off = self.write_offset;
        assert!(data.len() <= self.len().checked_sub(wr_off).unwrap());
        self.buf[wr_off..(wr_off + data.len())].copy_from_slice(data);
        self.write_offset += data.len();
    }
    pub fn fill(&mut self, val: u8) {
        for b in self.buf[self.write_offset..].iter_mut() {
            *b = val;
        }
        self.write_offset = self.len();
    }
}

/// Represents an abstract requested write operation.
///
/// Exposes an API with various "read" methods, which fulfill the request.
pub struct WriteOp<'a> {
    buf: &'a [u8],
    offset: usize,
    read_offset: usize,
}

impl<'a> WriteOp<'a> {
    /// Initializes a new write operation from a buffer.
    ///
    /// `op_offset` is an auxiliary offset stored within the operation,
    /// identifying the region within the emulated resource where `buf`
    /// should be stored.
    pub fn from_buf(op_offset: usize, buf: &'a [u8]) -> Self {
        Self { buf, offset: op_offset, read_offset: 0 }
    }

    /// Constructs a child write operation covering `range` of an existing
    /// operation. The child's offset need not correlate to the parent's.
    pub fn new_child<'b, R>(
        op_offset: usize,
        parent: &'a mut WriteOp,
        range: R,
    ) -> WriteOp<'b>
    where
        'a: 'b,
        R: SliceIndex<[u8], Output = [u8]>,
    {
        WriteOp { buf: &parent.buf[range], offset: op_offset, read_offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn avail(&self) -> usize {
        self.len().checked_sub(self.read_offset).unwrap()
    }
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn read_val<const COUNT: usize>(&mut self) -> [u8; COUNT] {
        let mut buf = [0u8; COUNT];
        self.read_bytes(&mut buf);
        buf
    }
    pub fn read_u8(&mut self) -> u8 {
        u8::from_le_bytes(self.read_val())
    }
    pub fn read_u16(&mut self) -> u16 {
        u16::from_le_bytes(self.read_val())
    }
    pub fn read_u32(&mut self) -> u32 {
        u32::from_le_bytes(self.read_val())
    }
    pub fn read_u64(&mut self) -> u64 {
        u64::from_le_bytes(self.read_val())
    }
    pub fn read_bytes(&mut self, data: &mut [u8]) {
        if data.is_empty() {
            return;
        }
        let rd_off = self.read_offset;
        assert!(data.len() <= self.len().checked_sub(rd_off).unwrap());
        data.copy_from_slice(&self.buf[rd_off..(rd_off + data.len())]);
        self.read_offset += data.len();
    }
}

pub enum RWOp<'a, 'b> {
    Read(&'a mut ReadOp<'b>),
    Write(&'a mut WriteOp<'b>),
}
impl RWOp<'_, '_> {
    pub fn offset(&self) -> usize {
        match self {
            RWOp::Read(ro) => ro.offset,
            RWOp::Write(wo) => wo.offset,
        }
    }
    pub fn len(&self) -> usize {
        match self {
            RWOp::Read(ro) => ro.len(),
            RWOp::Write(wo) => wo.len(),
        }
    }
    pub fn is_read(&self) -> bool {
        matches!(self, RWOp::Read(_))
    }
    pub fn is_write(&self) -> bool {
        matches!(self, RWOp::Write(_))
    }
}

/// An address within a guest VM.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct GuestAddr(pub u64);

impl GuestAddr {
    pub fn offset<T: Sized>(&self, count: usize) -> Self {
        Self(self.0 + (count * std::mem::size_of::<T>()) as u64)
    }
}

impl Add<usize> for GuestAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readop_base_size() {
        let mut buf = [0u8; 8];
        let mut ro8 = ReadOp::from_buf(0, &mut buf[0..1]);
        ro8.write_u8(1);
        drop(ro8);
        assert_eq!(buf, [1, 0, 0, 0, 0, 0, 0, 0]);

        let mut ro16 = ReadOp::from_buf(0, &mut buf[0..2]);
        ro16.write_u16(0x2000);
        drop(ro16);
        assert_eq!(buf, [0, 0x20, 0, 0, 0, 0, 0, 0]);

        let mut ro32 = ReadOp::from_buf(0, &mut buf[0..4]);
        ro32.write_u32(0x4000_0000);
        drop(ro32);
        assert_eq!(buf, [0, 0, 0, 0x40, 0, 0, 0, 0]);

        let mut ro64 = ReadOp::from_buf(0, &mut buf);
        ro64.write_u64(0x8000_0000_0000_0000);
        drop(ro64);
        assert_eq!(buf, [0, 0, 0, 0, 0, 0, 0, 0x80]);
    }

    #[test]
    fn writeop_base_size() {
        let buf = [0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80];
        let mut wo8 = WriteOp::from_buf(0, &buf[0..1]);
        assert_eq!(wo8.read_u8(), 0x10);

        let mut wo16 = WriteOp::from_buf(0, &buf[0..2]);
        assert_eq!(wo16.read_u16(), 0x2010);

        let mut wo32 = WriteOp::from_buf(0, &buf[0..4]);
        assert_eq!(wo32.read_u32(), 0x4030_2010);

        let mut wo64 = WriteOp::from_buf(0, &buf);
        assert_eq!(wo64.read_u64(), 0x8070_6050_4030_2010);
    }

    #[test]
    fn readop_fill_tracks_offset() {
        let mut buf = [0u8; 4];
        let mut ro = ReadOp::from_buf(0, &mut buf);
        ro.write_u16(0x0102);
        ro.fill(0xff);
        assert_eq!(ro.avail(), 0);
        drop(ro);
        assert_eq!(buf, [0x02, 0x01, 0xff, 0xff]);
    }
}
