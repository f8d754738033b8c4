// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queue-head and transfer-descriptor access in guest memory.
//!
//! The guest publishes a table of [`QueueHead`]s at ENDPOINTLISTADDR, two
//! per endpoint: the RX head at index `2n`, the TX head at `2n + 1`. Each
//! queue head points at a chain of [`TransferDescriptor`]s linked through
//! `next_pointer`, ended by a descriptor whose terminator bit is set.

use thiserror::Error;

use crate::common::GuestAddr;
use crate::mem::{GuestMemory, GuestMemoryExt, MemError};

use super::bits::{QueueHead, TransferDescriptor, QH_SETUP_OFFSET};

/// Upper bound on descriptors visited in one chain walk, guarding against
/// guest-constructed cycles.
pub const TD_CHAIN_BUDGET: usize = 64;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Mem(#[from] MemError),

    #[error("descriptor chain exceeded {TD_CHAIN_BUDGET} entries")]
    BudgetExceeded,
}

pub type Result<T> = std::result::Result<T, QueueError>;

pub const fn rx_index(ep: u8) -> u8 {
    ep * 2
}
pub const fn tx_index(ep: u8) -> u8 {
    ep * 2 + 1
}

/// A view of the queue-head table rooted at ENDPOINTLISTADDR.
pub struct QueueView<'a> {
    mem: &'a dyn GuestMemory,
    base: GuestAddr,
}

impl<'a> QueueView<'a> {
    pub fn new(mem: &'a dyn GuestMemory, list_addr: u32) -> Self {
        Self { mem, base: GuestAddr(list_addr as u64) }
    }

    pub fn queue_head(&self, index: u8) -> Result<QueueHead> {
        let addr = self.base.offset::<QueueHead>(index as usize);
        Ok(self.mem.read_obj(addr)?)
    }

    /// Store an 8-byte SETUP stage into the control endpoint's queue head.
    pub fn write_setup(&self, setup: [u32; 2]) -> Result<()> {
        let addr = self.base + QH_SETUP_OFFSET;
        self.mem.write_obj(addr, &setup)?;
        Ok(())
    }

    pub fn td(&self, addr: u32) -> Result<TransferDescriptor> {
        Ok(self.mem.read_obj(GuestAddr(addr as u64))?)
    }

    /// Rewrite only the `info` word of the descriptor at `addr`.
    pub fn write_td_info(&self, addr: u32, info: u32) -> Result<()> {
        let addr = GuestAddr(addr as u64) + std::mem::size_of::<u32>();
        self.mem.write_obj(addr, &info)?;
        Ok(())
    }

    /// Store `data` at the descriptor's first buffer pointer.
    pub fn write_payload(
        &self,
        td: &TransferDescriptor,
        data: &[u8],
    ) -> Result<()> {
        self.mem.write_from(GuestAddr(td.buffer_pointers[0] as u64), data)?;
        Ok(())
    }

    /// Fetch `len` bytes from the descriptor's first buffer pointer.
    pub fn read_payload(
        &self,
        td: &TransferDescriptor,
        len: usize,
    ) -> Result<Vec<u8>> {
        let mut data = vec![0; len];
        self.mem
            .read_into(GuestAddr(td.buffer_pointers[0] as u64), &mut data)?;
        Ok(data)
    }

    /// Iterate the chain starting at `head` through to its terminator. The
    /// walk stops with [`QueueError::BudgetExceeded`] after
    /// [`TD_CHAIN_BUDGET`] entries.
    pub fn walk(&self, head: u32) -> ChainWalk<'_, 'a> {
        ChainWalk { view: self, next: Some(head), steps: 0 }
    }
}

/// One bounded traversal of a descriptor chain.
pub struct ChainWalk<'v, 'a> {
    view: &'v QueueView<'a>,
    next: Option<u32>,
    steps: usize,
}

impl Iterator for ChainWalk<'_, '_> {
    type Item = Result<(u32, TransferDescriptor)>;

    fn next(&mut self) -> Option<Self::Item> {
        let addr = self.next?;
        if self.steps >= TD_CHAIN_BUDGET {
            self.next = None;
            return Some(Err(QueueError::BudgetExceeded));
        }
        self.steps += 1;
        match self.view.td(addr) {
            Ok(td) => {
                self.next = if td.terminates_chain() {
                    None
                } else {
                    Some(td.next_pointer)
                };
                Some(Ok((addr, td)))
            }
            Err(e) => {
                self.next = None;
                Some(Err(e))
            }
        }
    }
}

/// Walks a descriptor chain one entry at a time, persisting position across
/// calls so back-to-back deliveries land on consecutive descriptors. Each
/// call visits exactly one descriptor, so the cursor places no limit on
/// chain length; the walk budget applies to single traversals only.
#[derive(Copy, Clone, Debug, Default)]
pub struct ChainCursor {
    next: Option<u32>,
}

impl ChainCursor {
    /// Read the descriptor the cursor points at, starting from `head` when
    /// the cursor is unset, and advance past it.
    pub fn step(
        &mut self,
        view: &QueueView<'_>,
        head: u32,
    ) -> Result<(u32, TransferDescriptor)> {
        let addr = self.next.unwrap_or(head);
        let td = view.td(addr)?;
        if td.terminates_chain() {
            self.clear();
        } else {
            self.next = Some(td.next_pointer);
        }
        Ok((addr, td))
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mem::GuestRam;

    use super::super::bits::{td_info, TD_NEXT_POINTER_TERMINATE};

    const LIST_BASE: u32 = 0x2000;
    const TD_BASE: u32 = 0x3000;

    fn seed_td(ram: &GuestRam, addr: u32, next: u32, bytes: u32, buf: u32) {
        let td = TransferDescriptor {
            next_pointer: next,
            info: bytes << td_info::TOTAL_BYTES_SHIFT,
            buffer_pointers: [buf, 0, 0, 0, 0],
        };
        ram.write_obj(GuestAddr(addr as u64), &td).unwrap();
    }

    #[test]
    fn cursor_follows_chain() {
        let ram = GuestRam::new(GuestAddr(0), 0x8000);
        let qh = QueueHead {
            td: TransferDescriptor {
                next_pointer: TD_BASE,
                ..Default::default()
            },
            ..Default::default()
        };
        ram.write_obj(GuestAddr(LIST_BASE as u64), &qh).unwrap();
        seed_td(&ram, TD_BASE, TD_BASE + 0x20, 64, 0x4000);
        seed_td(
            &ram,
            TD_BASE + 0x20,
            TD_NEXT_POINTER_TERMINATE,
            64,
            0x4100,
        );

        let view = QueueView::new(&ram, LIST_BASE);
        let head = view.queue_head(0).unwrap().td.next_pointer;
        let mut cursor = ChainCursor::default();

        let (addr0, td0) = cursor.step(&view, head).unwrap();
        assert_eq!(addr0, TD_BASE);
        assert_eq!(td0.buffer_pointers[0], 0x4000);

        // Second delivery continues the chain even if the caller passes the
        // original head again.
        let (addr1, td1) = cursor.step(&view, head).unwrap();
        assert_eq!(addr1, TD_BASE + 0x20);
        assert!(td1.terminates_chain());

        // The terminator cleared the cursor; the next step starts over.
        let (addr2, _) = cursor.step(&view, head).unwrap();
        assert_eq!(addr2, TD_BASE);
    }

    #[test]
    fn walk_budget_stops_cycles() {
        let ram = GuestRam::new(GuestAddr(0), 0x8000);
        // Two descriptors pointing at each other.
        seed_td(&ram, TD_BASE, TD_BASE + 0x20, 64, 0x4000);
        seed_td(&ram, TD_BASE + 0x20, TD_BASE, 64, 0x4100);

        let view = QueueView::new(&ram, LIST_BASE);
        let mut walk = view.walk(TD_BASE);
        for _ in 0..TD_CHAIN_BUDGET {
            walk.next().unwrap().unwrap();
        }
        assert!(matches!(
            walk.next(),
            Some(Err(QueueError::BudgetExceeded))
        ));
        assert!(walk.next().is_none());
    }

    #[test]
    fn walk_ends_at_terminator() {
        let ram = GuestRam::new(GuestAddr(0), 0x8000);
        seed_td(&ram, TD_BASE, TD_BASE + 0x20, 64, 0x4000);
        seed_td(
            &ram,
            TD_BASE + 0x20,
            TD_NEXT_POINTER_TERMINATE,
            64,
            0x4100,
        );

        let view = QueueView::new(&ram, LIST_BASE);
        let addrs: Vec<u32> = view
            .walk(TD_BASE)
            .map(|e| e.map(|(addr, _)| addr))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(addrs, vec![TD_BASE, TD_BASE + 0x20]);
    }

    #[test]
    fn cursor_spans_chains_of_any_length() {
        let ram = GuestRam::new(GuestAddr(0), 0x10000);
        // A linear chain twice the walk budget, consumed one delivery at
        // a time.
        let count = 2 * TD_CHAIN_BUDGET as u32;
        for i in 0..count {
            let addr = TD_BASE + i * 0x20;
            let next = if i == count - 1 {
                TD_NEXT_POINTER_TERMINATE
            } else {
                addr + 0x20
            };
            seed_td(&ram, addr, next, 64, 0x8000 + i * 0x40);
        }

        let view = QueueView::new(&ram, LIST_BASE);
        let mut cursor = ChainCursor::default();
        for i in 0..count {
            let (addr, _) = cursor.step(&view, TD_BASE).unwrap();
            assert_eq!(addr, TD_BASE + i * 0x20);
        }
        // The terminator reset the cursor for the next chain.
        let (addr, _) = cursor.step(&view, TD_BASE).unwrap();
        assert_eq!(addr, TD_BASE);
    }

    #[test]
    fn setup_lands_at_documented_offset() {
        let ram = GuestRam::new(GuestAddr(0), 0x8000);
        let view = QueueView::new(&ram, LIST_BASE);
        view.write_setup([0x02000680, 0x02000000]).unwrap();

        let mut raw = [0u8; 8];
        ram.read_into(
            GuestAddr((LIST_BASE as usize + QH_SETUP_OFFSET) as u64),
            &mut raw,
        )
        .unwrap();
        assert_eq!(raw, [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x00, 0x02]);
    }
}
