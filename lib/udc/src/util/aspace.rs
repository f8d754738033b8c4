// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::btree_map::BTreeMap;

use thiserror::Error;

/// Mapping of non-overlapping regions within an address space.
#[derive(Debug)]
pub struct ASpace<T> {
    start: usize,
    end: usize,
    map: BTreeMap<usize, (usize, T)>,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("region outside address space bounds")]
    OutOfRange,
    #[error("zero-length region")]
    ZeroLength,
    #[error("region overlaps with existing registration")]
    Conflict,
}

pub type Result<T> = std::result::Result<T, Error>;

impl<T> ASpace<T> {
    /// Create a new instance with inclusive range `[start, end]`.
    pub fn new(start: usize, end: usize) -> ASpace<T> {
        assert!(start < end);
        Self { start, end, map: BTreeMap::new() }
    }

    /// Register a region of length `len` at `start`.
    pub fn register(&mut self, start: usize, len: usize, item: T) -> Result<()> {
        if len == 0 {
            return Err(Error::ZeroLength);
        }
        let last = start.checked_add(len - 1).ok_or(Error::OutOfRange)?;
        if start < self.start || last > self.end {
            return Err(Error::OutOfRange);
        }
        // Check for conflicts with the preceding and following regions
        if let Some((&prev_start, (prev_len, _))) =
            self.map.range(..=start).next_back()
        {
            if prev_start + prev_len > start {
                return Err(Error::Conflict);
            }
        }
        if self.map.range(start..=last).next().is_some() {
            return Err(Error::Conflict);
        }

        self.map.insert(start, (len, item));
        Ok(())
    }

    /// Iterate registrations overlapping the inclusive range `[first, last]`,
    /// yielding `(start, len, &item)` in ascending order.
    pub fn covered_by(
        &self,
        first: usize,
        last: usize,
    ) -> impl Iterator<Item = (usize, usize, &T)> {
        assert!(first <= last);
        // A region starting before `first` may still extend into the range.
        let begin = match self.map.range(..=first).next_back() {
            Some((&start, &(len, _))) if start + len > first => start,
            _ => first,
        };
        self.map
            .range(begin..=last)
            .map(|(&start, entry)| (start, entry.0, &entry.1))
    }
}
