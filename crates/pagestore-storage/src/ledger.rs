//! Window ledger for one circular backing file
//!
//! The file is described as an ordered run of regions covering
//! `[0, total_size)` with no gaps. Each region is either free or holds the
//! bytes of one item. New items are always written at the write cursor,
//! which moves one region forward per write and wraps to the first region
//! once the file has reached its size cap, overwriting the oldest data.
//!
//! ```text
//!   offset 0                                              total_size
//!   | 1.0.0 | free | 4.0.0 | 2.1.0 |      3.0.0      | free |
//!                            ^ cursor (next write lands after it,
//!                              or at region 0 once the cap is hit)
//! ```
//!
//! Lookups go through a secondary index from item id to region positions.
//! Splitting or merging regions shifts positions, so those edits drop the
//! index and it is rebuilt on the next lookup.

use pagestore_common::{ItemKey, ItemQuery};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// One contiguous byte range of the backing file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Item whose bytes live here, `None` when the region is free
    pub occupant: Option<ItemKey>,
    /// Offset of the first byte in the file
    pub offset: u64,
    /// Length in bytes
    pub size: u64,
}

impl Region {
    /// Offset one past the last byte
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Location of a stored item
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    /// Item held by the window
    pub key: ItemKey,
    /// Byte offset of the window in the backing file
    pub offset: u64,
    /// Length of the item in bytes
    pub size: u64,
}

type PositionIndex = HashMap<i32, BTreeSet<usize>>;

/// Allocation state of one backing file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WindowLedger {
    regions: Vec<Region>,
    /// Item id to region positions, `None` when stale
    #[serde(skip)]
    index: Option<PositionIndex>,
    /// Position of the most recent write, `None` while empty
    cursor: Option<usize>,
    total_size: u64,
    /// Size cap; 0 disables wrapping
    max_size: u64,
}

impl WindowLedger {
    /// Create an empty ledger wrapping once the file reaches `max_size` bytes
    #[must_use]
    pub const fn new(max_size: u64) -> Self {
        Self {
            regions: Vec::new(),
            index: None,
            cursor: None,
            total_size: 0,
            max_size,
        }
    }

    /// Sum of all region sizes, equal to the file extent in use
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Configured size cap
    #[must_use]
    pub const fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Position of the last write
    #[must_use]
    pub const fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// File layout, left to right
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Reserve a window for `key` holding `size` bytes.
    ///
    /// An earlier window with the same exact key is invalidated. It is reused
    /// in place only if it sits at the cursor; otherwise the cursor advances
    /// and the new bytes land there.
    pub fn allocate(&mut self, key: ItemKey, size: u64) -> Window {
        let existing = self.position_of(&ItemQuery::exact(key));
        if let Some(pos) = existing {
            self.vacate(pos);
        }

        let pos = match existing {
            Some(pos) if Some(pos) == self.cursor => pos,
            _ => self.advance_cursor(size),
        };

        self.reserve(pos, size);
        self.occupy(pos, key);

        let region = self.regions[pos];
        Window {
            key,
            offset: region.offset,
            size: region.size,
        }
    }

    /// Find the window matching `query`
    pub fn lookup(&mut self, query: &ItemQuery) -> Option<Window> {
        let pos = self.position_of(query)?;
        let region = self.regions[pos];
        region.occupant.map(|key| Window {
            key,
            offset: region.offset,
            size: region.size,
        })
    }

    /// Check if a window matches `query`
    pub fn contains(&mut self, query: &ItemQuery) -> bool {
        self.position_of(query).is_some()
    }

    /// Remove the window matching `query`.
    ///
    /// The last region is dropped from the file; any other region only
    /// becomes free and is reclaimed by later allocations.
    pub fn remove(&mut self, query: &ItemQuery) -> Option<Window> {
        let pos = self.position_of(query)?;
        self.remove_at(pos)
    }

    /// Remove every window of `id`, whatever its version. Returns the count.
    pub fn remove_all(&mut self, id: i32) -> usize {
        self.ensure_index();
        let positions: Vec<usize> = self
            .index
            .as_ref()
            .and_then(|index| index.get(&id))
            .map(|set| set.iter().rev().copied().collect())
            .unwrap_or_default();

        positions
            .into_iter()
            .filter_map(|pos| self.remove_at(pos))
            .count()
    }

    /// Up to `count` occupied windows, most recent first.
    ///
    /// Walks backwards from the cursor and wraps once to the end of the file.
    #[must_use]
    pub fn recent_windows(&self, count: usize) -> Vec<Window> {
        let mut result = Vec::new();
        let Some(start) = self.cursor else {
            return result;
        };
        if count == 0 || self.regions.is_empty() {
            return result;
        }

        let last = self.regions.len() - 1;
        let mut pos = start.min(last);
        loop {
            let region = self.regions[pos];
            if let Some(key) = region.occupant {
                result.push(Window {
                    key,
                    offset: region.offset,
                    size: region.size,
                });
            }

            pos = if pos == 0 { last } else { pos - 1 };
            if result.len() >= count || pos == start {
                break;
            }
        }
        result
    }

    /// Pick the position of the next write
    fn advance_cursor(&mut self, size: u64) -> usize {
        let at_last = self.cursor == self.regions.len().checked_sub(1);
        let wrap = self.max_size > 0 && at_last && self.total_size + size > self.max_size;

        let next = match self.cursor {
            Some(pos) if !wrap => pos + 1,
            _ => 0,
        };
        self.cursor = Some(next);
        next
    }

    /// Make the region at `pos` exactly `size` bytes, appending if `pos` is one past the end
    fn reserve(&mut self, pos: usize, size: u64) {
        if pos == self.regions.len() {
            self.regions.push(Region {
                occupant: None,
                offset: self.total_size,
                size,
            });
            self.total_size += size;
        } else if self.regions[pos].size != size {
            self.resize(pos, size);
        }
    }

    fn resize(&mut self, pos: usize, size: u64) {
        if pos == self.regions.len() - 1 {
            self.set_last_size(size);
            return;
        }

        while self.regions[pos].size < size && pos < self.regions.len() - 1 {
            self.merge_with_next(pos);
        }

        if self.regions[pos].size < size {
            // Swallowed every following region and still short; grow the file
            self.set_last_size(size);
        } else {
            self.split(pos, size);
        }
    }

    /// Shrink `pos` to `size`, handing the remainder to a new free region after it
    fn split(&mut self, pos: usize, size: u64) {
        let region = self.regions[pos];
        if pos == self.regions.len() - 1 {
            self.set_last_size(size);
        } else if region.size != size {
            self.regions[pos].size = size;
            self.regions.insert(
                pos + 1,
                Region {
                    occupant: None,
                    offset: region.offset + size,
                    size: region.size - size,
                },
            );
            self.index = None;
        }
    }

    fn merge_with_next(&mut self, pos: usize) {
        let next = self.regions.remove(pos + 1);
        self.regions[pos].size += next.size;
        self.index = None;
    }

    fn set_last_size(&mut self, size: u64) {
        if let Some(last) = self.regions.last_mut() {
            self.total_size = self.total_size - last.size + size;
            last.size = size;
        }
    }

    fn remove_at(&mut self, pos: usize) -> Option<Window> {
        let region = self.regions[pos];
        let key = region.occupant?;
        self.vacate(pos);

        if pos == self.regions.len() - 1 {
            self.regions.pop();
            self.total_size -= region.size;
            if self.cursor == Some(pos) {
                self.cursor = pos.checked_sub(1);
            }
        }

        Some(Window {
            key,
            offset: region.offset,
            size: region.size,
        })
    }

    /// Mark the region free and drop it from the index
    fn vacate(&mut self, pos: usize) {
        if let Some(old) = self.regions[pos].occupant.take() {
            self.unindex(old.id, pos);
        }
    }

    /// Tag the region with `key`, displacing whatever item it held
    fn occupy(&mut self, pos: usize, key: ItemKey) {
        if let Some(old) = self.regions[pos].occupant.replace(key) {
            self.unindex(old.id, pos);
        }
        if let Some(index) = self.index.as_mut() {
            index.entry(key.id).or_default().insert(pos);
        }
    }

    fn unindex(&mut self, id: i32, pos: usize) {
        if let Some(index) = self.index.as_mut()
            && let Some(set) = index.get_mut(&id)
        {
            set.remove(&pos);
            if set.is_empty() {
                index.remove(&id);
            }
        }
    }

    fn ensure_index(&mut self) {
        if self.index.is_some() {
            return;
        }
        let mut index = PositionIndex::new();
        for (pos, region) in self.regions.iter().enumerate() {
            if let Some(key) = region.occupant {
                index.entry(key.id).or_default().insert(pos);
            }
        }
        self.index = Some(index);
    }

    fn position_of(&mut self, query: &ItemQuery) -> Option<usize> {
        self.ensure_index();
        let positions = self.index.as_ref()?.get(&query.id)?;
        let occupant = |pos: usize| self.regions[pos].occupant;

        if let Some(wanted) = query.as_exact() {
            return positions
                .iter()
                .copied()
                .find(|&pos| occupant(pos) == Some(wanted));
        }

        match query.version {
            Some(version) => positions
                .iter()
                .copied()
                .filter_map(|pos| occupant(pos).map(|key| (pos, key)))
                .filter(|(_, key)| key.version == version)
                .max_by_key(|(_, key)| key.sub_version)
                .map(|(pos, _)| pos),
            None => {
                // Nearest at or before the cursor, wrapping; the slot just
                // after the cursor is the oldest and loses every comparison.
                let len = self.regions.len();
                let cursor = self.cursor.unwrap_or(len - 1);
                positions
                    .iter()
                    .copied()
                    .min_by_key(|&pos| (cursor + len - pos) % len)
            }
        }
    }
}
