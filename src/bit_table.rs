//! Dense bit tables and the hierarchical (mip-mapped) variant used to
//! serialize active-tile positions.
//!
//! [`BitBlock`] keeps on/off state for up to N items as an array of 64-bit
//! blocks. [`BitPyramid`] stacks bit blocks so that level k+1's bit b is set
//! iff level k's block b is non-empty, and picks the cheapest of several
//! dump encodings when serializing. The pyramid dump mode occupies the low
//! nibble of the combined dump byte; see [`crate::active_tiles`].

use crate::wire::{varint_len_u32, Dequeue, Enqueue, WireError};

/// Serialization strategies for the tile-position side.
///
/// `Full` is never chosen by the encoder (`FullDelta` always wins) but the
/// ordinal is part of the wire format and the decoder accepts it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TileDumpMode {
    Skip = 0x0,
    Full = 0x1,
    FullDelta = 0x2,
    Table = 0x3,
    LeafTable = 0x4,
}

/// Low-nibble mask for the tile mode inside the combined dump byte.
pub const TILE_DUMPMODE_MASK: u8 = 0x0f;

impl TileDumpMode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & TILE_DUMPMODE_MASK {
            0x0 => Some(Self::Skip),
            0x1 => Some(Self::Full),
            0x2 => Some(Self::FullDelta),
            0x3 => Some(Self::Table),
            0x4 => Some(Self::LeafTable),
            _ => None,
        }
    }
}

/// On/off state for `total_items` items, stored 64 per block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitBlock {
    total_items: u32,
    blocks: Vec<u64>,
}

impl BitBlock {
    pub fn new(total_items: u32) -> Self {
        Self {
            total_items,
            blocks: vec![0; Self::block_count_for(total_items) as usize],
        }
    }

    pub fn block_count_for(total_items: u32) -> u32 {
        if total_items == 0 {
            0
        } else {
            (total_items - 1) / 64 + 1
        }
    }

    pub fn reset(&mut self) {
        self.blocks.fill(0);
    }

    pub fn set_on(&mut self, item_id: u32) {
        let block_id = (item_id / 64) as usize;
        if block_id < self.blocks.len() {
            self.blocks[block_id] |= 1u64 << (item_id % 64);
        }
    }

    pub fn set_off(&mut self, item_id: u32) {
        let block_id = (item_id / 64) as usize;
        if block_id < self.blocks.len() {
            self.blocks[block_id] &= !(1u64 << (item_id % 64));
        }
    }

    /// Out-of-range ids read as set; callers use that as the full-active
    /// sentinel.
    pub fn get(&self, item_id: u32) -> bool {
        let block_id = (item_id / 64) as usize;
        if block_id < self.blocks.len() {
            self.blocks[block_id] & (1u64 << (item_id % 64)) != 0
        } else {
            true
        }
    }

    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn block(&self, block_id: u32) -> u64 {
        self.blocks[block_id as usize]
    }

    pub fn set_block(&mut self, block_id: u32, mask: u64) {
        self.blocks[block_id as usize] = mask;
    }

    pub fn active_block_count(&self) -> u32 {
        self.blocks.iter().filter(|&&b| b != 0).count() as u32
    }

    /// Visit every set item id in ascending order.
    pub fn for_each_active(&self, mut f: impl FnMut(u32)) {
        for (block_id, &block) in self.blocks.iter().enumerate() {
            let mut cur = block;
            while cur != 0 {
                let shift = cur.trailing_zeros();
                f(block_id as u32 * 64 + shift);
                cur &= cur - 1;
            }
        }
    }
}

/// Hierarchical bit tables over `total_items` leaf items.
///
/// Level 0 is the leaf. Upper levels are derived by [`BitPyramid::finalize`];
/// only leaf mutators are public. With five levels this addresses every id a
/// `u32` can hold, far beyond any practical frame resolution.
#[derive(Clone, Debug)]
pub struct BitPyramid {
    total_items: u32,
    full_active: bool,
    levels: Vec<BitBlock>,
    data_size: usize,
}

impl BitPyramid {
    pub fn new(total_items: u32) -> Self {
        let mut levels = Vec::new();
        let mut items = total_items;
        loop {
            levels.push(BitBlock::new(items));
            let blocks = BitBlock::block_count_for(items);
            if blocks <= 1 {
                break;
            }
            items = blocks;
        }
        Self {
            total_items,
            full_active: false,
            levels,
            data_size: 0,
        }
    }

    pub fn reset(&mut self) {
        self.levels[0].reset();
    }

    pub fn set_on(&mut self, item_id: u32) {
        self.levels[0].set_on(item_id);
    }

    pub fn set_off(&mut self, item_id: u32) {
        self.levels[0].set_off(item_id);
    }

    pub fn total_items(&self) -> u32 {
        self.total_items
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, k: usize) -> &BitBlock {
        &self.levels[k]
    }

    pub fn full_active(&self) -> bool {
        self.full_active
    }

    /// Predicted serialized size of the mode chosen by the last
    /// [`BitPyramid::finalize`] call.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Visit every set leaf item in ascending order. Works without
    /// finalize().
    pub fn for_each_active_item(&self, f: impl FnMut(u32)) {
        self.levels[0].for_each_active(f);
    }

    /// Rebuild upper levels and pick the cheapest dump mode.
    ///
    /// Must be called before [`BitPyramid::enq_table`]. When every leaf
    /// block is non-zero the upper levels are left untouched (they are not
    /// serialized in that case) and `LeafTable` competes instead of `Table`.
    pub fn finalize(&mut self) -> TileDumpMode {
        let full_delta_size = self.size_full_delta();
        let table_size = self.size_table();

        // Full dump is always beaten by full-delta, so it never competes.
        if full_delta_size <= table_size {
            self.data_size = full_delta_size;
            return TileDumpMode::FullDelta;
        }

        self.data_size = table_size;
        if self.full_active {
            TileDumpMode::LeafTable
        } else {
            TileDumpMode::Table
        }
    }

    fn rebuild_levels(&mut self) -> bool {
        self.full_active =
            self.levels[0].active_block_count() == self.levels[0].block_count();
        if !self.full_active {
            for k in 1..self.levels.len() {
                let (lower, upper) = self.levels.split_at_mut(k);
                let prev = &lower[k - 1];
                let cur = &mut upper[0];
                cur.reset();
                for block_id in 0..prev.block_count() {
                    if prev.block(block_id) != 0 {
                        cur.set_on(block_id);
                    }
                }
            }
        }
        self.full_active
    }

    fn size_full_delta(&self) -> usize {
        let mut total = 0;
        let mut prev: Option<u32> = None;
        self.for_each_active_item(|id| {
            let delta = match prev {
                Some(p) if p < id => id - p,
                _ => id,
            };
            total += varint_len_u32(delta);
            prev = Some(id);
        });
        total
    }

    fn size_table(&mut self) -> usize {
        if self.rebuild_levels() {
            return self.levels[0].block_count() as usize * 8;
        }
        // Root block plus, per lower level, its non-empty blocks.
        let mut total = 8;
        for k in (0..self.levels.len() - 1).rev() {
            total += self.levels[k].active_block_count() as usize * 8;
        }
        total
    }

    /// Debug-only sizes of every candidate encoding (full, full-delta,
    /// table). Valid after finalize().
    pub fn size_info(&self) -> (usize, usize, usize) {
        let mut full = 0;
        self.for_each_active_item(|id| full += varint_len_u32(id));
        let delta = self.size_full_delta();
        let table = if self.full_active {
            self.levels[0].block_count() as usize * 8
        } else {
            let mut total = 8;
            for k in (0..self.levels.len() - 1).rev() {
                total += self.levels[k].active_block_count() as usize * 8;
            }
            total
        };
        (full, delta, table)
    }

    /// Every active leaf id as an absolute varint. Debug use only.
    pub fn enq_full(&self, enq: &mut Enqueue<'_>) {
        self.for_each_active_item(|id| enq.put_var_u32(id));
    }

    pub fn deq_full(
        &mut self,
        deq: &mut Dequeue<'_>,
        active_total: u32,
    ) -> Result<(), WireError> {
        for _ in 0..active_total {
            let id = deq.take_var_u32()?;
            self.set_on(id);
        }
        Ok(())
    }

    /// Active leaf ids as varint deltas; the first item is absolute.
    pub fn enq_full_delta(&self, enq: &mut Enqueue<'_>) {
        let mut prev: Option<u32> = None;
        self.for_each_active_item(|id| {
            let delta = match prev {
                Some(p) if p < id => id - p,
                _ => id,
            };
            enq.put_var_u32(delta);
            prev = Some(id);
        });
    }

    pub fn deq_full_delta(
        &mut self,
        deq: &mut Dequeue<'_>,
        active_total: u32,
    ) -> Result<(), WireError> {
        let mut prev = 0u32;
        for i in 0..active_total {
            let delta = deq.take_var_u32()?;
            let id = if i == 0 { delta } else { prev + delta };
            self.set_on(id);
            prev = id;
        }
        Ok(())
    }

    /// Table dump. With a full-active leaf only the leaf blocks are
    /// emitted; otherwise the root block is followed by each lower level's
    /// non-empty blocks, top-down, ascending within each level.
    pub fn enq_table(&self, enq: &mut Enqueue<'_>) {
        if self.full_active {
            let leaf = &self.levels[0];
            for block_id in 0..leaf.block_count() {
                enq.put_mask64(leaf.block(block_id));
            }
            return;
        }

        let top = self.levels.len() - 1;
        enq.put_mask64(self.levels[top].block(0));
        for k in (0..top).rev() {
            // Blocks of level k to emit are named by the set bits of level
            // k+1.
            let upper = &self.levels[k + 1];
            let cur = &self.levels[k];
            upper.for_each_active(|block_id| {
                enq.put_mask64(cur.block(block_id));
            });
        }
    }

    pub fn deq_table(
        &mut self,
        deq: &mut Dequeue<'_>,
        full_active: bool,
    ) -> Result<(), WireError> {
        self.full_active = full_active;

        if full_active {
            for block_id in 0..self.levels[0].block_count() {
                let mask = deq.take_mask64()?;
                self.levels[0].set_block(block_id, mask);
            }
            return Ok(());
        }

        let top = self.levels.len() - 1;
        let root = deq.take_mask64()?;
        self.levels[top].set_block(0, root);
        for k in (0..top).rev() {
            let mut block_ids = Vec::new();
            self.levels[k + 1].for_each_active(|block_id| block_ids.push(block_id));
            for block_id in block_ids {
                let mask = deq.take_mask64()?;
                self.levels[k].set_block(block_id, mask);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_block_basics() {
        let mut b = BitBlock::new(130);
        assert_eq!(b.block_count(), 3);
        b.set_on(0);
        b.set_on(64);
        b.set_on(129);
        assert!(b.get(0) && b.get(64) && b.get(129));
        assert!(!b.get(1));
        assert!(b.get(500)); // out of range reads as set
        assert_eq!(b.active_block_count(), 3);
        b.set_off(64);
        assert_eq!(b.active_block_count(), 2);

        let mut seen = Vec::new();
        b.for_each_active(|id| seen.push(id));
        assert_eq!(seen, [0, 129]);
    }

    #[test]
    fn pyramid_level_shape() {
        assert_eq!(BitPyramid::new(64).level_count(), 1);
        assert_eq!(BitPyramid::new(65).level_count(), 2);
        assert_eq!(BitPyramid::new(4096).level_count(), 2);
        assert_eq!(BitPyramid::new(4097).level_count(), 3);
    }

    #[test]
    fn rebuild_upper_levels_track_leaf_blocks() {
        let mut p = BitPyramid::new(4096);
        p.set_on(0);
        p.set_on(70);
        p.set_on(4095);
        p.finalize();
        assert!(!p.full_active());
        for k in 0..p.level_count() - 1 {
            let lower = p.level(k);
            let upper = p.level(k + 1);
            for b in 0..lower.block_count() {
                assert_eq!(
                    upper.get(b),
                    lower.block(b) != 0,
                    "level {} block {}",
                    k + 1,
                    b
                );
            }
        }
    }

    #[test]
    fn mode_choice_sparse_prefers_full_delta() {
        let mut p = BitPyramid::new(4096);
        for i in 0..8 {
            p.set_on(i * 64);
        }
        // 8 one-byte deltas vs a root block plus 8 leaf blocks.
        assert_eq!(p.finalize(), TileDumpMode::FullDelta);
        assert_eq!(p.data_size(), 8);
    }

    #[test]
    fn mode_choice_clustered_prefers_table() {
        let mut p = BitPyramid::new(4096);
        for i in 0..128 {
            p.set_on(i);
        }
        // 128 delta bytes vs 8 (root) + 16 (two leaf blocks).
        assert_eq!(p.finalize(), TileDumpMode::Table);
        assert_eq!(p.data_size(), 24);
    }

    #[test]
    fn mode_choice_dense_prefers_leaf_table() {
        let mut p = BitPyramid::new(4096);
        for i in 0..4096 {
            p.set_on(i);
        }
        assert_eq!(p.finalize(), TileDumpMode::LeafTable);
        assert_eq!(p.data_size(), 64 * 8);
    }

    fn active_ids(p: &BitPyramid) -> Vec<u32> {
        let mut ids = Vec::new();
        p.for_each_active_item(|id| ids.push(id));
        ids
    }

    #[test]
    fn full_delta_round_trip() {
        let mut src = BitPyramid::new(1000);
        for id in [0u32, 1, 63, 64, 512, 999] {
            src.set_on(id);
        }
        let mut buf = Vec::new();
        src.enq_full_delta(&mut Enqueue::new(&mut buf));

        let mut dst = BitPyramid::new(1000);
        dst.deq_full_delta(&mut Dequeue::new(&buf), 6).unwrap();
        assert_eq!(active_ids(&src), active_ids(&dst));
    }

    #[test]
    fn table_round_trip() {
        let mut src = BitPyramid::new(4096 * 3);
        for id in [0u32, 100, 3000, 8191, 12287] {
            src.set_on(id);
        }
        let mode = src.finalize();
        assert_eq!(mode, TileDumpMode::FullDelta); // sparse; force table below

        let mut buf = Vec::new();
        src.enq_table(&mut Enqueue::new(&mut buf));
        assert_eq!(buf.len(), {
            let (_, _, table) = src.size_info();
            table
        });

        let mut dst = BitPyramid::new(4096 * 3);
        dst.deq_table(&mut Dequeue::new(&buf), false).unwrap();
        assert_eq!(active_ids(&src), active_ids(&dst));
    }

    #[test]
    fn leaf_table_round_trip() {
        let mut src = BitPyramid::new(256);
        for id in 0..256 {
            src.set_on(id);
        }
        assert_eq!(src.finalize(), TileDumpMode::LeafTable);

        let mut buf = Vec::new();
        src.enq_table(&mut Enqueue::new(&mut buf));
        assert_eq!(buf.len(), 4 * 8);

        let mut dst = BitPyramid::new(256);
        dst.deq_table(&mut Dequeue::new(&buf), true).unwrap();
        assert_eq!(active_ids(&src), active_ids(&dst));
    }

    #[test]
    fn full_dump_round_trip() {
        let mut src = BitPyramid::new(100);
        for id in [3u32, 50, 99] {
            src.set_on(id);
        }
        let mut buf = Vec::new();
        src.enq_full(&mut Enqueue::new(&mut buf));
        let mut dst = BitPyramid::new(100);
        dst.deq_full(&mut Dequeue::new(&buf), 3).unwrap();
        assert_eq!(active_ids(&src), active_ids(&dst));
    }

    #[test]
    fn single_level_table_round_trip() {
        let mut src = BitPyramid::new(40);
        src.set_on(5);
        src.set_on(38);
        src.finalize();
        let mut buf = Vec::new();
        src.enq_table(&mut Enqueue::new(&mut buf));
        assert_eq!(buf.len(), 8);
        let mut dst = BitPyramid::new(40);
        dst.deq_table(&mut Dequeue::new(&buf), false).unwrap();
        assert_eq!(active_ids(&src), active_ids(&dst));
    }
}
