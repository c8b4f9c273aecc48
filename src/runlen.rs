//! Run-length encoder for arrays of per-tile pixel masks.
//!
//! Every active tile contributes one 64-bit mask. A mask can be stored two
//! ways: as the raw 8-byte value (MASK form) or as a count byte followed by
//! one byte per set pixel position (ID form, cheaper below 7 set bits).
//! Rather than tagging each mask with its form, the table is partitioned
//! into runs of uniform form, each introduced by a control byte carrying the
//! form bit and the run length. The run length here counts consecutive masks
//! of the same *form*, not repeated mask patterns.

use crate::wire::{Dequeue, Enqueue, WireError};

/// Serialization strategies for the pixel-mask side. Occupies the high
/// nibble of the combined dump byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MaskDumpMode {
    Skip = 0x00,
    AllMask = 0x10,
    AllId = 0x20,
    RunLen = 0x30,
}

/// High-nibble mask for the pixel-mask mode inside the combined dump byte.
pub const MASK_DUMPMODE_MASK: u8 = 0xf0;

impl MaskDumpMode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & MASK_DUMPMODE_MASK {
            0x00 => Some(Self::Skip),
            0x10 => Some(Self::AllMask),
            0x20 => Some(Self::AllId),
            0x30 => Some(Self::RunLen),
            _ => None,
        }
    }
}

// An ID-form mask of exactly THRESH set bits costs the same 8 bytes as the
// MASK form; the tie is resolved by whichever side the next run-switching
// item is on.
const THRESH_ACTIVE_PIX: u8 = 7;
const MAX_RUNLEN: u32 = 128;

const MODE_MASK: u8 = 0x00;
const MODE_ID: u8 = 0x80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunLenMasks {
    popcount: Vec<u8>,
    masks: Vec<u64>,
    data_size: usize,
}

impl RunLenMasks {
    pub fn new(total_items: u32) -> Self {
        Self {
            popcount: vec![0; total_items as usize],
            masks: vec![0; total_items as usize],
            data_size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn set(&mut self, item_id: u32, mask: u64) {
        self.masks[item_id as usize] = mask;
    }

    pub fn get(&self, item_id: u32) -> u64 {
        self.masks[item_id as usize]
    }

    /// Encoded size of the mode picked by the last [`RunLenMasks::finalize`].
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Fill the popcount table and pick the cheapest dump mode.
    ///
    /// Run-length is chosen only when strictly smaller than both flat
    /// modes; a tied run-length falls back to the better flat mode.
    pub fn finalize(&mut self) -> MaskDumpMode {
        if self.masks.is_empty() {
            self.data_size = 0;
            return MaskDumpMode::Skip;
        }

        let mut all_mask = 0usize;
        let mut all_id = 0usize;
        for (i, &mask) in self.masks.iter().enumerate() {
            let pc = mask.count_ones() as u8;
            self.popcount[i] = pc;
            all_mask += 8;
            all_id += 1 + pc as usize;
        }
        let flat_limit = all_mask.min(all_id);

        let mut run_len_size = 0usize;
        let mut cur_mode = self.initial_mode(0);
        let mut start = 0u32;
        loop {
            let (end, next_mode) = self.find_run_end(start, cur_mode);
            run_len_size += 1; // run control byte
            if cur_mode == MODE_MASK {
                run_len_size += (end - start + 1) as usize * 8;
            } else {
                for id in start..=end {
                    run_len_size += 1 + self.popcount[id as usize] as usize;
                }
            }
            if run_len_size >= flat_limit {
                break; // a flat mode already wins
            }
            cur_mode = next_mode;
            start = end + 1;
            if start as usize >= self.masks.len() {
                break;
            }
        }

        let mode = if run_len_size < flat_limit {
            MaskDumpMode::RunLen
        } else if all_mask < all_id {
            MaskDumpMode::AllMask
        } else {
            MaskDumpMode::AllId
        };

        self.data_size = match mode {
            MaskDumpMode::AllMask => all_mask,
            MaskDumpMode::AllId => all_id,
            MaskDumpMode::RunLen => run_len_size,
            MaskDumpMode::Skip => 0,
        };
        mode
    }

    pub fn enq_all_mask(&self, enq: &mut Enqueue<'_>) {
        for &mask in &self.masks {
            enq.put_mask64(mask);
        }
    }

    pub fn deq_all_mask(&mut self, deq: &mut Dequeue<'_>) -> Result<(), WireError> {
        for mask in &mut self.masks {
            *mask = deq.take_mask64()?;
        }
        Ok(())
    }

    pub fn enq_all_id(&self, enq: &mut Enqueue<'_>) {
        for id in 0..self.masks.len() as u32 {
            self.enq_mask_by_id(id, enq);
        }
    }

    pub fn deq_all_id(&mut self, deq: &mut Dequeue<'_>) -> Result<(), WireError> {
        for id in 0..self.masks.len() as u32 {
            self.deq_mask_by_id(id, deq)?;
        }
        Ok(())
    }

    /// Requires finalize() (popcounts drive the run partition).
    pub fn enq_runlen(&self, enq: &mut Enqueue<'_>) {
        let mut cur_mode = self.initial_mode(0);
        let mut start = 0u32;
        loop {
            let (end, next_mode) = self.find_run_end(start, cur_mode);
            self.enq_run_chunk(cur_mode, start, end, enq);
            cur_mode = next_mode;
            start = end + 1;
            if start as usize >= self.masks.len() {
                break;
            }
        }
    }

    pub fn deq_runlen(&mut self, deq: &mut Dequeue<'_>) -> Result<(), WireError> {
        let mut start = 0u32;
        while (start as usize) < self.masks.len() {
            start = self.deq_run_chunk(start, deq)?;
        }
        Ok(())
    }

    /// Procedural test pattern: each mask gets a popcount drawn from
    /// [min_active, max_active]. Debug/test use.
    pub fn random_masks(&mut self, min_active: u32, max_active: u32, rng: &mut impl rand::Rng) {
        for mask in &mut self.masks {
            let target = rng.gen_range(min_active..=max_active).min(64);
            let mut m = 0u64;
            while m.count_ones() < target {
                m |= 1u64 << rng.gen_range(0..64);
            }
            *mask = m;
        }
    }

    // ------------------------------------------------------------------

    // Form preference of the run starting at `start`. A popcount exactly at
    // the threshold is cost-neutral, so the first following off-threshold
    // item decides; MASK when the tail is all threshold.
    fn initial_mode(&self, start: u32) -> u8 {
        let pc = self.popcount[start as usize];
        if pc < THRESH_ACTIVE_PIX {
            return MODE_ID;
        }
        if pc > THRESH_ACTIVE_PIX {
            return MODE_MASK;
        }
        for id in start as usize + 1..self.popcount.len() {
            let next = self.popcount[id];
            if next != THRESH_ACTIVE_PIX {
                return if next < THRESH_ACTIVE_PIX { MODE_ID } else { MODE_MASK };
            }
        }
        MODE_MASK
    }

    // Last index of the run starting at `start` in `cur_mode`, and the mode
    // of the following run. Runs cap at MAX_RUNLEN items.
    fn find_run_end(&self, start: u32, cur_mode: u8) -> (u32, u8) {
        let mut end = start;
        let max_id = (self.masks.len() as u32 - 1).min(start + MAX_RUNLEN - 1);

        for id in start + 1..=max_id {
            let pc = self.popcount[id as usize];
            if cur_mode == MODE_MASK {
                if pc < THRESH_ACTIVE_PIX {
                    return (end, MODE_ID);
                }
            } else if pc > THRESH_ACTIVE_PIX {
                return (end, MODE_MASK);
            }
            end = id;
        }

        let next_mode = if ((end + 1) as usize) < self.masks.len() {
            self.initial_mode(end + 1)
        } else {
            cur_mode
        };
        (end, next_mode)
    }

    fn enq_run_chunk(&self, mode: u8, start: u32, end: u32, enq: &mut Enqueue<'_>) {
        let run = end - start + 1;
        debug_assert!(run >= 1 && run <= MAX_RUNLEN);
        enq.put_u8(mode | ((run - 1) as u8 & 0x7f));

        if mode == MODE_MASK {
            for id in start..=end {
                enq.put_mask64(self.masks[id as usize]);
            }
        } else {
            for id in start..=end {
                self.enq_mask_by_id(id, enq);
            }
        }
    }

    fn deq_run_chunk(&mut self, start: u32, deq: &mut Dequeue<'_>) -> Result<u32, WireError> {
        let ctrl = deq.take_u8()?;
        let mode = ctrl & !0x7f;
        let run = (ctrl & 0x7f) as u32 + 1;
        let end = start + run - 1;
        if end as usize >= self.masks.len() {
            // A corrupt control byte runs off the mask table.
            return Err(WireError::Overrun {
                at: deq.position(),
                wanted: run as usize,
                len: self.masks.len(),
            });
        }

        if mode == MODE_MASK {
            for id in start..=end {
                self.masks[id as usize] = deq.take_mask64()?;
            }
        } else {
            for id in start..=end {
                self.deq_mask_by_id(id, deq)?;
            }
        }
        Ok(end + 1)
    }

    fn enq_mask_by_id(&self, id: u32, enq: &mut Enqueue<'_>) {
        let mask = self.masks[id as usize];
        enq.put_u8(mask.count_ones() as u8);
        let mut cur = mask;
        while cur != 0 {
            let shift = cur.trailing_zeros();
            enq.put_u8(shift as u8);
            cur &= cur - 1;
        }
    }

    fn deq_mask_by_id(&mut self, id: u32, deq: &mut Dequeue<'_>) -> Result<(), WireError> {
        let count = deq.take_u8()?;
        self.popcount[id as usize] = count;
        let mut mask = 0u64;
        for _ in 0..count {
            let shift = deq.take_u8()?;
            mask |= 1u64 << (shift & 63);
        }
        self.masks[id as usize] = mask;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn table(masks: &[u64]) -> RunLenMasks {
        let mut t = RunLenMasks::new(masks.len() as u32);
        for (i, &m) in masks.iter().enumerate() {
            t.set(i as u32, m);
        }
        t
    }

    fn dense(pc: u32) -> u64 {
        if pc >= 64 {
            u64::MAX
        } else {
            (1u64 << pc) - 1
        }
    }

    fn round_trip(src: &mut RunLenMasks) {
        let mode = src.finalize();
        let mut buf = Vec::new();
        {
            let mut enq = Enqueue::new(&mut buf);
            match mode {
                MaskDumpMode::AllMask => src.enq_all_mask(&mut enq),
                MaskDumpMode::AllId => src.enq_all_id(&mut enq),
                MaskDumpMode::RunLen => src.enq_runlen(&mut enq),
                MaskDumpMode::Skip => {}
            }
        }
        assert_eq!(buf.len(), src.data_size(), "predicted size");

        let mut dst = RunLenMasks::new(src.len() as u32);
        let mut deq = Dequeue::new(&buf);
        match mode {
            MaskDumpMode::AllMask => dst.deq_all_mask(&mut deq).unwrap(),
            MaskDumpMode::AllId => dst.deq_all_id(&mut deq).unwrap(),
            MaskDumpMode::RunLen => dst.deq_runlen(&mut deq).unwrap(),
            MaskDumpMode::Skip => {}
        }
        assert_eq!(deq.remaining(), 0);
        assert_eq!(src.masks, dst.masks);
    }

    #[test]
    fn dense_table_picks_all_mask() {
        let mut t = table(&[dense(60); 8]);
        assert_eq!(t.finalize(), MaskDumpMode::AllMask);
        assert_eq!(t.data_size(), 64);
        round_trip(&mut t);
    }

    #[test]
    fn sparse_table_picks_all_id() {
        let mut t = table(&[0b11; 8]);
        assert_eq!(t.finalize(), MaskDumpMode::AllId);
        assert_eq!(t.data_size(), 8 * 3);
        round_trip(&mut t);
    }

    #[test]
    fn mixed_table_picks_runlen() {
        let mut masks = vec![u64::MAX; 5];
        masks.extend_from_slice(&[1u64; 5]);
        let mut t = table(&masks);
        assert_eq!(t.finalize(), MaskDumpMode::RunLen);
        // Two chunks: ctrl + 5 raw masks, ctrl + 5 * (count + one id).
        assert_eq!(t.data_size(), 1 + 40 + 1 + 10);
        round_trip(&mut t);
    }

    #[test]
    fn threshold_items_join_their_neighbor_side() {
        // popcount 7 costs the same either way; the next off-threshold item
        // decides the run form.
        let mut t2 = table(&[dense(7), dense(2)]);
        t2.finalize();
        assert_eq!(t2.initial_mode(0), MODE_ID);

        let mut t3 = table(&[dense(7), dense(9)]);
        t3.finalize();
        assert_eq!(t3.initial_mode(0), MODE_MASK);

        // All-threshold table defaults to MASK form.
        let mut t4 = table(&[dense(7); 4]);
        t4.finalize();
        assert_eq!(t4.initial_mode(0), MODE_MASK);
    }

    #[test]
    fn runs_cap_at_128_items() {
        // 130 dense masks then 130 sparse ones: the dense stretch needs two
        // chunks, the sparse one as well.
        let mut masks = vec![u64::MAX; 130];
        masks.extend(std::iter::repeat(1u64).take(130));
        let mut t = table(&masks);
        let mode = t.finalize();
        assert_eq!(mode, MaskDumpMode::RunLen);
        assert_eq!(t.data_size(), (1 + 128 * 8) + (1 + 2 * 8) + (1 + 128 * 2) + (1 + 2 * 2));
        round_trip(&mut t);
    }

    #[test]
    fn random_tables_round_trip() {
        let mut rng = StdRng::seed_from_u64(0x9e3779b9);
        for total in [1u32, 7, 64, 200] {
            for (lo, hi) in [(0u32, 3), (5, 9), (30, 64), (0, 64)] {
                let mut t = RunLenMasks::new(total);
                t.random_masks(lo, hi, &mut rng);
                round_trip(&mut t);
            }
        }
    }
}
