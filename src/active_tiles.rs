//! Combined codec for active tile positions and per-tile pixel masks.
//!
//! One header byte carries both sub-codec choices: the tile-position mode
//! ([`TileDumpMode`]) in the low nibble and the pixel-mask mode
//! ([`MaskDumpMode`]) in the high nibble. The tile-position block follows,
//! then the mask block. Two degenerate cases shrink the output: an empty
//! frame is the single all-skip byte, and full tile coverage skips the
//! tile-position block entirely (the decoder infers every tile).

use crate::active_pixels::ActivePixels;
use crate::bit_table::{BitPyramid, TileDumpMode};
use crate::pack_tiles::CodecError;
use crate::runlen::{MaskDumpMode, RunLenMasks};
use crate::wire::{Dequeue, Enqueue};

/// Combined byte meaning "no tiles, no masks".
pub const ALL_SKIP: u8 = MaskDumpMode::Skip as u8 | TileDumpMode::Skip as u8;

#[inline]
fn combine(tile: TileDumpMode, mask: MaskDumpMode) -> u8 {
    mask as u8 | tile as u8
}

fn split(byte: u8) -> Result<(TileDumpMode, MaskDumpMode), CodecError> {
    let tile = TileDumpMode::from_byte(byte)
        .ok_or_else(|| CodecError::malformed(format!("bad tile dump mode {byte:#04x}")))?;
    let mask = MaskDumpMode::from_byte(byte)
        .ok_or_else(|| CodecError::malformed(format!("bad mask dump mode {byte:#04x}")))?;
    Ok((tile, mask))
}

/// Encode the tile-mask block of `active_pixels` and return the combined
/// dump byte (already written to the stream).
pub fn enq_tile_mask_block(active_pixels: &ActivePixels, enq: &mut Enqueue<'_>) -> u8 {
    let num_tiles = active_pixels.num_tiles();
    let num_active = active_pixels.active_tile_count();

    if num_active == 0 {
        enq.put_u8(ALL_SKIP);
        return ALL_SKIP;
    }

    if num_active == num_tiles {
        // Full coverage: the tile-position block is implied, only the mask
        // payload is emitted (one mask per tile, row-major).
        let mut mask_info = RunLenMasks::new(num_tiles);
        for tile_id in 0..num_tiles {
            mask_info.set(tile_id, active_pixels.tile_mask(tile_id));
        }
        let mask_mode = mask_info.finalize();
        let dump = combine(TileDumpMode::Skip, mask_mode);
        enq.put_u8(dump);
        enq_mask_payload(mask_mode, &mask_info, enq);
        return dump;
    }

    let mut tiles_info = BitPyramid::new(num_tiles);
    let mut mask_info = RunLenMasks::new(num_active);
    let mut active_id = 0u32;
    active_pixels.for_each_active_tile(|tile_id, mask| {
        tiles_info.set_on(tile_id);
        mask_info.set(active_id, mask);
        active_id += 1;
    });

    let tile_mode = tiles_info.finalize();
    let mask_mode = mask_info.finalize();
    let dump = combine(tile_mode, mask_mode);
    enq.put_u8(dump);

    match tile_mode {
        TileDumpMode::Full => tiles_info.enq_full(enq),
        TileDumpMode::FullDelta => tiles_info.enq_full_delta(enq),
        TileDumpMode::Table | TileDumpMode::LeafTable => tiles_info.enq_table(enq),
        TileDumpMode::Skip => {}
    }
    enq_mask_payload(mask_mode, &mask_info, enq);
    dump
}

fn enq_mask_payload(mode: MaskDumpMode, info: &RunLenMasks, enq: &mut Enqueue<'_>) {
    match mode {
        MaskDumpMode::AllMask => info.enq_all_mask(enq),
        MaskDumpMode::AllId => info.enq_all_id(enq),
        MaskDumpMode::RunLen => info.enq_runlen(enq),
        MaskDumpMode::Skip => {}
    }
}

/// Decode a tile-mask block into `active_pixels` (already shaped for the
/// incoming frame). Returns false for the all-skip (no data) case.
pub fn deq_tile_mask_block(
    deq: &mut Dequeue<'_>,
    active_tile_total: u32,
    active_pixels: &mut ActivePixels,
) -> Result<bool, CodecError> {
    let dump = deq.take_u8()?;
    let (tile_mode, mask_mode) = split(dump)?;

    let num_tiles = active_pixels.num_tiles();
    if num_tiles == 0 && (tile_mode != TileDumpMode::Skip || mask_mode != MaskDumpMode::Skip) {
        return Err(CodecError::malformed(
            "tile data for a zero-tile frame",
        ));
    }
    let mut tiles_info = BitPyramid::new(num_tiles);
    match tile_mode {
        TileDumpMode::Skip => {}
        TileDumpMode::Full => tiles_info.deq_full(deq, active_tile_total)?,
        TileDumpMode::FullDelta => tiles_info.deq_full_delta(deq, active_tile_total)?,
        TileDumpMode::Table => tiles_info.deq_table(deq, false)?,
        TileDumpMode::LeafTable => tiles_info.deq_table(deq, true)?,
    }

    let mut mask_info = RunLenMasks::new(active_tile_total);
    match mask_mode {
        MaskDumpMode::Skip => {}
        MaskDumpMode::AllMask => mask_info.deq_all_mask(deq)?,
        MaskDumpMode::AllId => mask_info.deq_all_id(deq)?,
        MaskDumpMode::RunLen => mask_info.deq_runlen(deq)?,
    }

    if tile_mode == TileDumpMode::Skip {
        if mask_mode == MaskDumpMode::Skip {
            return Ok(false); // no data
        }
        // Implied full coverage: the mask table must name every tile.
        if active_tile_total != num_tiles {
            return Err(CodecError::malformed(format!(
                "implied full coverage but activeTileCount {active_tile_total} != tiles {num_tiles}"
            )));
        }
        for tile_id in 0..num_tiles {
            active_pixels.set_tile_mask(tile_id, mask_info.get(tile_id));
        }
    } else {
        let mut active_id = 0u32;
        let mut overrun = false;
        tiles_info.for_each_active_item(|tile_id| {
            if active_id < active_tile_total && tile_id < num_tiles {
                active_pixels.set_tile_mask(tile_id, mask_info.get(active_id));
            } else {
                overrun = true;
            }
            active_id += 1;
        });
        if overrun || active_id != active_tile_total {
            return Err(CodecError::malformed(format!(
                "tile block decoded {active_id} tiles, header says {active_tile_total}"
            )));
        }
    }

    Ok(true)
}

/// Procedural test frame: exactly `total_active` distinct pixels set.
/// Debug/test use.
pub fn random_active_pixels(
    active_pixels: &mut ActivePixels,
    total_active: u32,
    rng: &mut impl rand::Rng,
) {
    let w = active_pixels.width();
    let h = active_pixels.height();
    let total = w * h;
    debug_assert!(total_active <= total);
    let mut placed = 0;
    while placed < total_active {
        let pix = rng.gen_range(0..total);
        let (x, y) = (pix % w, pix / w);
        if !active_pixels.get_pixel(x, y) {
            active_pixels.set_pixel(x, y);
            placed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn round_trip(src: &ActivePixels) {
        let mut buf = Vec::new();
        enq_tile_mask_block(src, &mut Enqueue::new(&mut buf));

        let mut dst = ActivePixels::new(src.width(), src.height());
        let mut deq = Dequeue::new(&buf);
        let got =
            deq_tile_mask_block(&mut deq, src.active_tile_count(), &mut dst).unwrap();
        assert_eq!(got, src.active_tile_count() != 0);
        assert_eq!(deq.remaining(), 0, "block consumed exactly");
        assert_eq!(*src, dst);
    }

    #[test]
    fn empty_frame_is_one_byte() {
        let src = ActivePixels::new(64, 64);
        let mut buf = Vec::new();
        let dump = enq_tile_mask_block(&src, &mut Enqueue::new(&mut buf));
        assert_eq!(dump, ALL_SKIP);
        assert_eq!(buf, [0x00]);
        round_trip(&src);
    }

    #[test]
    fn full_coverage_skips_tile_block() {
        let mut src = ActivePixels::new(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                src.set_pixel(x, y);
            }
        }
        let mut buf = Vec::new();
        let dump = enq_tile_mask_block(&src, &mut Enqueue::new(&mut buf));
        assert_eq!(dump & 0x0f, TileDumpMode::Skip as u8);
        // Four full masks, cheapest as raw masks: byte + 4 * 8.
        assert_eq!(buf.len(), 1 + 32);
        round_trip(&src);
    }

    #[test]
    fn sparse_frame_round_trips() {
        let mut src = ActivePixels::new(256, 256);
        src.set_pixel(0, 0);
        src.set_pixel(255, 255);
        src.set_pixel(128, 7);
        round_trip(&src);
    }

    #[test]
    fn dump_byte_nibbles() {
        let mut src = ActivePixels::new(256, 8); // 32 tiles in a row
        for x in 0..64 {
            src.set_pixel(x, 0); // tiles 0..7, one 8-pixel row each
        }
        let mut buf = Vec::new();
        let dump = enq_tile_mask_block(&src, &mut Enqueue::new(&mut buf));
        // Tile side: 8 consecutive ids, cheapest as deltas. Mask side: eight
        // popcount-8 masks, cheapest raw.
        assert_eq!(dump & 0x0f, TileDumpMode::FullDelta as u8);
        assert_eq!(dump & 0xf0, MaskDumpMode::AllMask as u8);
        round_trip(&src);
    }

    #[test]
    fn random_frames_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        for (w, h) in [(8u32, 8u32), (64, 64), (513, 257)] {
            for fill in [1u32, 10, 100] {
                let mut src = ActivePixels::new(w, h);
                random_active_pixels(&mut src, fill.min(w * h), &mut rng);
                round_trip(&src);
            }
        }
    }

    #[test]
    fn truncated_block_is_malformed() {
        let mut src = ActivePixels::new(64, 64);
        src.set_pixel(1, 1);
        src.set_pixel(60, 60);
        let mut buf = Vec::new();
        enq_tile_mask_block(&src, &mut Enqueue::new(&mut buf));

        let mut dst = ActivePixels::new(64, 64);
        let mut deq = Dequeue::new(&buf[..buf.len() - 1]);
        assert!(deq_tile_mask_block(&mut deq, 2, &mut dst).is_err());
    }
}
