//! Packed-tile framebuffer-delta codec.
//!
//! A packet ships the pixels sampled since the previous snapshot for one
//! buffer kind: beauty (RGBA), beauty-odd (the auxiliary checkerboard
//! half), pixel-info depth, heat map, weight, or a variable-format render
//! output AOV. Wire layout:
//!
//! ```text
//! +------------------------------+
//! | 20 bytes : SHA-1 of body     |   (zero when hashing is disabled)
//! +------------------------------+
//! | body:                        |
//! |   header (varints + scalars) |
//! |   combined dump-mode byte    |
//! |   tile block / mask block    |
//! |   pixel payload              |
//! +------------------------------+
//! ```
//!
//! Precision is selected per packet: UC8 (gamma-mapped bytes), H16 (IEEE
//! half) or F32. The precision branch happens at the tile loop, never per
//! pixel. Decoding is progressive: output buffers are re-initialized only
//! on a resolution change and otherwise refined in place.

use sha1::{Digest, Sha1};

use crate::active_pixels::ActivePixels;
use crate::active_tiles;
use crate::fb::{
    AllocError, FloatBuffer, NumSampleBuffer, RenderBuffer, RenderColor, VarBuffer, VarFormat,
};
use crate::gamma;
use crate::wire::{Dequeue, Enqueue, WireError};

/// Size of the leading SHA-1 slot.
pub const HASH_SIZE: usize = 20;

/// Newest format version the encoder emits and the decoder understands.
pub const FORMAT_VERSION_CURRENT: u32 = 2;

/// Codec failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error("packet carries {found:?}, caller expected {expected}")]
    WrongKind {
        expected: &'static str,
        found: DataType,
    },
    #[error("output buffer allocation failed: {0}")]
    AllocationFailed(#[from] AllocError),
}

impl CodecError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPacket(msg.into())
    }
}

impl From<WireError> for CodecError {
    fn from(e: WireError) -> Self {
        Self::MalformedPacket(e.to_string())
    }
}

/// Payload kind carried by a packet. Ordinals are wire-stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DataType {
    Undef = 0,
    Beauty = 1,
    BeautyWithNumSample = 2,
    BeautyOdd = 3,
    BeautyOddWithNumSample = 4,
    PixelInfo = 5,
    HeatMap = 6,
    HeatMapWithNumSample = 7,
    Float1 = 8,
    Float2 = 9,
    Float3 = 10,
    Float4 = 11,
    Float1WithNumSample = 12,
    Float2WithNumSample = 13,
    Float3WithNumSample = 14,
    Float4WithNumSample = 15,
    Reference = 16,
}

impl DataType {
    pub fn from_u32(v: u32) -> Option<Self> {
        use DataType::*;
        Some(match v {
            0 => Undef,
            1 => Beauty,
            2 => BeautyWithNumSample,
            3 => BeautyOdd,
            4 => BeautyOddWithNumSample,
            5 => PixelInfo,
            6 => HeatMap,
            7 => HeatMapWithNumSample,
            8 => Float1,
            9 => Float2,
            10 => Float3,
            11 => Float4,
            12 => Float1WithNumSample,
            13 => Float2WithNumSample,
            14 => Float3WithNumSample,
            15 => Float4WithNumSample,
            16 => Reference,
            _ => return None,
        })
    }

    /// Channel count of the float AOV kinds; None otherwise.
    pub fn float_channels(self) -> Option<u32> {
        use DataType::*;
        match self {
            Float1 | Float1WithNumSample => Some(1),
            Float2 | Float2WithNumSample => Some(2),
            Float3 | Float3WithNumSample => Some(3),
            Float4 | Float4WithNumSample => Some(4),
            _ => None,
        }
    }

    pub fn has_num_sample(self) -> bool {
        use DataType::*;
        matches!(
            self,
            BeautyWithNumSample
                | BeautyOddWithNumSample
                | HeatMapWithNumSample
                | Float1WithNumSample
                | Float2WithNumSample
                | Float3WithNumSample
                | Float4WithNumSample
        )
    }
}

/// Reference-packet target kind (header-only packets pointing the receiver
/// at an already-transferred buffer).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum RefType {
    #[default]
    Undef = 0,
    Beauty = 1,
    BeautyAux = 2,
    PixelInfo = 3,
    HeatMap = 4,
    Weight = 5,
}

impl RefType {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Undef,
            1 => Self::Beauty,
            2 => Self::BeautyAux,
            3 => Self::PixelInfo,
            4 => Self::HeatMap,
            5 => Self::Weight,
            _ => return None,
        })
    }
}

/// Per-packet value precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PrecisionMode {
    Uc8 = 0,
    H16 = 1,
    F32 = 2,
}

impl PrecisionMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Uc8),
            1 => Some(Self::H16),
            2 => Some(Self::F32),
            _ => None,
        }
    }
}

/// Decoded packet header.
#[derive(Clone, Copy, Debug)]
pub struct PacketHeader {
    pub format_version: u32,
    pub data_type: DataType,
    pub reference_type: RefType,
    pub width: u32,
    pub height: u32,
    pub active_tile_count: u32,
    pub active_pixel_count: u32,
    pub default_value: f32,
    pub precision: PrecisionMode,
    pub closest_filter: bool,
    pub coarse_precision: u8,
    pub fine_precision: u8,
}

/// Encoder knobs shared by every encode entry point.
#[derive(Clone, Copy, Debug)]
pub struct EncodeOptions {
    pub precision: PrecisionMode,
    /// Minimum coarse-pass precision, recorded verbatim in the header.
    pub coarse_precision: u8,
    /// Minimum fine-pass precision, recorded verbatim in the header.
    pub fine_precision: u8,
    pub with_hash: bool,
    pub format_version: u32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            precision: PrecisionMode::F32,
            coarse_precision: 0,
            fine_precision: 0,
            with_hash: false,
            format_version: FORMAT_VERSION_CURRENT,
        }
    }
}

impl EncodeOptions {
    pub fn with_precision(precision: PrecisionMode) -> Self {
        Self {
            precision,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// header block
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn enq_header(
    format_version: u32,
    data_type: DataType,
    reference_type: RefType,
    active_pixels: Option<&ActivePixels>,
    default_value: f32,
    opts: &EncodeOptions,
    closest_filter: bool,
    enq: &mut Enqueue<'_>,
) {
    let (width, height, tiles, pixels) = match active_pixels {
        Some(ap) => (
            ap.width(),
            ap.height(),
            ap.active_tile_count(),
            ap.active_pixel_count(),
        ),
        None => (0, 0, 0, 0),
    };
    enq.put_var_u32(format_version);
    enq.put_var_u32(data_type as u32);
    enq.put_var_u32(reference_type as u32);
    enq.put_var_u32(width);
    enq.put_var_u32(height);
    enq.put_var_u32(tiles);
    enq.put_var_u32(pixels);
    enq.put_f32(default_value);
    enq.put_u8(opts.precision as u8);
    enq.put_bool(closest_filter);
    enq.put_u8(opts.coarse_precision);
    enq.put_u8(opts.fine_precision);
}

fn deq_header(deq: &mut Dequeue<'_>) -> Result<PacketHeader, CodecError> {
    let format_version = deq.take_var_u32()?;
    if format_version > FORMAT_VERSION_CURRENT {
        return Err(CodecError::malformed(format!(
            "unknown format version {format_version}"
        )));
    }
    let dt = deq.take_var_u32()?;
    let data_type = DataType::from_u32(dt)
        .ok_or_else(|| CodecError::malformed(format!("unknown data type {dt}")))?;
    let rt = deq.take_var_u32()?;
    let reference_type = RefType::from_u32(rt)
        .ok_or_else(|| CodecError::malformed(format!("unknown reference type {rt}")))?;
    let width = deq.take_var_u32()?;
    let height = deq.take_var_u32()?;
    let active_tile_count = deq.take_var_u32()?;
    let active_pixel_count = deq.take_var_u32()?;
    let default_value = deq.take_f32()?;
    let pm = deq.take_u8()?;
    let precision = PrecisionMode::from_u8(pm)
        .ok_or_else(|| CodecError::malformed(format!("unknown precision mode {pm}")))?;
    let closest_filter = deq.take_bool()?;
    let coarse_precision = deq.take_u8()?;
    let fine_precision = deq.take_u8()?;
    Ok(PacketHeader {
        format_version,
        data_type,
        reference_type,
        width,
        height,
        active_tile_count,
        active_pixel_count,
        default_value,
        precision,
        closest_filter,
        coarse_precision,
        fine_precision,
    })
}

// ---------------------------------------------------------------------------
// frame scaffolding
// ---------------------------------------------------------------------------

fn enq_tile_mask_block_v1(active_pixels: &ActivePixels, enq: &mut Enqueue<'_>) {
    active_pixels.for_each_active_tile(|tile_id, mask| {
        enq.put_var_u32(tile_id);
        enq.put_mask64(mask);
    });
}

fn deq_tile_mask_block_v1(
    deq: &mut Dequeue<'_>,
    active_tile_total: u32,
    active_pixels: &mut ActivePixels,
) -> Result<(), CodecError> {
    let num_tiles = active_pixels.num_tiles();
    for _ in 0..active_tile_total {
        let tile_id = deq.take_var_u32()?;
        let mask = deq.take_mask64()?;
        if tile_id >= num_tiles {
            return Err(CodecError::malformed(format!(
                "tile id {tile_id} outside {num_tiles}-tile frame"
            )));
        }
        active_pixels.set_tile_mask(tile_id, mask);
    }
    Ok(())
}

fn encode_main(
    data_type: DataType,
    default_value: f32,
    closest_filter: bool,
    active_pixels: &ActivePixels,
    opts: &EncodeOptions,
    out: &mut Vec<u8>,
    payload: impl FnOnce(&mut Enqueue<'_>),
) -> usize {
    let hash_offset = out.len();
    out.extend_from_slice(&[0u8; HASH_SIZE]);
    let body_offset = out.len();

    {
        let mut enq = Enqueue::new(out);
        enq_header(
            opts.format_version,
            data_type,
            RefType::Undef,
            Some(active_pixels),
            default_value,
            opts,
            closest_filter,
            &mut enq,
        );
        if opts.format_version == 1 {
            enq_tile_mask_block_v1(active_pixels, &mut enq);
            payload(&mut enq);
        } else if active_tiles::enq_tile_mask_block(active_pixels, &mut enq)
            != active_tiles::ALL_SKIP
        {
            payload(&mut enq);
        }
    }

    if opts.with_hash {
        let digest = Sha1::digest(&out[body_offset..]);
        out[hash_offset..hash_offset + HASH_SIZE].copy_from_slice(&digest);
    }
    out.len() - hash_offset
}

fn decode_main(
    data: &[u8],
    sha1_out: Option<&mut [u8; HASH_SIZE]>,
    active_pixels: &mut ActivePixels,
    payload: impl FnOnce(&PacketHeader, &ActivePixels, &mut Dequeue<'_>) -> Result<(), CodecError>,
) -> Result<Option<PacketHeader>, CodecError> {
    if data.len() < HASH_SIZE {
        return Err(CodecError::malformed("packet shorter than hash slot"));
    }
    if let Some(out) = sha1_out {
        out.copy_from_slice(&data[..HASH_SIZE]);
    }

    let mut deq = Dequeue::new(&data[HASH_SIZE..]);
    let header = deq_header(&mut deq)?;

    active_pixels.init(header.width, header.height);

    if header.format_version == 1 {
        deq_tile_mask_block_v1(&mut deq, header.active_tile_count, active_pixels)?;
    } else if !active_tiles::deq_tile_mask_block(
        &mut deq,
        header.active_tile_count,
        active_pixels,
    )? {
        return Ok(None); // empty snapshot
    }

    payload(&header, active_pixels, &mut deq)?;
    Ok(Some(header))
}

/// Peek the data type (and reference type) without decoding the packet.
pub fn decode_data_type(data: &[u8]) -> Result<(DataType, RefType), CodecError> {
    if data.len() < HASH_SIZE {
        return Err(CodecError::malformed("packet shorter than hash slot"));
    }
    let mut deq = Dequeue::new(&data[HASH_SIZE..]);
    let version = deq.take_var_u32()?;
    if version > FORMAT_VERSION_CURRENT {
        return Err(CodecError::malformed(format!(
            "unknown format version {version}"
        )));
    }
    let dt = deq.take_var_u32()?;
    let data_type = DataType::from_u32(dt)
        .ok_or_else(|| CodecError::malformed(format!("unknown data type {dt}")))?;
    let rt = deq.take_var_u32()?;
    let reference_type = RefType::from_u32(rt)
        .ok_or_else(|| CodecError::malformed(format!("unknown reference type {rt}")))?;
    Ok((data_type, reference_type))
}

/// Recompute the body hash and compare it with the leading slot.
pub fn verify_hash(data: &[u8]) -> bool {
    if data.len() < HASH_SIZE {
        return false;
    }
    let digest = Sha1::digest(&data[HASH_SIZE..]);
    digest.as_slice() == &data[..HASH_SIZE]
}

/// One-line packet summary for diagnostics.
pub fn show(data: &[u8]) -> String {
    if data.len() < HASH_SIZE {
        return "packet: truncated (shorter than hash slot)".to_string();
    }
    let mut deq = Dequeue::new(&data[HASH_SIZE..]);
    match deq_header(&mut deq) {
        Ok(h) => format!(
            "packet: {:?} v{} {}x{} tiles:{} pixels:{} precision:{:?} closest:{} hash:{}",
            h.data_type,
            h.format_version,
            h.width,
            h.height,
            h.active_tile_count,
            h.active_pixel_count,
            h.precision,
            h.closest_filter,
            hex::encode(&data[..HASH_SIZE]),
        ),
        Err(e) => format!("packet: unreadable header ({e})"),
    }
}

// ---------------------------------------------------------------------------
// pixel-level drivers
// ---------------------------------------------------------------------------

/// Per-pixel value that knows its wire forms.
pub trait Pixel: Copy + Default {
    fn div_weight(self, w: f32) -> Self;
    fn put_uc8(self, enq: &mut Enqueue<'_>);
    fn put_h16(self, enq: &mut Enqueue<'_>);
    fn put_f32(self, enq: &mut Enqueue<'_>);
    fn get_uc8(deq: &mut Dequeue<'_>) -> Result<Self, WireError>;
    fn get_h16(deq: &mut Dequeue<'_>) -> Result<Self, WireError>;
    fn get_f32(deq: &mut Dequeue<'_>) -> Result<Self, WireError>;
}

impl Pixel for f32 {
    fn div_weight(self, w: f32) -> Self {
        self / w
    }
    // Scalar values are not necessarily color; 8-bit form stays linear.
    fn put_uc8(self, enq: &mut Enqueue<'_>) {
        enq.put_u8(gamma::linear_to_byte(self));
    }
    fn put_h16(self, enq: &mut Enqueue<'_>) {
        enq.put_f16(self);
    }
    fn put_f32(self, enq: &mut Enqueue<'_>) {
        enq.put_f32(self);
    }
    fn get_uc8(deq: &mut Dequeue<'_>) -> Result<Self, WireError> {
        Ok(gamma::byte_to_linear(deq.take_u8()?))
    }
    fn get_h16(deq: &mut Dequeue<'_>) -> Result<Self, WireError> {
        deq.take_f16()
    }
    fn get_f32(deq: &mut Dequeue<'_>) -> Result<Self, WireError> {
        deq.take_f32()
    }
}

impl Pixel for [f32; 2] {
    fn div_weight(self, w: f32) -> Self {
        [self[0] / w, self[1] / w]
    }
    fn put_uc8(self, enq: &mut Enqueue<'_>) {
        enq.put_u8(gamma::color_to_byte(self[0]));
        enq.put_u8(gamma::color_to_byte(self[1]));
    }
    fn put_h16(self, enq: &mut Enqueue<'_>) {
        enq.put_f16(self[0]);
        enq.put_f16(self[1]);
    }
    fn put_f32(self, enq: &mut Enqueue<'_>) {
        enq.put_f32(self[0]);
        enq.put_f32(self[1]);
    }
    fn get_uc8(deq: &mut Dequeue<'_>) -> Result<Self, WireError> {
        Ok([
            gamma::byte_to_color(deq.take_u8()?),
            gamma::byte_to_color(deq.take_u8()?),
        ])
    }
    fn get_h16(deq: &mut Dequeue<'_>) -> Result<Self, WireError> {
        Ok([deq.take_f16()?, deq.take_f16()?])
    }
    fn get_f32(deq: &mut Dequeue<'_>) -> Result<Self, WireError> {
        Ok([deq.take_f32()?, deq.take_f32()?])
    }
}

impl Pixel for [f32; 3] {
    fn div_weight(self, w: f32) -> Self {
        [self[0] / w, self[1] / w, self[2] / w]
    }
    fn put_uc8(self, enq: &mut Enqueue<'_>) {
        enq.put_u8(gamma::color_to_byte(self[0]));
        enq.put_u8(gamma::color_to_byte(self[1]));
        enq.put_u8(gamma::color_to_byte(self[2]));
    }
    fn put_h16(self, enq: &mut Enqueue<'_>) {
        enq.put_f16(self[0]);
        enq.put_f16(self[1]);
        enq.put_f16(self[2]);
    }
    fn put_f32(self, enq: &mut Enqueue<'_>) {
        enq.put_f32(self[0]);
        enq.put_f32(self[1]);
        enq.put_f32(self[2]);
    }
    fn get_uc8(deq: &mut Dequeue<'_>) -> Result<Self, WireError> {
        Ok([
            gamma::byte_to_color(deq.take_u8()?),
            gamma::byte_to_color(deq.take_u8()?),
            gamma::byte_to_color(deq.take_u8()?),
        ])
    }
    fn get_h16(deq: &mut Dequeue<'_>) -> Result<Self, WireError> {
        Ok([deq.take_f16()?, deq.take_f16()?, deq.take_f16()?])
    }
    fn get_f32(deq: &mut Dequeue<'_>) -> Result<Self, WireError> {
        Ok([deq.take_f32()?, deq.take_f32()?, deq.take_f32()?])
    }
}

impl Pixel for [f32; 4] {
    fn div_weight(self, w: f32) -> Self {
        [self[0] / w, self[1] / w, self[2] / w, self[3] / w]
    }
    // RGB through the transfer curve, alpha linear.
    fn put_uc8(self, enq: &mut Enqueue<'_>) {
        enq.put_u8(gamma::color_to_byte(self[0]));
        enq.put_u8(gamma::color_to_byte(self[1]));
        enq.put_u8(gamma::color_to_byte(self[2]));
        enq.put_u8(gamma::linear_to_byte(self[3]));
    }
    fn put_h16(self, enq: &mut Enqueue<'_>) {
        enq.put_f16(self[0]);
        enq.put_f16(self[1]);
        enq.put_f16(self[2]);
        enq.put_f16(self[3]);
    }
    fn put_f32(self, enq: &mut Enqueue<'_>) {
        enq.put_f32(self[0]);
        enq.put_f32(self[1]);
        enq.put_f32(self[2]);
        enq.put_f32(self[3]);
    }
    fn get_uc8(deq: &mut Dequeue<'_>) -> Result<Self, WireError> {
        Ok([
            gamma::byte_to_color(deq.take_u8()?),
            gamma::byte_to_color(deq.take_u8()?),
            gamma::byte_to_color(deq.take_u8()?),
            gamma::byte_to_linear(deq.take_u8()?),
        ])
    }
    fn get_h16(deq: &mut Dequeue<'_>) -> Result<Self, WireError> {
        Ok([
            deq.take_f16()?,
            deq.take_f16()?,
            deq.take_f16()?,
            deq.take_f16()?,
        ])
    }
    fn get_f32(deq: &mut Dequeue<'_>) -> Result<Self, WireError> {
        Ok([
            deq.take_f32()?,
            deq.take_f32()?,
            deq.take_f32()?,
            deq.take_f32()?,
        ])
    }
}

fn choose_put<T: Pixel>(precision: PrecisionMode) -> fn(T, &mut Enqueue<'_>) {
    match precision {
        PrecisionMode::Uc8 => T::put_uc8,
        PrecisionMode::H16 => T::put_h16,
        PrecisionMode::F32 => T::put_f32,
    }
}

fn choose_get<T: Pixel>(precision: PrecisionMode) -> fn(&mut Dequeue<'_>) -> Result<T, WireError> {
    match precision {
        PrecisionMode::Uc8 => T::get_uc8,
        PrecisionMode::H16 => T::get_h16,
        PrecisionMode::F32 => T::get_f32,
    }
}

#[inline]
fn for_each_set_bit(mut mask: u64, mut f: impl FnMut(usize)) {
    while mask != 0 {
        let shift = mask.trailing_zeros() as usize;
        f(shift);
        mask &= mask - 1;
    }
}

/// Sender path with numSample: normalize by weight (or pass raw closest
/// values through with numSample pinned to 1).
fn enq_val_sample<S: Pixel, T: Pixel>(
    enq: &mut Enqueue<'_>,
    precision: PrecisionMode,
    normalize: bool,
    active_pixels: &ActivePixels,
    src: &[S],
    weight: &[f32],
    map: impl Fn(S) -> T + Copy,
) {
    let put = choose_put::<T>(precision);
    active_pixels.for_each_active_tile(|tile_id, mask| {
        let base = tile_id as usize * 64;
        for_each_set_bit(mask, |shift| {
            let o = base + shift;
            let w = weight[o];
            let (v, num_sample) = if w > 0.0 {
                if normalize {
                    (src[o].div_weight(w), w as u32)
                } else {
                    (src[o], 1)
                }
            } else {
                (S::default(), 0)
            };
            put(map(v), enq);
            enq.put_var_u32(num_sample);
        });
    });
}

/// Sender path without numSample.
fn enq_val<S: Pixel, T: Pixel>(
    enq: &mut Enqueue<'_>,
    precision: PrecisionMode,
    normalize: bool,
    active_pixels: &ActivePixels,
    src: &[S],
    weight: &[f32],
    map: impl Fn(S) -> T + Copy,
) {
    let put = choose_put::<T>(precision);
    active_pixels.for_each_active_tile(|tile_id, mask| {
        let base = tile_id as usize * 64;
        for_each_set_bit(mask, |shift| {
            let o = base + shift;
            let w = weight[o];
            let v = if w > 0.0 {
                if normalize {
                    src[o].div_weight(w)
                } else {
                    src[o]
                }
            } else {
                S::default()
            };
            put(map(v), enq);
        });
    });
}

/// Merge path with numSample from a companion buffer.
fn enq_val_sample_normalized<S: Pixel, T: Pixel>(
    enq: &mut Enqueue<'_>,
    precision: PrecisionMode,
    active_pixels: &ActivePixels,
    src: &[S],
    num_samples: &[u32],
    map: impl Fn(S) -> T + Copy,
) {
    let put = choose_put::<T>(precision);
    active_pixels.for_each_active_tile(|tile_id, mask| {
        let base = tile_id as usize * 64;
        for_each_set_bit(mask, |shift| {
            let o = base + shift;
            let ns = num_samples[o];
            let v = if ns > 0 { src[o] } else { S::default() };
            put(map(v), enq);
            enq.put_var_u32(ns);
        });
    });
}

/// Merge path, already-normalized values, no numSample.
fn enq_val_normalized<S: Pixel, T: Pixel>(
    enq: &mut Enqueue<'_>,
    precision: PrecisionMode,
    active_pixels: &ActivePixels,
    src: &[S],
    map: impl Fn(S) -> T + Copy,
) {
    let put = choose_put::<T>(precision);
    active_pixels.for_each_active_tile(|tile_id, mask| {
        let base = tile_id as usize * 64;
        for_each_set_bit(mask, |shift| {
            put(map(src[base + shift]), enq);
        });
    });
}

fn deq_val_sample<T: Pixel, S: Copy>(
    deq: &mut Dequeue<'_>,
    precision: PrecisionMode,
    active_pixels: &ActivePixels,
    dst: &mut [S],
    mut dst_num_samples: Option<&mut [u32]>,
    unmap: impl Fn(T) -> S + Copy,
) -> Result<(), CodecError> {
    let get = choose_get::<T>(precision);
    let mut result = Ok(());
    active_pixels.for_each_active_tile(|tile_id, mask| {
        if result.is_err() {
            return;
        }
        let base = tile_id as usize * 64;
        for_each_set_bit(mask, |shift| {
            if result.is_err() {
                return;
            }
            let o = base + shift;
            match get(deq).and_then(|v| Ok((v, deq.take_var_u32()?))) {
                Ok((v, ns)) => {
                    dst[o] = unmap(v);
                    if let Some(ns_buf) = dst_num_samples.as_deref_mut() {
                        ns_buf[o] = ns;
                    }
                }
                Err(e) => result = Err(e.into()),
            }
        });
    });
    result
}

fn deq_val<T: Pixel, S: Copy>(
    deq: &mut Dequeue<'_>,
    precision: PrecisionMode,
    active_pixels: &ActivePixels,
    dst: &mut [S],
    unmap: impl Fn(T) -> S + Copy,
) -> Result<(), CodecError> {
    let get = choose_get::<T>(precision);
    let mut result = Ok(());
    active_pixels.for_each_active_tile(|tile_id, mask| {
        if result.is_err() {
            return;
        }
        let base = tile_id as usize * 64;
        for_each_set_bit(mask, |shift| {
            if result.is_err() {
                return;
            }
            match get(deq) {
                Ok(v) => dst[base + shift] = unmap(v),
                Err(e) => result = Err(e.into()),
            }
        });
    });
    result
}

#[inline]
fn id<T>(v: T) -> T {
    v
}

// ---------------------------------------------------------------------------
// beauty (RGBA) packets
// ---------------------------------------------------------------------------

fn beauty_data_type(odd: bool, with_num_sample: bool) -> DataType {
    match (odd, with_num_sample) {
        (false, false) => DataType::Beauty,
        (false, true) => DataType::BeautyWithNumSample,
        (true, false) => DataType::BeautyOdd,
        (true, true) => DataType::BeautyOddWithNumSample,
    }
}

/// Sender-path beauty encode: accumulated colors plus a weight buffer.
/// Values are normalized by weight; numSample is floor(weight) unless
/// `with_num_sample` is off.
#[allow(clippy::too_many_arguments)]
pub fn encode_beauty(
    active_pixels: &ActivePixels,
    render: &RenderBuffer,
    weight: &FloatBuffer,
    odd: bool,
    with_num_sample: bool,
    opts: &EncodeOptions,
    out: &mut Vec<u8>,
) -> usize {
    let data_type = beauty_data_type(odd, with_num_sample);
    encode_main(data_type, 0.0, false, active_pixels, opts, out, |enq| {
        if with_num_sample {
            enq_val_sample::<RenderColor, RenderColor>(
                enq,
                opts.precision,
                true,
                active_pixels,
                render.data(),
                weight.data(),
                id,
            );
        } else {
            enq_val::<RenderColor, RenderColor>(
                enq,
                opts.precision,
                true,
                active_pixels,
                render.data(),
                weight.data(),
                id,
            );
        }
    })
}

/// Merge-path beauty encode: already-normalized colors.
pub fn encode_beauty_merge(
    active_pixels: &ActivePixels,
    render: &RenderBuffer,
    odd: bool,
    opts: &EncodeOptions,
    out: &mut Vec<u8>,
) -> usize {
    encode_main(
        beauty_data_type(odd, false),
        0.0,
        false,
        active_pixels,
        opts,
        out,
        |enq| {
            enq_val_normalized::<RenderColor, RenderColor>(
                enq,
                opts.precision,
                active_pixels,
                render.data(),
                id,
            );
        },
    )
}

/// Merge-path beauty encode with a numSample companion buffer.
pub fn encode_beauty_merge_with_samples(
    active_pixels: &ActivePixels,
    render: &RenderBuffer,
    num_samples: &NumSampleBuffer,
    odd: bool,
    opts: &EncodeOptions,
    out: &mut Vec<u8>,
) -> usize {
    encode_main(
        beauty_data_type(odd, true),
        0.0,
        false,
        active_pixels,
        opts,
        out,
        |enq| {
            enq_val_sample_normalized::<RenderColor, RenderColor>(
                enq,
                opts.precision,
                active_pixels,
                render.data(),
                num_samples.data(),
                id,
            );
        },
    )
}

/// Decode a beauty packet that carries numSample data.
///
/// Returns the header when pixels were decoded, `None` for an empty
/// snapshot. `store_num_samples = false` still consumes the per-pixel
/// counts but does not keep them.
#[allow(clippy::too_many_arguments)]
pub fn decode_beauty_with_samples(
    data: &[u8],
    odd: bool,
    store_num_samples: bool,
    active_pixels: &mut ActivePixels,
    render: &mut RenderBuffer,
    num_samples: &mut NumSampleBuffer,
    sha1_out: Option<&mut [u8; HASH_SIZE]>,
) -> Result<Option<PacketHeader>, CodecError> {
    decode_main(data, sha1_out, active_pixels, |header, ap, deq| {
        let expected = beauty_data_type(odd, true);
        if header.data_type != expected {
            return Err(CodecError::WrongKind {
                expected: if odd {
                    "beauty-odd with numSample"
                } else {
                    "beauty with numSample"
                },
                found: header.data_type,
            });
        }
        let (w, h) = (ap.aligned_width(), ap.aligned_height());
        render.ensure_shape(w, h)?;
        let ns_out = if store_num_samples {
            num_samples.ensure_shape(w, h)?;
            Some(num_samples.data_mut())
        } else {
            None
        };
        deq_val_sample::<RenderColor, RenderColor>(
            deq,
            header.precision,
            ap,
            render.data_mut(),
            ns_out,
            id,
        )
    })
}

/// Decode a beauty packet without numSample data.
pub fn decode_beauty(
    data: &[u8],
    odd: bool,
    active_pixels: &mut ActivePixels,
    render: &mut RenderBuffer,
    sha1_out: Option<&mut [u8; HASH_SIZE]>,
) -> Result<Option<PacketHeader>, CodecError> {
    decode_main(data, sha1_out, active_pixels, |header, ap, deq| {
        let expected = beauty_data_type(odd, false);
        if header.data_type != expected {
            return Err(CodecError::WrongKind {
                expected: if odd { "beauty-odd" } else { "beauty" },
                found: header.data_type,
            });
        }
        render.ensure_shape(ap.aligned_width(), ap.aligned_height())?;
        deq_val::<RenderColor, RenderColor>(deq, header.precision, ap, render.data_mut(), id)
    })
}

// ---------------------------------------------------------------------------
// pixel-info (depth) packets
// ---------------------------------------------------------------------------

/// Depth values ride at full precision regardless of the packet precision
/// mode (the mode is still recorded for the receiver's bookkeeping).
pub fn encode_pixel_info(
    active_pixels: &ActivePixels,
    depth: &FloatBuffer,
    opts: &EncodeOptions,
    out: &mut Vec<u8>,
) -> usize {
    encode_main(
        DataType::PixelInfo,
        0.0,
        false,
        active_pixels,
        opts,
        out,
        |enq| {
            enq_val_normalized::<f32, f32>(
                enq,
                PrecisionMode::F32,
                active_pixels,
                depth.data(),
                id,
            );
        },
    )
}

pub fn decode_pixel_info(
    data: &[u8],
    active_pixels: &mut ActivePixels,
    depth: &mut FloatBuffer,
    sha1_out: Option<&mut [u8; HASH_SIZE]>,
) -> Result<Option<PacketHeader>, CodecError> {
    decode_main(data, sha1_out, active_pixels, |header, ap, deq| {
        if header.data_type != DataType::PixelInfo {
            return Err(CodecError::WrongKind {
                expected: "pixel info",
                found: header.data_type,
            });
        }
        depth.ensure_shape(ap.aligned_width(), ap.aligned_height())?;
        deq_val::<f32, f32>(deq, PrecisionMode::F32, ap, depth.data_mut(), id)
    })
}

// ---------------------------------------------------------------------------
// heat-map packets
// ---------------------------------------------------------------------------

/// Seconds-per-pixel heat map; values always travel as half floats.
pub fn encode_heat_map(
    active_pixels: &ActivePixels,
    seconds: &FloatBuffer,
    weight: &FloatBuffer,
    with_num_sample: bool,
    opts: &EncodeOptions,
    out: &mut Vec<u8>,
) -> usize {
    let data_type = if with_num_sample {
        DataType::HeatMapWithNumSample
    } else {
        DataType::HeatMap
    };
    let opts = EncodeOptions {
        precision: PrecisionMode::H16,
        ..*opts
    };
    encode_main(data_type, 0.0, false, active_pixels, &opts, out, |enq| {
        if with_num_sample {
            enq_val_sample::<f32, f32>(
                enq,
                PrecisionMode::H16,
                true,
                active_pixels,
                seconds.data(),
                weight.data(),
                id,
            );
        } else {
            enq_val::<f32, f32>(
                enq,
                PrecisionMode::H16,
                true,
                active_pixels,
                seconds.data(),
                weight.data(),
                id,
            );
        }
    })
}

/// Merge-path heat map: normalized seconds, no weight involved.
pub fn encode_heat_map_merge(
    active_pixels: &ActivePixels,
    seconds: &FloatBuffer,
    opts: &EncodeOptions,
    out: &mut Vec<u8>,
) -> usize {
    let opts = EncodeOptions {
        precision: PrecisionMode::H16,
        ..*opts
    };
    encode_main(
        DataType::HeatMap,
        0.0,
        false,
        active_pixels,
        &opts,
        out,
        |enq| {
            enq_val_normalized::<f32, f32>(
                enq,
                PrecisionMode::H16,
                active_pixels,
                seconds.data(),
                id,
            );
        },
    )
}

#[allow(clippy::too_many_arguments)]
pub fn decode_heat_map(
    data: &[u8],
    store_num_samples: bool,
    active_pixels: &mut ActivePixels,
    seconds: &mut FloatBuffer,
    num_samples: &mut NumSampleBuffer,
    sha1_out: Option<&mut [u8; HASH_SIZE]>,
) -> Result<Option<PacketHeader>, CodecError> {
    decode_main(data, sha1_out, active_pixels, |header, ap, deq| {
        let (w, h) = (ap.aligned_width(), ap.aligned_height());
        match header.data_type {
            DataType::HeatMap => {
                seconds.ensure_shape(w, h)?;
                deq_val::<f32, f32>(deq, PrecisionMode::H16, ap, seconds.data_mut(), id)
            }
            DataType::HeatMapWithNumSample => {
                seconds.ensure_shape(w, h)?;
                let ns_out = if store_num_samples {
                    num_samples.ensure_shape(w, h)?;
                    Some(num_samples.data_mut())
                } else {
                    None
                };
                deq_val_sample::<f32, f32>(
                    deq,
                    PrecisionMode::H16,
                    ap,
                    seconds.data_mut(),
                    ns_out,
                    id,
                )
            }
            other => Err(CodecError::WrongKind {
                expected: "heat map",
                found: other,
            }),
        }
    })
}

// ---------------------------------------------------------------------------
// weight packets
// ---------------------------------------------------------------------------

pub fn encode_weight(
    active_pixels: &ActivePixels,
    weight: &FloatBuffer,
    opts: &EncodeOptions,
    out: &mut Vec<u8>,
) -> usize {
    encode_main(
        DataType::Float1,
        0.0,
        false,
        active_pixels,
        opts,
        out,
        |enq| {
            enq_val_normalized::<f32, f32>(enq, opts.precision, active_pixels, weight.data(), id);
        },
    )
}

pub fn decode_weight(
    data: &[u8],
    active_pixels: &mut ActivePixels,
    weight: &mut FloatBuffer,
    sha1_out: Option<&mut [u8; HASH_SIZE]>,
) -> Result<Option<PacketHeader>, CodecError> {
    decode_main(data, sha1_out, active_pixels, |header, ap, deq| {
        if header.data_type != DataType::Float1 {
            return Err(CodecError::WrongKind {
                expected: "weight (float1)",
                found: header.data_type,
            });
        }
        weight.ensure_shape(ap.aligned_width(), ap.aligned_height())?;
        deq_val::<f32, f32>(deq, header.precision, ap, weight.data_mut(), id)
    })
}

// ---------------------------------------------------------------------------
// render-output (variable-format AOV) packets
// ---------------------------------------------------------------------------

/// Decoded AOV target: the pixel values plus the side information the
/// header carries for them.
#[derive(Clone, Debug)]
pub struct AovBuffer {
    pub buffer: VarBuffer,
    pub num_samples: NumSampleBuffer,
    pub default_value: f32,
    pub closest_filter: bool,
}

impl Default for AovBuffer {
    fn default() -> Self {
        Self {
            buffer: VarBuffer::new(VarFormat::Float1, 0, 0),
            num_samples: NumSampleBuffer::default(),
            default_value: 0.0,
            closest_filter: false,
        }
    }
}

fn render_output_data_type(
    format: VarFormat,
    closest_filter: bool,
    closest_original_channels: u32,
    with_num_sample: bool,
) -> Result<DataType, CodecError> {
    use DataType::*;
    let dt = if closest_filter {
        // Closest-filter AOVs ride in the 4-wide representation; the wire
        // carries original channels plus depth.
        if format != VarFormat::Float4 {
            return Err(CodecError::malformed(
                "closest-filter AOV requires the 4-wide source layout",
            ));
        }
        match (closest_original_channels, with_num_sample) {
            (1, false) => Float2,
            (2, false) => Float3,
            (3, false) => Float4,
            (1, true) => Float2WithNumSample,
            (2, true) => Float3WithNumSample,
            (3, true) => Float4WithNumSample,
            _ => {
                return Err(CodecError::malformed(format!(
                    "closest-filter AOV with {closest_original_channels} original channels"
                )))
            }
        }
    } else {
        match (format, with_num_sample) {
            (VarFormat::Float1, false) => Float1,
            (VarFormat::Float2, false) => Float2,
            (VarFormat::Float3, false) => Float3,
            (VarFormat::Float4, false) => Float4,
            (VarFormat::Float1, true) => Float1WithNumSample,
            (VarFormat::Float2, true) => Float2WithNumSample,
            (VarFormat::Float3, true) => Float3WithNumSample,
            (VarFormat::Float4, true) => Float4WithNumSample,
        }
    };
    Ok(dt)
}

fn closest_pick2(v: [f32; 4]) -> [f32; 2] {
    [v[0], v[3]]
}
fn closest_pick3(v: [f32; 4]) -> [f32; 3] {
    [v[0], v[1], v[3]]
}
fn closest_fill2(v: [f32; 2]) -> [f32; 4] {
    [v[0], 0.0, 0.0, v[1]]
}
fn closest_fill3(v: [f32; 3]) -> [f32; 4] {
    [v[0], v[1], 0.0, v[2]]
}

/// Sender-path AOV encode (accumulated values plus weight buffer).
///
/// `normalize = false` is the closest-filter convention: values pass
/// through raw and numSample is pinned to 1 wherever weight is positive.
#[allow(clippy::too_many_arguments)]
pub fn encode_render_output(
    active_pixels: &ActivePixels,
    source: &VarBuffer,
    default_value: f32,
    weight: &FloatBuffer,
    with_num_sample: bool,
    normalize: bool,
    closest_filter: bool,
    closest_original_channels: u32,
    opts: &EncodeOptions,
    out: &mut Vec<u8>,
) -> Result<usize, CodecError> {
    let data_type = render_output_data_type(
        source.format(),
        closest_filter,
        closest_original_channels,
        with_num_sample,
    )?;
    let p = opts.precision;
    let size = encode_main(
        data_type,
        default_value,
        closest_filter,
        active_pixels,
        opts,
        out,
        |enq| match (source, with_num_sample) {
            (VarBuffer::Float1(b), false) => {
                enq_val::<f32, f32>(enq, p, normalize, active_pixels, b.data(), weight.data(), id)
            }
            (VarBuffer::Float1(b), true) => enq_val_sample::<f32, f32>(
                enq,
                p,
                normalize,
                active_pixels,
                b.data(),
                weight.data(),
                id,
            ),
            (VarBuffer::Float2(b), false) => enq_val::<[f32; 2], [f32; 2]>(
                enq,
                p,
                normalize,
                active_pixels,
                b.data(),
                weight.data(),
                id,
            ),
            (VarBuffer::Float2(b), true) => enq_val_sample::<[f32; 2], [f32; 2]>(
                enq,
                p,
                normalize,
                active_pixels,
                b.data(),
                weight.data(),
                id,
            ),
            (VarBuffer::Float3(b), false) => enq_val::<[f32; 3], [f32; 3]>(
                enq,
                p,
                normalize,
                active_pixels,
                b.data(),
                weight.data(),
                id,
            ),
            (VarBuffer::Float3(b), true) => enq_val_sample::<[f32; 3], [f32; 3]>(
                enq,
                p,
                normalize,
                active_pixels,
                b.data(),
                weight.data(),
                id,
            ),
            (VarBuffer::Float4(b), false) => match data_type {
                DataType::Float2 => enq_val::<[f32; 4], [f32; 2]>(
                    enq,
                    p,
                    normalize,
                    active_pixels,
                    b.data(),
                    weight.data(),
                    closest_pick2,
                ),
                DataType::Float3 => enq_val::<[f32; 4], [f32; 3]>(
                    enq,
                    p,
                    normalize,
                    active_pixels,
                    b.data(),
                    weight.data(),
                    closest_pick3,
                ),
                _ => enq_val::<[f32; 4], [f32; 4]>(
                    enq,
                    p,
                    normalize,
                    active_pixels,
                    b.data(),
                    weight.data(),
                    id,
                ),
            },
            (VarBuffer::Float4(b), true) => match data_type {
                DataType::Float2WithNumSample => enq_val_sample::<[f32; 4], [f32; 2]>(
                    enq,
                    p,
                    normalize,
                    active_pixels,
                    b.data(),
                    weight.data(),
                    closest_pick2,
                ),
                DataType::Float3WithNumSample => enq_val_sample::<[f32; 4], [f32; 3]>(
                    enq,
                    p,
                    normalize,
                    active_pixels,
                    b.data(),
                    weight.data(),
                    closest_pick3,
                ),
                _ => enq_val_sample::<[f32; 4], [f32; 4]>(
                    enq,
                    p,
                    normalize,
                    active_pixels,
                    b.data(),
                    weight.data(),
                    id,
                ),
            },
        },
    );
    Ok(size)
}

/// Merge-path AOV encode: values already normalized, closest-filter AOVs
/// held without padding; the flag still crosses the wire.
pub fn encode_render_output_merge(
    active_pixels: &ActivePixels,
    source: &VarBuffer,
    default_value: f32,
    closest_filter: bool,
    opts: &EncodeOptions,
    out: &mut Vec<u8>,
) -> Result<usize, CodecError> {
    let data_type = render_output_data_type(source.format(), false, 0, false)?;
    let p = opts.precision;
    let size = encode_main(
        data_type,
        default_value,
        closest_filter,
        active_pixels,
        opts,
        out,
        |enq| match source {
            VarBuffer::Float1(b) => {
                enq_val_normalized::<f32, f32>(enq, p, active_pixels, b.data(), id)
            }
            VarBuffer::Float2(b) => {
                enq_val_normalized::<[f32; 2], [f32; 2]>(enq, p, active_pixels, b.data(), id)
            }
            VarBuffer::Float3(b) => {
                enq_val_normalized::<[f32; 3], [f32; 3]>(enq, p, active_pixels, b.data(), id)
            }
            VarBuffer::Float4(b) => {
                enq_val_normalized::<[f32; 4], [f32; 4]>(enq, p, active_pixels, b.data(), id)
            }
        },
    );
    Ok(size)
}

/// Decode a render-output packet into `aov`.
///
/// Closest-filter packets are expanded back into the 4-wide layout (depth
/// in the last lane, unused lanes zero); others land in a buffer of the
/// wire channel count.
pub fn decode_render_output(
    data: &[u8],
    store_num_samples: bool,
    active_pixels: &mut ActivePixels,
    aov: &mut AovBuffer,
    sha1_out: Option<&mut [u8; HASH_SIZE]>,
) -> Result<Option<PacketHeader>, CodecError> {
    decode_main(data, sha1_out, active_pixels, |header, ap, deq| {
        let channels = header.data_type.float_channels().ok_or(CodecError::WrongKind {
            expected: "render output (float1..float4)",
            found: header.data_type,
        })?;
        let with_ns = header.data_type.has_num_sample();
        let (w, h) = (ap.aligned_width(), ap.aligned_height());

        aov.default_value = header.default_value;
        aov.closest_filter = header.closest_filter;

        let target_format = if header.closest_filter {
            VarFormat::Float4
        } else {
            match channels {
                1 => VarFormat::Float1,
                2 => VarFormat::Float2,
                3 => VarFormat::Float3,
                _ => VarFormat::Float4,
            }
        };
        aov.buffer.ensure(target_format, w, h)?;
        let p = header.precision;
        let ns_out: Option<&mut [u32]> = if store_num_samples && with_ns {
            aov.num_samples.ensure_shape(w, h)?;
            Some(aov.num_samples.data_mut())
        } else {
            None
        };

        match (&mut aov.buffer, header.closest_filter, with_ns) {
            (VarBuffer::Float1(b), false, false) => {
                deq_val::<f32, f32>(deq, p, ap, b.data_mut(), id)
            }
            (VarBuffer::Float1(b), false, true) => deq_val_sample::<f32, f32>(
                deq,
                p,
                ap,
                b.data_mut(),
                ns_out,
                id,
            ),
            (VarBuffer::Float2(b), false, false) => {
                deq_val::<[f32; 2], [f32; 2]>(deq, p, ap, b.data_mut(), id)
            }
            (VarBuffer::Float2(b), false, true) => deq_val_sample::<[f32; 2], [f32; 2]>(
                deq,
                p,
                ap,
                b.data_mut(),
                ns_out,
                id,
            ),
            (VarBuffer::Float3(b), false, false) => {
                deq_val::<[f32; 3], [f32; 3]>(deq, p, ap, b.data_mut(), id)
            }
            (VarBuffer::Float3(b), false, true) => deq_val_sample::<[f32; 3], [f32; 3]>(
                deq,
                p,
                ap,
                b.data_mut(),
                ns_out,
                id,
            ),
            (VarBuffer::Float4(b), false, false) => {
                deq_val::<[f32; 4], [f32; 4]>(deq, p, ap, b.data_mut(), id)
            }
            (VarBuffer::Float4(b), false, true) => deq_val_sample::<[f32; 4], [f32; 4]>(
                deq,
                p,
                ap,
                b.data_mut(),
                ns_out,
                id,
            ),
            (VarBuffer::Float4(b), true, false) => match channels {
                2 => deq_val::<[f32; 2], [f32; 4]>(deq, p, ap, b.data_mut(), closest_fill2),
                3 => deq_val::<[f32; 3], [f32; 4]>(deq, p, ap, b.data_mut(), closest_fill3),
                _ => deq_val::<[f32; 4], [f32; 4]>(deq, p, ap, b.data_mut(), id),
            },
            (VarBuffer::Float4(b), true, true) => match channels {
                2 => deq_val_sample::<[f32; 2], [f32; 4]>(
                    deq,
                    p,
                    ap,
                    b.data_mut(),
                    ns_out,
                    closest_fill2,
                ),
                3 => deq_val_sample::<[f32; 3], [f32; 4]>(
                    deq,
                    p,
                    ap,
                    b.data_mut(),
                    ns_out,
                    closest_fill3,
                ),
                _ => deq_val_sample::<[f32; 4], [f32; 4]>(
                    deq,
                    p,
                    ap,
                    b.data_mut(),
                    ns_out,
                    id,
                ),
            },
            _ => Err(CodecError::malformed(
                "closest-filter packet without 4-wide target",
            )),
        }
    })
}

// ---------------------------------------------------------------------------
// reference packets
// ---------------------------------------------------------------------------

/// Header-only packet pointing the receiver at an already-transferred
/// buffer of the given kind.
pub fn encode_reference(
    reference_type: RefType,
    opts: &EncodeOptions,
    out: &mut Vec<u8>,
) -> usize {
    let hash_offset = out.len();
    out.extend_from_slice(&[0u8; HASH_SIZE]);
    let body_offset = out.len();
    {
        let mut enq = Enqueue::new(out);
        enq_header(
            opts.format_version,
            DataType::Reference,
            reference_type,
            None,
            0.0,
            opts,
            false,
            &mut enq,
        );
    }
    if opts.with_hash {
        let digest = Sha1::digest(&out[body_offset..]);
        out[hash_offset..hash_offset + HASH_SIZE].copy_from_slice(&digest);
    }
    out.len() - hash_offset
}

pub fn decode_reference(data: &[u8]) -> Result<RefType, CodecError> {
    if data.len() < HASH_SIZE {
        return Err(CodecError::malformed("packet shorter than hash slot"));
    }
    let mut deq = Dequeue::new(&data[HASH_SIZE..]);
    let header = deq_header(&mut deq)?;
    if header.data_type != DataType::Reference {
        return Err(CodecError::WrongKind {
            expected: "reference",
            found: header.data_type,
        });
    }
    Ok(header.reference_type)
}

// ---------------------------------------------------------------------------
// bare ActivePixels codec (diagnostics)
// ---------------------------------------------------------------------------

/// Serialize just an ActivePixels (no pixel values). Diagnostic format.
pub fn encode_active_pixels(active_pixels: &ActivePixels, out: &mut Vec<u8>) {
    let mut enq = Enqueue::new(out);
    enq.put_var_u32(active_pixels.width());
    enq.put_var_u32(active_pixels.height());
    enq.put_var_u32(active_pixels.active_tile_count());
    active_tiles::enq_tile_mask_block(active_pixels, &mut enq);
}

pub fn decode_active_pixels(
    data: &[u8],
    active_pixels: &mut ActivePixels,
) -> Result<(), CodecError> {
    let mut deq = Dequeue::new(data);
    let width = deq.take_var_u32()?;
    let height = deq.take_var_u32()?;
    let tiles = deq.take_var_u32()?;
    active_pixels.init(width, height);
    active_tiles::deq_tile_mask_block(&mut deq, tiles, active_pixels)?;
    Ok(())
}

// ---------------------------------------------------------------------------
