//! Distributed-rendering support library: packed-tile framebuffer codec and
//! shared-memory CPU-affinity arbitration.
//!
//! This crate is the canonical entry point for two independent cores used by
//! a production path tracer's render and merge nodes:
//!
//! - **Packed-tile codec.** Progressively-refined framebuffers travel as
//!   deltas: a sparse [`ActivePixels`] record of which 8x8-tile pixels were
//!   sampled since the last snapshot, plus a per-kind pixel payload at a
//!   per-packet precision (8-bit gamma, IEEE half, or full float). Tile
//!   positions are compressed through hierarchical bit tables and per-tile
//!   masks through run-length form selection, each picking the cheapest of
//!   several encodings per packet.
//!
//! - **Affinity arbitrator.** Render processes sharing a host claim
//!   non-overlapping core sets through a shared-memory ledger guarded by a
//!   single SysV semaphore, with socket/NUMA-aware placement that prefers
//!   quiet sockets and nodes already hosting the caller.
//!
//! ## Invariants
//!
//! - Encode and decode are pure functions over their inputs; no shared
//!   state, nothing suspends. Callers shard across cores by sharding over
//!   packets.
//! - All ledger mutations happen under the gate; two acquiring processes
//!   never observe each other mid-update.
//! - Every failure mode is a typed error ([`CodecError`],
//!   [`ArbiterError`]); malformed input never panics the decoder.

/// Byte enqueue/dequeue: LEB128 varints, zig-zag, halves, raw masks.
pub mod wire;

/// Sparse per-tile active-pixel bookkeeping (8x8 tiles, 64-bit masks).
pub mod active_pixels;

/// Dense bit tables and the hierarchical dump-mode codec for tile positions.
pub mod bit_table;

/// Run-length form selection for per-tile pixel masks.
pub mod runlen;

/// Combined tile-position + pixel-mask block codec.
pub mod active_tiles;

/// 8-bit transfer curves (gamma 2.2, optional sRGB) and linear byte quant.
pub mod gamma;

/// Tiled pixel buffers the codec reads from and decodes into.
pub mod fb;

/// Packet framing, header, SHA-1 slot, and per-kind pixel payload codecs.
pub mod pack_tiles;

/// Compact core-id set strings ("0-3,8").
pub mod core_ids;

/// CPU-socket topology probe with deterministic emulation profiles.
pub mod sockets;

/// NUMA topology probe and node-bound memory arena.
pub mod numa;

/// Fixed-layout shared-memory ledger of per-core ownership records.
pub mod ledger;

/// SysV semaphore gate with fractional-second blocking timeout.
pub mod gate;

/// Socket/NUMA-aware core selection over a ledger snapshot.
pub mod selector;

/// External acquire/release manager over ledger, gate, and selector.
pub mod arbiter;

pub use crate::active_pixels::ActivePixels;
pub use crate::arbiter::{AffinityManager, ArbiterError};
pub use crate::core_ids::{format_id_spec, parse_id_spec};
pub use crate::fb::{FloatBuffer, NumSampleBuffer, RenderBuffer, RenderColor, VarBuffer, VarFormat};
pub use crate::numa::NumaTopology;
pub use crate::pack_tiles::{
    CodecError, DataType, EncodeOptions, PacketHeader, PrecisionMode, RefType,
};
pub use crate::sockets::SocketTopology;
pub use crate::wire::WireError;
