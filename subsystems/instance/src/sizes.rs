//! Firmware buffer sizes per codec.

use mfc_hal::{CodecKind, Geometry, Role};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Global device context handed to the firmware at init
pub const DEVICE_CONTEXT_SIZE: usize = 64 * KIB;

/// Per-instance firmware context
pub const fn context_size(codec: CodecKind, role: Role) -> usize {
    match role {
        Role::Decoder => match codec {
            CodecKind::H264 => 600 * KIB,
            CodecKind::Hevc => MIB,
            CodecKind::Vp9 => 20 * KIB,
            CodecKind::Mpeg4
            | CodecKind::Mpeg2
            | CodecKind::H263
            | CodecKind::Vc1
            | CodecKind::Vp8 => 10 * KIB,
        },
        Role::Encoder => match codec {
            CodecKind::H264 | CodecKind::Hevc => 100 * KIB,
            _ => 10 * KIB,
        },
    }
}

/// Codec scratch for a stream of the given geometry
///
/// Decoders need per-macroblock side information (motion vectors for the
/// reference-heavy codecs); encoders additionally keep two internal
/// reference pictures.
pub const fn scratch_size(codec: CodecKind, role: Role, geometry: Geometry) -> usize {
    let mbs = geometry.mb_count() as usize;
    let per_mb = match codec {
        CodecKind::H264 | CodecKind::Hevc => 384,
        CodecKind::Vp9 => 256,
        CodecKind::Vp8 | CodecKind::Mpeg4 | CodecKind::Vc1 => 128,
        CodecKind::Mpeg2 | CodecKind::H263 => 64,
    };
    let size = match role {
        Role::Decoder => 64 * KIB + mbs * per_mb,
        Role::Encoder => 64 * KIB + mbs * per_mb + 2 * geometry.frame_size(),
    };
    align_page(size)
}

const fn align_page(size: usize) -> usize {
    (size + 4095) & !4095
}
