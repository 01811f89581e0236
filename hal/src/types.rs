//! # MFC Core Types
//!
//! Fundamental type definitions shared by every layer of the scheduler.
//!
//! These types provide:
//! - Strong typing for physical (device-visible) addresses
//! - Codec and session role identifiers
//! - Picture geometry and the stream parameters reported by the core

use core::fmt;
use core::ops::{Add, Sub};

// =============================================================================
// PHYSICAL ADDRESS
// =============================================================================

/// Device-visible physical address
///
/// The codec core reports completed buffers by address, not by handle, so
/// this is the identity of a buffer across the interrupt boundary.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null address (used for empty DPB slots)
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Align up to boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;

    fn sub(self, rhs: PhysAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr(0x{:010x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:010x}", self.0)
    }
}

// =============================================================================
// HARDWARE INSTANCE ID
// =============================================================================

/// Instance number assigned by the codec firmware on open
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HwInstanceId(pub u32);

impl fmt::Debug for HwInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HwInstance({})", self.0)
    }
}

// =============================================================================
// CODECS
// =============================================================================

/// Coded stream formats understood by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CodecKind {
    /// H.264 / AVC
    H264  = 0,
    /// H.265 / HEVC
    Hevc  = 1,
    /// MPEG-4 part 2 (incl. packed PB streams)
    Mpeg4 = 2,
    /// MPEG-2 video
    Mpeg2 = 3,
    /// H.263
    H263  = 4,
    /// VC-1
    Vc1   = 5,
    /// VP8
    Vp8   = 6,
    /// VP9
    Vp9   = 7,
}

impl CodecKind {
    /// Can one source buffer carry several coded pictures?
    ///
    /// MPEG-4 "packed PB" streams put a P and a B picture in one buffer; the
    /// core consumes them one at a time.
    pub const fn supports_packed_frames(self) -> bool {
        matches!(self, CodecKind::Mpeg4)
    }

    /// Can the core report per-completion reference usage for this codec?
    pub const fn supports_dynamic_dpb(self) -> bool {
        matches!(
            self,
            CodecKind::H264 | CodecKind::Hevc | CodecKind::Vp8 | CodecKind::Vp9
        )
    }

    /// Does the core have an encoder for this codec?
    pub const fn can_encode(self) -> bool {
        matches!(
            self,
            CodecKind::H264 | CodecKind::Hevc | CodecKind::Mpeg4 | CodecKind::H263 | CodecKind::Vp8
        )
    }

    /// Short name for logs
    pub const fn name(self) -> &'static str {
        match self {
            CodecKind::H264 => "h264",
            CodecKind::Hevc => "hevc",
            CodecKind::Mpeg4 => "mpeg4",
            CodecKind::Mpeg2 => "mpeg2",
            CodecKind::H263 => "h263",
            CodecKind::Vc1 => "vc1",
            CodecKind::Vp8 => "vp8",
            CodecKind::Vp9 => "vp9",
        }
    }
}

/// Direction of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Coded bitstream in, pictures out
    Decoder,
    /// Pictures in, coded bitstream out
    Encoder,
}

// =============================================================================
// GEOMETRY
// =============================================================================

/// Macroblock edge in pixels
pub const MB_SIZE: u32 = 16;

/// Picture dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Geometry {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Geometry {
    /// Create a new geometry
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both dimensions non-zero
    pub const fn is_valid(&self) -> bool {
        self.width != 0 && self.height != 0
    }

    /// Width in macroblocks
    pub const fn mb_width(&self) -> u32 {
        self.width.div_ceil(MB_SIZE)
    }

    /// Height in macroblocks
    pub const fn mb_height(&self) -> u32 {
        self.height.div_ceil(MB_SIZE)
    }

    /// Total macroblocks per picture
    pub const fn mb_count(&self) -> u32 {
        self.mb_width() * self.mb_height()
    }

    /// Bytes of one NV12 picture at macroblock-aligned dimensions
    pub const fn frame_size(&self) -> usize {
        let luma = (self.mb_width() * MB_SIZE) as usize * (self.mb_height() * MB_SIZE) as usize;
        luma + luma / 2
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Stream parameters read back from the core after a header parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamInfo {
    /// Coded picture size
    pub geometry: Geometry,
    /// Number of decoded-picture buffers the stream needs
    pub dpb_count: u32,
}

// =============================================================================
// OPEN PARAMETERS
// =============================================================================

/// Rate control settings for encoder sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeParams {
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Frames between key frames
    pub gop_size: u32,
    /// Frame rate numerator (frames per second)
    pub frame_rate: u32,
    /// Number of slices each frame is split into (1 = whole frames)
    pub slices_per_frame: u32,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            bitrate: 4_000_000,
            gop_size: 30,
            frame_rate: 30,
            slices_per_frame: 1,
        }
    }
}

/// Parameters of a session open request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenParams {
    /// Decoder or encoder
    pub role: Role,
    /// Stream format
    pub codec: CodecKind,
    /// Buffers live in protected memory
    pub secure: bool,
    /// Use per-completion reference tracking instead of a fixed DPB set
    pub dynamic_dpb: bool,
    /// Source picture size (encoders only; decoders learn it from the stream)
    pub geometry: Geometry,
    /// Rate control (encoders only)
    pub encode: EncodeParams,
}

impl OpenParams {
    /// Decoder session with a fixed DPB set
    pub const fn decoder(codec: CodecKind) -> Self {
        Self {
            role: Role::Decoder,
            codec,
            secure: false,
            dynamic_dpb: false,
            geometry: Geometry::new(0, 0),
            encode: EncodeParams {
                bitrate: 0,
                gop_size: 0,
                frame_rate: 0,
                slices_per_frame: 1,
            },
        }
    }

    /// Encoder session for pictures of the given size
    pub fn encoder(codec: CodecKind, geometry: Geometry) -> Self {
        Self {
            role: Role::Encoder,
            codec,
            secure: false,
            dynamic_dpb: false,
            geometry,
            encode: EncodeParams::default(),
        }
    }

    /// Request protected buffers
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Request dynamic DPB tracking
    pub const fn with_dynamic_dpb(mut self, dynamic: bool) -> Self {
        self.dynamic_dpb = dynamic;
        self
    }

    /// Override encoder rate control
    pub const fn with_encode(mut self, encode: EncodeParams) -> Self {
        self.encode = encode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_macroblocks() {
        let g = Geometry::new(1920, 1080);
        assert_eq!(g.mb_width(), 120);
        assert_eq!(g.mb_height(), 68);
        assert_eq!(g.mb_count(), 8160);
        assert_eq!(g.frame_size(), 1920 * 1088 * 3 / 2);
    }

    #[test]
    fn test_geometry_validity() {
        assert!(Geometry::new(16, 16).is_valid());
        assert!(!Geometry::new(0, 1080).is_valid());
        assert!(!Geometry::new(1920, 0).is_valid());
    }

    #[test]
    fn test_phys_addr_alignment() {
        let addr = PhysAddr::new(0x1001);
        assert!(!addr.is_aligned(0x1000));
        assert_eq!(addr.align_up(0x1000), PhysAddr::new(0x2000));
        assert_eq!(PhysAddr::new(0x3000) - PhysAddr::new(0x1000), 0x2000);
        assert!(PhysAddr::null().is_null());
    }

    #[test]
    fn test_codec_capabilities() {
        assert!(CodecKind::Mpeg4.supports_packed_frames());
        assert!(!CodecKind::H264.supports_packed_frames());
        assert!(CodecKind::H264.supports_dynamic_dpb());
        assert!(!CodecKind::Mpeg2.supports_dynamic_dpb());
        assert!(!CodecKind::Vc1.can_encode());
    }
}
