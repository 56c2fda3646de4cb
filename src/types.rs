//! Identifiers and shared data-model types (§3), common to every component.

use bitflags::bitflags;
use crate::util::ALL_FRAMES as ALL_FRAMES_U32;

/// Opaque, application-defined image identifier (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u64);

/// Opaque, application-defined stream identifier (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

/// An element (array item / cube face / frame) index, or level index. `ALL_FRAMES` is a valid
/// value of this type used as a sentinel (§3, §6).
pub type FrameIndex = u32;
pub type LevelIndex = u32;

pub const ALL_FRAMES: FrameIndex = ALL_FRAMES_U32;

bitflags! {
    /// Recognised file hints (§6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileHints: u32 {
        const NONE       = 0;
        const UNBUFFERED = 1 << 0;
    }
}

bitflags! {
    /// Recognised parse flags (§4.7, §6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParseFlags: u32 {
        const READ_METADATA  = 1 << 0;
        const READ_PIXELS    = 1 << 1;
        const METADATA_SET   = 1 << 2;
        const START_AT_OFFSET= 1 << 3;
        const SINGLE_FRAME   = 1 << 4;
        const FRAME_RANGE    = 1 << 5;
        const ALL_FRAMES     = 1 << 6;
        const READ_ALL_DATA  = Self::READ_METADATA.bits() | Self::READ_PIXELS.bits();
        const READ_ALL       = Self::READ_ALL_DATA.bits() | Self::ALL_FRAMES.bits();
    }
}

bitflags! {
    /// Status flags carried on an AIO result (§6): signal end-of-stream or stream restart to
    /// decoders.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AioResultFlags: u32 {
        const NONE        = 0;
        const ENDOFSTREAM = 1 << 0;
        const RESTART     = 1 << 1;
    }
}

bitflags! {
    /// Element status flags, packed into the high 16 bits of the element status word (§4.6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ElementFlags: u16 {
        const COMMITTED = 1 << 0;
        const EVICT     = 1 << 1;
        const DROP      = 1 << 2;
    }
}

/// Compression/encoding tags used to select an image encoder (§4.8). The set of named variants
/// is intentionally small; `Unknown` marks an as-yet-undetermined image definition field (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Bc1,
    Bc2,
    Bc3,
    Bc4,
    Bc5,
    Bc7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Identity,
    Srgb,
}

/// Pixel format discovered during parsing (§3). `Unknown` is the "not yet set" state referenced
/// by the image definition invariant: once a field is set (format != Unknown) it cannot change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Unknown,
    Rgba8,
    Bgra8,
    R8,
    Rg8,
    Bc1Rgba,
    Bc2Rgba,
    Bc3Rgba,
    Bc4R,
    Bc5Rg,
    Bc7Rgba,
}

impl Default for PixelFormat {
    fn default() -> Self {
        PixelFormat::Unknown
    }
}
