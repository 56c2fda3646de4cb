//! Typed error taxonomy (§7). Errors never unwind past a driver tick: every one of these is
//! constructed, then posted to a client-supplied result/error queue keyed by the original
//! request's identity, rather than returned up a call stack. `anyhow` is reserved for
//! setup/plumbing failures (buffer pool reservation, opening a completion channel) that are
//! truly exceptional and have no client queue to report to.

use thiserror::Error;
use crate::types::{Compression, Encoding, ImageId, FrameIndex};

/// I/O errors (§7): surfaced verbatim as the OS error on the corresponding AIO result.
#[derive(Debug, Error, Clone, Copy)]
#[error("I/O error (errno {os_error})")]
pub struct IoError {
    pub os_error: i32,
}

/// Decoder errors (§7): the decoder indicates `ERROR` from `refill`.
#[derive(Debug, Error, Clone, Copy)]
#[error("stream decoder failed to refill")]
pub struct DecoderError;

/// Parser errors (§7), posted once per failed image to the loader's error queue.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParserError {
    #[error("out of memory while reserving image storage")]
    NoMemory,
    #[error("stream decoder failed")]
    Decoder,
    #[error("no encoder available for the requested format conversion")]
    NoEncoder,
    #[error("image encoder failed")]
    Encoder,
}

/// Policy errors (§7): raised by the cache on lock/definition of unknown or incompatible images.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[error("image {0:?} is not declared")]
    NotFound(ImageId),
    #[error("image {0:?} already has an incompatible definition")]
    AlreadyExists(ImageId),
}

/// Loader errors (§7), one taxonomy member per failure observed while servicing a load request.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LoaderErrorCode {
    #[error("no such file")]
    FileAccess,
    #[error("no parser registered for this container format")]
    NoParser,
    #[error("malformed container data")]
    BadData,
    #[error("out of memory")]
    NoMemory,
    #[error("no encoder available")]
    NoEncoder,
    #[error("OS error")]
    OsError,
}

/// A fully descriptive loader error record (§4.9), posted to the loader's error queue:
/// `(image_id, file_path, first_frame, final_frame, src/dst compression/encoding, error_code,
/// os_error)`.
#[derive(Debug, Clone)]
pub struct LoaderErrorRecord {
    pub image_id: ImageId,
    pub file_path: String,
    pub first_frame: FrameIndex,
    pub final_frame: FrameIndex,
    pub src: (Compression, Encoding),
    pub dst: (Compression, Encoding),
    pub error_code: LoaderErrorCode,
    pub os_error: Option<i32>,
}

/// Resource errors (§7): buffer pool exhaustion. Not an error condition per se — a transient
/// backpressure signal consumed by PIO to skip a stream for the current tick.
#[derive(Debug, Error, Clone, Copy)]
#[error("buffer pool exhausted")]
pub struct PoolExhausted;

/// Image memory errors, raised by `ImageMemory` operations (§4.6).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("image {0:?} already exists with an incompatible definition")]
    AlreadyExists(ImageId),
    #[error("failed to commit element storage")]
    CommitFailed,
    #[error("access out of the element's committed range")]
    OutOfRange,
    #[error("image {0:?} is unknown to the memory manager")]
    UnknownImage(ImageId),
}
