//! Image encoder (C8, §4.8): the write-side counterpart to a container parser. A parser never
//! touches [`ImageMemory`](crate::image_memory::ImageMemory) directly — it drives an
//! `ImageEncoder`, which is selected once per image by `(src_compression, src_encoding) →
//! (dst_compression, dst_encoding)` and owns the actual memory operations. This indirection is
//! what lets a future transcoding encoder (e.g. BC7 → RGBA8) sit between the same parser and the
//! same memory store without either one knowing about the other.

use std::sync::{Arc, Mutex};
use thiserror::Error;
use crate::{
    error::MemoryError,
    image_memory::{ImageDef, ImageMemory},
    types::{Compression, Encoding, FrameIndex, ImageId, LevelIndex},
};

/// Errors specific to encoder selection and dispatch (§4.8); memory failures are passed through
/// from the backing [`ImageMemory`] via [`From`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EncoderError {
    #[error("no encoder available for the requested format conversion")]
    NoEncoder,
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// One level's worth of encode-time metadata: the parser computes this from the container header
/// and hands it to the encoder at `mark_level` time, which is enough for the identity encoder to
/// delegate straight to [`ImageMemory::mark_level_end`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LevelWrite {
    pub level: LevelIndex,
    pub size: usize,
}

/// Abstract encoder operations (§4.8): `define_image` reserves storage once the parser has fully
/// read the container's metadata; `reset_element`/`encode`/`mark_level`/`mark_element` then drive
/// one element's worth of streaming writes.
pub trait ImageEncoder {
    fn define_image(&mut self, image: ImageId, def: ImageDef, encoding: Encoding) -> Result<(), EncoderError>;
    fn reset_element(&mut self, image: ImageId, element: FrameIndex) -> Result<(), EncoderError>;
    fn encode(&mut self, image: ImageId, element: FrameIndex, data: &[u8]) -> Result<(), EncoderError>;
    fn mark_level(&mut self, image: ImageId, element: FrameIndex, write: LevelWrite) -> Result<(), EncoderError>;
    fn mark_element(&mut self, image: ImageId, element: FrameIndex) -> Result<(), EncoderError>;
}

/// The identity encoder (§4.8): used whenever a container's source format already matches the
/// destination format, so no transcoding is required. It reserves image memory of the base
/// element size and routes every operation straight through to the matching `ImageMemory` call.
#[derive(Debug)]
pub struct IdentityEncoder {
    memory: Arc<Mutex<ImageMemory>>,
}

impl IdentityEncoder {
    pub fn new(memory: Arc<Mutex<ImageMemory>>) -> Self {
        Self { memory }
    }
}

impl ImageEncoder for IdentityEncoder {
    fn define_image(&mut self, image: ImageId, def: ImageDef, encoding: Encoding) -> Result<(), EncoderError> {
        self.memory.lock().unwrap().reserve_image(image, def, encoding)?;
        Ok(())
    }

    fn reset_element(&mut self, image: ImageId, element: FrameIndex) -> Result<(), EncoderError> {
        self.memory.lock().unwrap().reset_element_storage(image, element)?;
        Ok(())
    }

    fn encode(&mut self, image: ImageId, element: FrameIndex, data: &[u8]) -> Result<(), EncoderError> {
        self.memory.lock().unwrap().write(image, element, data)?;
        Ok(())
    }

    fn mark_level(&mut self, image: ImageId, element: FrameIndex, write: LevelWrite) -> Result<(), EncoderError> {
        self.memory.lock().unwrap().mark_level_end(image, element, write.level, write.size)?;
        Ok(())
    }

    fn mark_element(&mut self, image: ImageId, element: FrameIndex) -> Result<(), EncoderError> {
        self.memory.lock().unwrap().mark_element_end(image, element)?;
        Ok(())
    }
}

/// Selects an encoder for a `(src_compression, src_encoding) -> (dst_compression, dst_encoding)`
/// conversion (§4.8). Only identity conversions are implemented; any other pair reports
/// `NoEncoder`, matching the spec's "other pairs are returned as no encoder available".
pub fn select_encoder(
    memory: Arc<Mutex<ImageMemory>>,
    src: (Compression, Encoding),
    dst: (Compression, Encoding),
) -> Result<IdentityEncoder, EncoderError> {
    if src == dst {
        Ok(IdentityEncoder::new(memory))
    } else {
        Err(EncoderError::NoEncoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    fn def() -> ImageDef {
        ImageDef {
            width: 4,
            height: 4,
            element_count: 1,
            level_count: 1,
            element_bytes: 64,
            compression: Compression::None,
            format: PixelFormat::Rgba8,
        }
    }

    #[test]
    fn identity_selected_when_formats_match() {
        let memory = Arc::new(Mutex::new(ImageMemory::new(None)));
        let pair = (Compression::None, Encoding::Identity);
        assert!(select_encoder(memory, pair, pair).is_ok());
    }

    #[test]
    fn mismatched_formats_report_no_encoder() {
        let memory = Arc::new(Mutex::new(ImageMemory::new(None)));
        let src = (Compression::None, Encoding::Identity);
        let dst = (Compression::Bc1, Encoding::Identity);
        assert_eq!(select_encoder(memory, src, dst).unwrap_err(), EncoderError::NoEncoder);
    }

    #[test]
    fn identity_encoder_round_trips_through_image_memory() {
        let memory = Arc::new(Mutex::new(ImageMemory::new(None)));
        let mut encoder = IdentityEncoder::new(memory);
        let image = ImageId(1);
        encoder.define_image(image, def(), Encoding::Identity).unwrap();
        encoder.reset_element(image, 0).unwrap();
        encoder.encode(image, 0, &[1u8; 16]).unwrap();
        encoder.mark_level(image, 0, LevelWrite { level: 0, size: 16 }).unwrap();
        encoder.mark_element(image, 0).unwrap();
    }
}
