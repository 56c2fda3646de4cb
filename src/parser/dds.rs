//! DDS container parser (§4.7), grounded in `examples/original_source/src/imparser_dds.cc`: a
//! pull-driven state machine over `SEEK_OFFSET -> FIND_MAGIC -> BUFFER_HEADER ->
//! [BUFFER_HEADER_DX10] -> RECEIVE_NEXT_ELEMENT -> RECEIVE_NEXT_LEVEL -> ENCODE_LEVEL_DATA -> ...
//! -> COMPLETE | ERROR`.

use crate::{
    encoder::{ImageEncoder, LevelWrite},
    error::ParserError,
    image_memory::ImageDef,
    parser::{DecodePos, ParseResult, ParserConfig},
    stream_decoder::{RefillResult, StreamDecoder},
    types::{Compression, Encoding, FrameIndex, LevelIndex, ParseFlags, PixelFormat},
};

const DDS_MAGIC_LE: u32 = 0x2053_4444;
const HEADER_SIZE: usize = 124;
const HEADER10_SIZE: usize = 20;

const DDSD_WIDTH: u32 = 0x2;
const DDSD_HEIGHT: u32 = 0x4;
const DDSD_MIPMAPCOUNT: u32 = 0x2_0000;
const DDPF_FOURCC: u32 = 0x4;
const DDSCAPS2_CUBEMAP: u32 = 0x200;
const DDSCAPS2_VOLUME: u32 = 0x20_0000;

fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    u32::from_le_bytes([a, b, c, d])
}

/// Per-level geometry and byte layout, computed once the header(s) are fully read (§4.7).
#[derive(Debug, Clone, Copy, Default)]
pub struct LevelDesc {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub slices: u32,
    pub bytes_per_row: usize,
    pub bytes_per_slice: usize,
    pub data_size: usize,
}

/// Fully resolved image metadata (§4.7), handed to `encoder.define_image` once available.
#[derive(Debug, Clone)]
pub struct ImageMetadata {
    pub format: PixelFormat,
    pub compression: Compression,
    pub width: u32,
    pub height: u32,
    pub element_count: u32,
    pub level_count: u32,
    pub levels: Vec<LevelDesc>,
}

impl ImageMetadata {
    pub(crate) fn element_bytes(&self) -> usize {
        self.levels.iter().map(|l| l.data_size).sum()
    }

    pub fn to_image_def(&self) -> ImageDef {
        ImageDef {
            width: self.width,
            height: self.height,
            element_count: self.element_count,
            level_count: self.level_count,
            element_bytes: self.element_bytes(),
            compression: self.compression,
            format: self.format,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SeekOffset,
    FindMagic,
    BufferHeader,
    BufferHeaderDx10,
    ReceiveNextElement,
    ReceiveNextLevel,
    EncodeLevelData,
    Complete,
    Error,
}

/// Maps a DXGI format ordinal to `(format, compression, bytes per pixel or block)`.
fn dxgi_pixel_format(dxgi_format: u32) -> Option<(PixelFormat, Compression, usize)> {
    match dxgi_format {
        28 => Some((PixelFormat::Rgba8, Compression::None, 4)),  // R8G8B8A8_UNORM
        87 => Some((PixelFormat::Bgra8, Compression::None, 4)),  // B8G8R8A8_UNORM
        61 => Some((PixelFormat::R8, Compression::None, 1)),     // R8_UNORM
        49 => Some((PixelFormat::Rg8, Compression::None, 2)),    // R8G8_UNORM
        71 => Some((PixelFormat::Bc1Rgba, Compression::Bc1, 8)), // BC1_UNORM
        74 => Some((PixelFormat::Bc2Rgba, Compression::Bc2, 16)), // BC2_UNORM
        77 => Some((PixelFormat::Bc3Rgba, Compression::Bc3, 16)), // BC3_UNORM
        80 => Some((PixelFormat::Bc4R, Compression::Bc4, 8)),    // BC4_UNORM
        83 => Some((PixelFormat::Bc5Rg, Compression::Bc5, 16)),  // BC5_UNORM
        98 => Some((PixelFormat::Bc7Rgba, Compression::Bc7, 16)), // BC7_UNORM
        _ => None,
    }
}

fn fourcc_pixel_format(code: u32) -> Option<(PixelFormat, Compression, usize)> {
    if code == fourcc(b'D', b'X', b'T', b'1') {
        Some((PixelFormat::Bc1Rgba, Compression::Bc1, 8))
    } else if code == fourcc(b'D', b'X', b'T', b'3') {
        Some((PixelFormat::Bc2Rgba, Compression::Bc2, 16))
    } else if code == fourcc(b'D', b'X', b'T', b'5') {
        Some((PixelFormat::Bc3Rgba, Compression::Bc3, 16))
    } else if code == fourcc(b'A', b'T', b'I', b'1') {
        Some((PixelFormat::Bc4R, Compression::Bc4, 8))
    } else if code == fourcc(b'A', b'T', b'I', b'2') {
        Some((PixelFormat::Bc5Rg, Compression::Bc5, 16))
    } else {
        None
    }
}

/// A pull-driven streaming DDS parser (§4.7).
pub struct DdsParser {
    state: State,
    error: Option<ParserError>,
    config: ParserConfig,

    element_final: FrameIndex,
    element_index: FrameIndex,
    level_count: LevelIndex,
    level_index: LevelIndex,

    metadata: Option<ImageMetadata>,
    block_offsets: Vec<DecodePos>,
    level_write: usize,
    level_size: usize,

    ddsh_buf: [u8; HEADER_SIZE],
    ddsh_write_pos: usize,
    dx10_buf: [u8; HEADER10_SIZE],
    dx10_write_pos: usize,
    has_dx10: bool,
    magic_buffer: u32,

    defined: bool,
    /// Set when the stream ended cleanly (no I/O error) but the parser was still mid-state, so
    /// the `Decoder` error it raises means "truncated container", not "read failed" (§7's
    /// loader-level `BAD_DATA` vs `OSERROR` distinction, which the parser's own error taxonomy
    /// has no slot for).
    unexpected_eof: bool,
}

impl DdsParser {
    pub fn new(config: ParserConfig) -> Self {
        let element_final = config.final_frame;
        Self {
            state: if config.parse_flags.contains(ParseFlags::START_AT_OFFSET) {
                State::SeekOffset
            } else if config.parse_flags.contains(ParseFlags::READ_METADATA) {
                State::FindMagic
            } else {
                State::ReceiveNextElement
            },
            error: None,
            element_final,
            element_index: config.first_frame,
            level_count: 0,
            level_index: 0,
            config,
            metadata: None,
            block_offsets: Vec::new(),
            level_write: 0,
            level_size: 0,
            ddsh_buf: [0u8; HEADER_SIZE],
            ddsh_write_pos: 0,
            dx10_buf: [0u8; HEADER10_SIZE],
            dx10_write_pos: 0,
            has_dx10: false,
            magic_buffer: 0,
            defined: false,
            unexpected_eof: false,
        }
    }

    pub fn metadata(&self) -> Option<&ImageMetadata> {
        self.metadata.as_ref()
    }

    /// True once `update()` has returned `Error(Decoder)` because the stream ended before the
    /// parser reached `Complete`, rather than because of an underlying I/O failure.
    pub fn unexpected_eof(&self) -> bool {
        self.unexpected_eof
    }

    /// Drives the parser forward with whatever decoded data `decoder` currently exposes. Per
    /// §4.7: refill, then dispatch on state while the decoded window has bytes or a transition
    /// doesn't require any; return once the decoder yields, the parser completes, or it errors.
    pub fn update(&mut self, decoder: &mut StreamDecoder, encoder: &mut dyn ImageEncoder) -> ParseResult {
        loop {
            match self.state {
                State::Complete => return ParseResult::Complete,
                State::Error => return ParseResult::Error(self.error.unwrap_or(ParserError::Decoder)),
                _ => {}
            }

            match decoder.refill() {
                RefillResult::Yield => return ParseResult::Continue,
                RefillResult::Error => {
                    self.error = Some(ParserError::Decoder);
                    self.state = State::Error;
                    return ParseResult::Error(ParserError::Decoder);
                }
                RefillResult::Start => {}
            }

            loop {
                let before = self.state;
                if let Err(e) = self.step(decoder, encoder) {
                    self.error = Some(e);
                    self.state = State::Error;
                }
                match self.state {
                    State::Complete | State::Error => break,
                    _ => {}
                }
                // A state that consumed all available bytes without transitioning needs another
                // refill; one that transitioned without consuming (element/level bookkeeping)
                // keeps looping here.
                if self.state == before && decoder.amount() == 0 {
                    if decoder.atend() {
                        // The stream is exhausted for good and this state still didn't move:
                        // no future refill will ever unstick it.
                        self.unexpected_eof = true;
                        self.error = Some(ParserError::Decoder);
                        self.state = State::Error;
                        return ParseResult::Error(ParserError::Decoder);
                    }
                    break;
                }
            }
        }
    }

    fn step(&mut self, decoder: &mut StreamDecoder, encoder: &mut dyn ImageEncoder) -> Result<(), ParserError> {
        match self.state {
            State::SeekOffset => self.seek_offset(decoder, encoder),
            State::FindMagic => self.find_magic(decoder),
            State::BufferHeader => self.buffer_header(decoder, encoder),
            State::BufferHeaderDx10 => self.buffer_header_dx10(decoder, encoder),
            State::ReceiveNextElement => self.receive_next_element(encoder),
            State::ReceiveNextLevel => self.receive_next_level(decoder, encoder),
            State::EncodeLevelData => self.encode_level_data(decoder, encoder),
            State::Complete | State::Error => Ok(()),
        }
    }

    fn seek_offset(&mut self, decoder: &mut StreamDecoder, encoder: &mut dyn ImageEncoder) -> Result<(), ParserError> {
        let target = self.config.start_offset.decode_offset;
        let (_, decode_offset) = decoder.pos();
        if decode_offset >= target {
            if self.config.parse_flags.contains(ParseFlags::READ_METADATA) {
                self.state = State::FindMagic;
            } else {
                self.finish_metadata(encoder)?;
            }
            return Ok(());
        }
        let available = decoder.amount();
        let consume = (target - decode_offset).min(available);
        if consume > 0 {
            decoder.consume(consume);
        }
        Ok(())
    }

    fn find_magic(&mut self, decoder: &mut StreamDecoder) -> Result<(), ParserError> {
        while decoder.amount() > 0 {
            let byte = decoder.consume(1)[0];
            self.magic_buffer >>= 8;
            self.magic_buffer |= (byte as u32) << 24;
            if self.magic_buffer == DDS_MAGIC_LE {
                self.state = State::BufferHeader;
                return Ok(());
            }
        }
        Ok(())
    }

    fn buffer_header(&mut self, decoder: &mut StreamDecoder, encoder: &mut dyn ImageEncoder) -> Result<(), ParserError> {
        let available = decoder.amount() as usize;
        let remaining = HEADER_SIZE - self.ddsh_write_pos;
        let take = available.min(remaining);
        if take > 0 {
            let chunk = decoder.consume(take as u64);
            self.ddsh_buf[self.ddsh_write_pos..self.ddsh_write_pos + take].copy_from_slice(chunk);
            self.ddsh_write_pos += take;
        }
        if self.ddsh_write_pos == HEADER_SIZE {
            let flags = self.header_pf_flags();
            let four_cc = self.header_pf_fourcc();
            if flags & DDPF_FOURCC != 0 && four_cc == fourcc(b'D', b'X', b'1', b'0') {
                self.state = State::BufferHeaderDx10;
            } else {
                self.has_dx10 = false;
                self.finish_metadata(encoder)?;
            }
        }
        Ok(())
    }

    fn buffer_header_dx10(&mut self, decoder: &mut StreamDecoder, encoder: &mut dyn ImageEncoder) -> Result<(), ParserError> {
        let available = decoder.amount() as usize;
        let remaining = HEADER10_SIZE - self.dx10_write_pos;
        let take = available.min(remaining);
        if take > 0 {
            let chunk = decoder.consume(take as u64);
            self.dx10_buf[self.dx10_write_pos..self.dx10_write_pos + take].copy_from_slice(chunk);
            self.dx10_write_pos += take;
        }
        if self.dx10_write_pos == HEADER10_SIZE {
            self.has_dx10 = true;
            self.finish_metadata(encoder)?;
        }
        Ok(())
    }

    fn receive_next_element(&mut self, encoder: &mut dyn ImageEncoder) -> Result<(), ParserError> {
        if self.element_index == self.element_final {
            self.state = State::Complete;
        } else {
            self.level_index = 0;
            encoder.reset_element(self.config.image, self.element_index).map_err(|_| ParserError::Encoder)?;
            self.state = State::ReceiveNextLevel;
        }
        Ok(())
    }

    fn receive_next_level(&mut self, decoder: &mut StreamDecoder, encoder: &mut dyn ImageEncoder) -> Result<(), ParserError> {
        if self.level_index == self.level_count {
            encoder.mark_element(self.config.image, self.element_index).map_err(|_| ParserError::Encoder)?;
            self.element_index += 1;
            self.state = State::ReceiveNextElement;
        } else {
            let (file_offset, decode_offset) = decoder.pos();
            let slot = (self.element_index * self.level_count + self.level_index) as usize;
            if let Some(entry) = self.block_offsets.get_mut(slot) {
                *entry = DecodePos { file_offset, decode_offset };
            }
            let metadata = self.metadata.as_ref().expect("levels known once metadata is set");
            self.level_size = metadata.levels[self.level_index as usize].data_size;
            self.level_write = 0;
            self.state = State::EncodeLevelData;
        }
        Ok(())
    }

    fn encode_level_data(&mut self, decoder: &mut StreamDecoder, encoder: &mut dyn ImageEncoder) -> Result<(), ParserError> {
        let available = decoder.amount() as usize;
        let remaining = self.level_size - self.level_write;
        let take = available.min(remaining);
        if take > 0 {
            let chunk = decoder.consume(take as u64);
            encoder.encode(self.config.image, self.element_index, chunk).map_err(|_| ParserError::Encoder)?;
            self.level_write += take;
        }
        if self.level_write == self.level_size {
            encoder
                .mark_level(self.config.image, self.element_index, LevelWrite { level: self.level_index, size: self.level_size })
                .map_err(|_| ParserError::Encoder)?;
            self.level_index += 1;
            self.state = State::ReceiveNextLevel;
        }
        Ok(())
    }

    fn header_pf_flags(&self) -> u32 {
        u32::from_le_bytes(self.ddsh_buf[76..80].try_into().unwrap())
    }

    fn header_pf_fourcc(&self) -> u32 {
        u32::from_le_bytes(self.ddsh_buf[80..84].try_into().unwrap())
    }

    /// Resolves the header(s) into an [`ImageMetadata`], builds the zero-initialised block-offset
    /// table, calls `encoder.define_image`, and transitions to the element-reading states (or
    /// straight to `COMPLETE` if pixel data wasn't requested) — §4.7's "after headers are
    /// assembled, metadata is finalised ... the parser then calls encoder.define_image".
    fn finish_metadata(&mut self, encoder: &mut dyn ImageEncoder) -> Result<(), ParserError> {
        let read = |buf: &[u8], off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());

        if self.config.parse_flags.contains(ParseFlags::READ_METADATA) {
            let flags = read(&self.ddsh_buf, 4);
            let height = read(&self.ddsh_buf, 8);
            let width = read(&self.ddsh_buf, 12);
            let depth = read(&self.ddsh_buf, 16);
            let mip_map_count = read(&self.ddsh_buf, 24);
            let pf_flags = self.header_pf_flags();
            let four_cc = self.header_pf_fourcc();
            let rgb_bit_count = read(&self.ddsh_buf, 84);
            let caps2 = read(&self.ddsh_buf, 108);

            let base_width = if flags & DDSD_WIDTH != 0 { width } else { 0 };
            let base_height = if flags & DDSD_HEIGHT != 0 { height } else { 0 };

            let (format, compression, block_or_pixel_bytes) = if self.has_dx10 {
                let dxgi_format = u32::from_le_bytes(self.dx10_buf[0..4].try_into().unwrap());
                dxgi_pixel_format(dxgi_format).ok_or(ParserError::NoMemory)?
            } else if pf_flags & DDPF_FOURCC != 0 {
                fourcc_pixel_format(four_cc).ok_or(ParserError::NoMemory)?
            } else {
                // Uncompressed, non-DX10: approximate from the bit count (32bpp assumed RGBA/BGRA
                // by convention; narrower formats map to the single/dual-channel variants).
                match rgb_bit_count {
                    32 => (PixelFormat::Rgba8, Compression::None, 4),
                    16 => (PixelFormat::Rg8, Compression::None, 2),
                    8 => (PixelFormat::R8, Compression::None, 1),
                    _ => return Err(ParserError::NoMemory),
                }
            };

            let element_count = if self.has_dx10 {
                read(&self.dx10_buf, 12).max(1)
            } else if caps2 & DDSCAPS2_CUBEMAP != 0 {
                6
            } else {
                1
            };
            let slice_count = if caps2 & DDSCAPS2_VOLUME != 0 { depth.max(1) } else { 1 };
            let level_count = if flags & DDSD_MIPMAPCOUNT != 0 { mip_map_count.max(1) } else { 1 };
            let block_compressed = !matches!(compression, Compression::None);

            let levels = (0..level_count)
                .map(|i| {
                    let level_width = (base_width >> i).max(1);
                    let level_height = (base_height >> i).max(1);
                    let level_slices = (slice_count >> i).max(1);
                    let (bytes_per_row, bytes_per_slice) = if block_compressed {
                        let blocks_wide = ((level_width + 3) / 4).max(1) as usize;
                        let blocks_high = ((level_height + 3) / 4).max(1) as usize;
                        let row = blocks_wide * block_or_pixel_bytes;
                        (row, row * blocks_high)
                    } else {
                        let row = level_width as usize * block_or_pixel_bytes;
                        (row, row * level_height as usize)
                    };
                    LevelDesc {
                        index: i,
                        width: level_width,
                        height: level_height,
                        slices: level_slices,
                        bytes_per_row,
                        bytes_per_slice,
                        data_size: bytes_per_slice * level_slices as usize,
                    }
                })
                .collect::<Vec<_>>();

            self.block_offsets = vec![DecodePos::default(); (element_count * level_count) as usize];
            self.level_count = level_count;
            self.metadata = Some(ImageMetadata {
                format,
                compression,
                width: base_width,
                height: base_height,
                element_count,
                level_count,
                levels,
            });

            let metadata = self.metadata.as_ref().unwrap();
            encoder
                .define_image(self.config.image, metadata.to_image_def(), Encoding::Identity)
                .map_err(|_| ParserError::Encoder)?;
            self.defined = true;
        }

        let metadata = self.metadata.as_ref().ok_or(ParserError::NoMemory)?;
        if self.element_final > metadata.element_count {
            self.element_final = metadata.element_count;
        }
        self.level_count = metadata.level_count;
        self.level_index = 0;

        self.state = if self.config.parse_flags.contains(ParseFlags::READ_PIXELS) {
            State::ReceiveNextElement
        } else {
            State::Complete
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer_pool::IoBufferPool,
        queues::{UnboundedMpsc, UnboundedSpsc},
        types::{AioResultFlags, ImageId, ParseFlags},
        image_memory::ImageMemory,
        encoder::IdentityEncoder,
        aio::AioCompletion,
    };
    use std::sync::{Arc, Mutex};

    fn le(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    /// Builds a minimal, valid, uncompressed RGBA8 DDS file with one element and one mip level.
    fn build_dds(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&le(DDS_MAGIC_LE));
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&le(HEADER_SIZE as u32));
        header[4..8].copy_from_slice(&le(DDSD_WIDTH | DDSD_HEIGHT));
        header[8..12].copy_from_slice(&le(height));
        header[12..16].copy_from_slice(&le(width));
        // pixel format block starts at offset 72: size(4) flags(4) fourcc(4) rgbbitcount(4) ...
        header[76..80].copy_from_slice(&le(0)); // pf flags: not DDPF_FOURCC
        header[84..88].copy_from_slice(&le(32)); // rgb bit count
        out.extend_from_slice(&header);
        out.extend_from_slice(pixels);
        out
    }

    fn make_decoder(data: Vec<u8>) -> (StreamDecoder, Arc<IoBufferPool>) {
        let alloc = *crate::util::PAGE_SIZE;
        let pool = Arc::new(IoBufferPool::new(4 * alloc, alloc));
        let (producer, consumer) = UnboundedSpsc::new().split();
        let returns: UnboundedMpsc<crate::buffer_pool::BufferHandle> = UnboundedMpsc::new();
        let decoder = StreamDecoder::new(pool.clone(), consumer, returns.producer());

        let buf = pool.get_buffer().unwrap();
        let slice = unsafe { buf.as_mut_slice() };
        slice[..data.len()].copy_from_slice(&data);
        producer.produce(AioCompletion {
            file_handle: -1,
            os_error: None,
            bytes_transferred: data.len(),
            data_actual: data.len(),
            file_offset: 0,
            data_buffer: Some(buf),
            identifier: 1,
            status: AioResultFlags::ENDOFSTREAM,
            priority: 0,
        });
        (decoder, pool)
    }

    #[test]
    fn parses_minimal_uncompressed_header_and_pixels() {
        let pixels = vec![7u8; 4 * 2 * 2];
        let file = build_dds(&pixels, 2, 2);
        let (mut decoder, _pool) = make_decoder(file);

        let memory = Arc::new(Mutex::new(ImageMemory::new(None)));
        let mut encoder = IdentityEncoder::new(memory);

        let config = ParserConfig {
            image: ImageId(1),
            first_frame: 0,
            final_frame: 1,
            start_offset: DecodePos::default(),
            parse_flags: ParseFlags::READ_ALL,
        };
        let mut parser = DdsParser::new(config);

        let mut result = parser.update(&mut decoder, &mut encoder);
        let mut guard = 0;
        while result == ParseResult::Continue && guard < 10 {
            result = parser.update(&mut decoder, &mut encoder);
            guard += 1;
        }

        assert_eq!(result, ParseResult::Complete);
        let metadata = parser.metadata().unwrap();
        assert_eq!(metadata.format, PixelFormat::Rgba8);
        assert_eq!(metadata.width, 2);
        assert_eq!(metadata.height, 2);
        assert_eq!(metadata.element_count, 1);
        assert_eq!(metadata.level_count, 1);
        assert_eq!(metadata.levels[0].data_size, 16);
    }

    #[test]
    fn metadata_only_flags_skip_pixel_data() {
        let pixels = vec![7u8; 4 * 2 * 2];
        let file = build_dds(&pixels, 2, 2);
        let (mut decoder, _pool) = make_decoder(file);

        let memory = Arc::new(Mutex::new(ImageMemory::new(None)));
        let mut encoder = IdentityEncoder::new(memory);

        let config = ParserConfig {
            image: ImageId(1),
            first_frame: 0,
            final_frame: 1,
            start_offset: DecodePos::default(),
            parse_flags: ParseFlags::READ_METADATA,
        };
        let mut parser = DdsParser::new(config);
        let result = parser.update(&mut decoder, &mut encoder);
        assert_eq!(result, ParseResult::Complete);
    }

    #[test]
    fn truncated_stream_reports_unexpected_eof_instead_of_looping() {
        // Magic plus a header cut short of HEADER_SIZE: BUFFER_HEADER can never fill its buffer.
        let mut file = Vec::new();
        file.extend_from_slice(&le(DDS_MAGIC_LE));
        file.extend_from_slice(&[0u8; 16]);
        let (mut decoder, _pool) = make_decoder(file);

        let memory = Arc::new(Mutex::new(ImageMemory::new(None)));
        let mut encoder = IdentityEncoder::new(memory);

        let config = ParserConfig {
            image: ImageId(1),
            first_frame: 0,
            final_frame: 1,
            start_offset: DecodePos::default(),
            parse_flags: ParseFlags::READ_ALL,
        };
        let mut parser = DdsParser::new(config);
        let result = parser.update(&mut decoder, &mut encoder);
        assert_eq!(result, ParseResult::Error(ParserError::Decoder));
        assert!(parser.unexpected_eof());
    }
}
