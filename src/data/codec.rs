//! Block-level zlib codec for file payloads.
//!
//! A compressed file starts with the RZCOMP header and carries the payload
//! as independently deflated 4 KiB logical blocks, each framed by its
//! compressed length. Anything without the magic is raw bytes. The encoder
//! skips compression when the estimated win is under 5%, so incompressible
//! input is stored as-is.

use std::borrow::Cow;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{FsError, Result};

pub const DATA_MAGIC: [u8; 8] = *b"RZCOMP\0\0";
pub const DATA_HEADER_LEN: usize = 24;
/// Logical block size for compression framing.
pub const BLOCK_SIZE: u32 = 4096;
/// Flag bit: payload blocks are deflated.
const FLAG_COMPRESSED: u32 = 1;
/// Minimum relative saving for compression to be worth the header.
const MIN_SAVING_PCT: u64 = 5;

/// Header layout (24 bytes, little-endian):
/// magic[8] | original_size u64 | flags u32 | block_size u32
fn write_header(out: &mut Vec<u8>, original_size: u64, block_size: u32) {
    out.extend_from_slice(&DATA_MAGIC);
    out.extend_from_slice(&original_size.to_le_bytes());
    out.extend_from_slice(&FLAG_COMPRESSED.to_le_bytes());
    out.extend_from_slice(&block_size.to_le_bytes());
}

fn deflate_block(block: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(block)?;
    Ok(encoder.finish()?)
}

/// Encodes `data` into the on-disk image, or returns `None` when the file
/// should be stored raw (too small, or compression does not pay off).
///
/// Raw data that happens to begin with the RZCOMP magic is always wrapped
/// in the compressed container so magic sniffing stays unambiguous.
pub fn encode(data: &[u8], min_bytes: u64) -> Result<Option<Vec<u8>>> {
    let must_wrap = data.starts_with(&DATA_MAGIC);
    if !must_wrap {
        if (data.len() as u64) < min_bytes {
            return Ok(None);
        }
        // Estimate on the first block only; incompressible input (already
        // compressed formats, random bytes) fails this cheaply.
        let probe = &data[..data.len().min(BLOCK_SIZE as usize)];
        let compressed = deflate_block(probe)?;
        let saved = probe.len().saturating_sub(compressed.len()) as u64;
        if saved * 100 < probe.len() as u64 * MIN_SAVING_PCT {
            return Ok(None);
        }
    }

    let mut out = Vec::with_capacity(DATA_HEADER_LEN + data.len() / 2);
    write_header(&mut out, data.len() as u64, BLOCK_SIZE);
    for block in data.chunks(BLOCK_SIZE as usize) {
        let compressed = deflate_block(block)?;
        out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        out.extend_from_slice(&compressed);
    }
    Ok(Some(out))
}

/// True if the image carries the compressed container header.
#[inline]
pub fn is_compressed(image: &[u8]) -> bool {
    image.len() >= DATA_MAGIC.len() && image[..DATA_MAGIC.len()] == DATA_MAGIC
}

/// Parsed RZCOMP header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub original_size: u64,
    pub flags: u32,
    pub block_size: u32,
}

pub fn parse_header(image: &[u8]) -> Result<Header> {
    if image.len() < DATA_HEADER_LEN {
        return Err(FsError::Corrupted("data header truncated".into()));
    }
    let original_size = u64::from_le_bytes(image[8..16].try_into().unwrap());
    let flags = u32::from_le_bytes(image[16..20].try_into().unwrap());
    let block_size = u32::from_le_bytes(image[20..24].try_into().unwrap());
    if flags & FLAG_COMPRESSED == 0 || block_size == 0 {
        return Err(FsError::Corrupted(format!(
            "data header has flags {flags:#x}, block size {block_size}"
        )));
    }
    Ok(Header { original_size, flags, block_size })
}

/// Decodes an on-disk image back to file content. Raw images are returned
/// borrowed; compressed images are inflated block by block.
pub fn decode(image: &[u8]) -> Result<Cow<'_, [u8]>> {
    if !is_compressed(image) {
        return Ok(Cow::Borrowed(image));
    }
    let header = parse_header(image)?;
    let mut out = Vec::with_capacity(header.original_size as usize);
    let mut at = DATA_HEADER_LEN;
    while (out.len() as u64) < header.original_size {
        if at + 4 > image.len() {
            return Err(FsError::Corrupted("data block table truncated".into()));
        }
        let comp_len = u32::from_le_bytes(image[at..at + 4].try_into().unwrap()) as usize;
        at += 4;
        if at + comp_len > image.len() {
            return Err(FsError::Corrupted("data block truncated".into()));
        }
        let mut decoder = ZlibDecoder::new(&image[at..at + comp_len]);
        let before = out.len();
        decoder
            .read_to_end(&mut out)
            .map_err(|err| FsError::Corrupted(format!("zlib stream: {err}")))?;
        if out.len() - before > header.block_size as usize {
            return Err(FsError::Corrupted("data block inflates past block size".into()));
        }
        at += comp_len;
    }
    if out.len() as u64 != header.original_size {
        return Err(FsError::Corrupted(format!(
            "decoded {} bytes, header claims {}",
            out.len(),
            header.original_size
        )));
    }
    Ok(Cow::Owned(out))
}
