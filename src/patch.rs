//! Windowed binary delta codec.
//!
//! A patch is a stream of windows, each describing how to produce a span of
//! the target from literal bytes and copies out of one span of the source
//! file. The decoder consumes patch input and source windows alternately
//! and emits output at each window completion; source spans outside the
//! current window are reached by seeking, so arbitrarily large files patch
//! in constant memory. Every window carries an Adler-32 of its decoded
//! bytes, checked in addition to the SHA-256 the content cache verifies
//! over the whole body.
//!
//! Layout: `MFD`, version byte, then windows of
//! `src_offset:u64 src_len:u32 tgt_len:u32 adler32:u32 inst_len:u32 inst…`
//! with two instructions: `0x00 len:u32 data…` appends literal bytes and
//! `0x01 off:u32 len:u32` copies from the window's source span.
//!
//! The encoder indexes the source in 4 KiB blocks (XxHash64) and aligns
//! each target window to the best-matching source window, emitting copies
//! for byte runs that line up and literals for the rest.

use std::collections::HashMap;
use std::hash::Hasher;
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use twox_hash::XxHash64;

use crate::error::{MfError, MfResult};

const MAGIC: &[u8; 3] = b"MFD";
const VERSION: u8 = 0;

/// Source block granularity; a power of two.
pub const BLOCK_SIZE: usize = 4096;
/// Window span on both the source and the target side.
pub const WINDOW_SIZE: usize = 16 * BLOCK_SIZE;

const OP_ADD: u8 = 0x00;
const OP_COPY: u8 = 0x01;

/// Copies shorter than this encode larger than the literal they replace.
const MIN_COPY: usize = 8;

/// Plain Adler-32 over `data`.
fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(4096) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

fn block_hash(block: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(block);
    hasher.finish()
}

/// Apply `patch` to `source`, writing the result to `target`. Returns the
/// number of bytes written. Any malformed header, out-of-bounds
/// instruction or checksum mismatch aborts with `Corrupt`.
pub fn apply(
    source: &mut (impl Read + Seek),
    patch: &mut impl Read,
    target: &mut impl Write,
) -> MfResult<u64> {
    let mut magic = [0u8; 3];
    patch.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(MfError::corrupt("patch magic mismatch"));
    }
    let version = patch.read_u8()?;
    if version != VERSION {
        return Err(MfError::corrupt(format!("unknown patch version {version}")));
    }

    let mut written = 0u64;
    loop {
        let src_offset = match read_u64_or_eof(patch)? {
            Some(v) => v,
            None => break,
        };
        let src_len = patch.read_u32::<LittleEndian>()? as usize;
        let tgt_len = patch.read_u32::<LittleEndian>()? as usize;
        let checksum = patch.read_u32::<LittleEndian>()?;
        let inst_len = patch.read_u32::<LittleEndian>()? as usize;

        if src_len > WINDOW_SIZE || tgt_len > WINDOW_SIZE {
            return Err(MfError::corrupt("window exceeds maximum size"));
        }

        let mut instructions = vec![0u8; inst_len];
        patch.read_exact(&mut instructions)?;

        // the requested source span may be anywhere; seek to it
        let mut src_window = vec![0u8; src_len];
        if src_len > 0 {
            source.seek(SeekFrom::Start(src_offset))?;
            source.read_exact(&mut src_window)?;
        }

        let out = decode_window(&instructions, &src_window, tgt_len)?;
        if adler32(&out) != checksum {
            return Err(MfError::corrupt("window checksum mismatch"));
        }
        target.write_all(&out)?;
        written += out.len() as u64;
    }

    Ok(written)
}

fn read_u64_or_eof(r: &mut impl Read) -> MfResult<Option<u64>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < 8 {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(MfError::corrupt("truncated window header"));
        }
        filled += n;
    }
    Ok(Some(u64::from_le_bytes(buf)))
}

fn decode_window(instructions: &[u8], src: &[u8], tgt_len: usize) -> MfResult<Vec<u8>> {
    let mut out = Vec::with_capacity(tgt_len);
    let mut pos = 0usize;

    while pos < instructions.len() {
        let op = instructions[pos];
        pos += 1;
        match op {
            OP_ADD => {
                let len = read_inst_u32(instructions, &mut pos)? as usize;
                let data = instructions
                    .get(pos..pos + len)
                    .ok_or_else(|| MfError::corrupt("literal runs past instruction stream"))?;
                out.extend_from_slice(data);
                pos += len;
            }
            OP_COPY => {
                let off = read_inst_u32(instructions, &mut pos)? as usize;
                let len = read_inst_u32(instructions, &mut pos)? as usize;
                let data = src
                    .get(off..off + len)
                    .ok_or_else(|| MfError::corrupt("copy outside the source window"))?;
                out.extend_from_slice(data);
            }
            other => return Err(MfError::corrupt(format!("unknown opcode {other:#04x}"))),
        }
        if out.len() > tgt_len {
            return Err(MfError::corrupt("window overruns its declared length"));
        }
    }

    if out.len() != tgt_len {
        return Err(MfError::corrupt("window shorter than declared"));
    }
    Ok(out)
}

fn read_inst_u32(buf: &[u8], pos: &mut usize) -> MfResult<u32> {
    let bytes = buf
        .get(*pos..*pos + 4)
        .ok_or_else(|| MfError::corrupt("truncated instruction"))?;
    *pos += 4;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Compute a patch turning `source` into `target`.
///
/// The output always round-trips through `apply`; matching quality only
/// affects the patch size.
pub fn diff(
    source: &mut (impl Read + Seek),
    target: &mut impl Read,
    patch: &mut impl Write,
) -> MfResult<()> {
    patch.write_all(MAGIC)?;
    patch.write_u8(VERSION)?;

    let (index, src_size) = index_source(source)?;

    let mut tgt_offset = 0u64;
    let mut window = vec![0u8; WINDOW_SIZE];
    loop {
        let filled = fill(target, &mut window)?;
        if filled == 0 {
            break;
        }
        let tgt_window = &window[..filled];

        let src_offset = pick_source_offset(&index, tgt_window, tgt_offset, src_size);
        let src_len = (src_size.saturating_sub(src_offset) as usize).min(WINDOW_SIZE);
        let mut src_window = vec![0u8; src_len];
        if src_len > 0 {
            source.seek(SeekFrom::Start(src_offset))?;
            source.read_exact(&mut src_window)?;
        }

        let instructions = encode_window(tgt_window, &src_window);

        patch.write_u64::<LittleEndian>(src_offset)?;
        patch.write_u32::<LittleEndian>(src_len as u32)?;
        patch.write_u32::<LittleEndian>(filled as u32)?;
        patch.write_u32::<LittleEndian>(adler32(tgt_window))?;
        patch.write_u32::<LittleEndian>(instructions.len() as u32)?;
        patch.write_all(&instructions)?;

        tgt_offset += filled as u64;
        if filled < WINDOW_SIZE {
            break;
        }
    }

    Ok(())
}

/// Hash every block-aligned source block. Collisions keep the first offset;
/// a wrong candidate only costs compression, never correctness.
fn index_source(source: &mut (impl Read + Seek)) -> MfResult<(HashMap<u64, u64>, u64)> {
    let mut index = HashMap::new();
    let mut offset = 0u64;
    let mut block = vec![0u8; BLOCK_SIZE];
    source.seek(SeekFrom::Start(0))?;
    loop {
        let filled = fill(source, &mut block)?;
        if filled == 0 {
            break;
        }
        index.entry(block_hash(&block[..filled])).or_insert(offset);
        offset += filled as u64;
        if filled < BLOCK_SIZE {
            break;
        }
    }
    Ok((index, offset))
}

fn pick_source_offset(
    index: &HashMap<u64, u64>,
    tgt_window: &[u8],
    tgt_offset: u64,
    src_size: u64,
) -> u64 {
    if tgt_window.len() >= BLOCK_SIZE {
        if let Some(&offset) = index.get(&block_hash(&tgt_window[..BLOCK_SIZE])) {
            return offset;
        }
    }
    // fall back to the block-aligned mirror position
    let aligned = tgt_offset - (tgt_offset % BLOCK_SIZE as u64);
    aligned.min(src_size)
}

/// Greedy aligned comparison: copies for runs where target and source
/// windows agree position-for-position, literals for everything else.
fn encode_window(tgt: &[u8], src: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut literal_start = 0usize;
    let mut i = 0usize;

    while i < tgt.len() {
        let mut run = 0usize;
        while i + run < tgt.len() && i + run < src.len() && tgt[i + run] == src[i + run] {
            run += 1;
        }
        if run >= MIN_COPY {
            flush_literal(&mut out, &tgt[literal_start..i]);
            out.push(OP_COPY);
            out.extend_from_slice(&(i as u32).to_le_bytes());
            out.extend_from_slice(&(run as u32).to_le_bytes());
            i += run;
            literal_start = i;
        } else {
            i += run.max(1);
        }
    }
    flush_literal(&mut out, &tgt[literal_start..]);
    out
}

fn flush_literal(out: &mut Vec<u8>, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    out.push(OP_ADD);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

fn fill(r: &mut impl Read, buf: &mut [u8]) -> MfResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(source: &[u8], target: &[u8]) -> Vec<u8> {
        let mut patch = Vec::new();
        diff(&mut Cursor::new(source), &mut Cursor::new(target), &mut patch).unwrap();

        let mut out = Vec::new();
        let written =
            apply(&mut Cursor::new(source), &mut patch.as_slice(), &mut out).unwrap();
        assert_eq!(written, target.len() as u64);
        out
    }

    /// Deterministic pseudo-random bytes, no RNG dependency needed.
    fn noise(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn identical_files() {
        let data = noise(3 * WINDOW_SIZE + 17, 1);
        assert_eq!(roundtrip(&data, &data), data);
    }

    #[test]
    fn append_only_edit() {
        let source = noise(WINDOW_SIZE, 2);
        let mut target = source.clone();
        target.extend_from_slice(b"and a little more at the end");
        assert_eq!(roundtrip(&source, &target), target);
    }

    #[test]
    fn in_place_edit() {
        let source = noise(2 * WINDOW_SIZE, 3);
        let mut target = source.clone();
        target[WINDOW_SIZE + 100..WINDOW_SIZE + 132].copy_from_slice(&[0xAB; 32]);
        assert_eq!(roundtrip(&source, &target), target);
    }

    #[test]
    fn empty_source_is_all_literals() {
        let target = noise(WINDOW_SIZE + 5, 4);
        assert_eq!(roundtrip(&[], &target), target);
    }

    #[test]
    fn empty_target() {
        let source = noise(1000, 5);
        assert_eq!(roundtrip(&source, &[]), Vec::<u8>::new());
    }

    #[test]
    fn shifted_content_still_roundtrips() {
        let source = noise(WINDOW_SIZE, 6);
        let mut target = Vec::new();
        target.extend_from_slice(b"prefix inserted before everything");
        target.extend_from_slice(&source);
        assert_eq!(roundtrip(&source, &target), target);
    }

    #[test]
    fn corrupted_checksum_is_detected() {
        let source = noise(5000, 7);
        let target = noise(5000, 8);
        let mut patch = Vec::new();
        diff(&mut Cursor::new(&source), &mut Cursor::new(&target), &mut patch).unwrap();

        // window checksum lives after src_offset(8) + src_len(4) + tgt_len(4)
        let pos = 4 + 8 + 4 + 4;
        patch[pos] ^= 0xFF;

        let mut out = Vec::new();
        let result = apply(&mut Cursor::new(&source), &mut patch.as_slice(), &mut out);
        assert!(matches!(result, Err(MfError::Corrupt(_))));
    }

    #[test]
    fn truncated_patch_is_detected() {
        let source = noise(5000, 9);
        let target = noise(5000, 10);
        let mut patch = Vec::new();
        diff(&mut Cursor::new(&source), &mut Cursor::new(&target), &mut patch).unwrap();
        patch.truncate(patch.len() - 3);

        let mut out = Vec::new();
        let result = apply(&mut Cursor::new(&source), &mut patch.as_slice(), &mut out);
        assert!(result.is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut out = Vec::new();
        let result = apply(
            &mut Cursor::new(b"src".to_vec()),
            &mut &b"XXX\0garbage"[..],
            &mut out,
        );
        assert!(matches!(result, Err(MfError::Corrupt(_))));
    }

    #[test]
    fn adler32_matches_known_vector() {
        // RFC 1950 example: "Wikipedia" => 0x11E60398
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn patches_of_identical_data_are_small() {
        let data = noise(4 * WINDOW_SIZE, 11);
        let mut patch = Vec::new();
        diff(&mut Cursor::new(&data), &mut Cursor::new(&data), &mut patch).unwrap();
        // four windows of pure copy instructions, far below the data size
        assert!(patch.len() < data.len() / 100);
    }
}
