//! RIFF `smpl` chunk: root key and loop points stored inside a WAV, so
//! samplers that ignore the mapping file still loop correctly.

use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{ConvertError, Result};

const SMPL_ID: [u8; 4] = *b"smpl";
const FMT_ID: [u8; 4] = *b"fmt ";
/// Fixed part of the chunk, before the loop records.
const SMPL_HEADER_LEN: usize = 36;
const LOOP_RECORD_LEN: usize = 24;
const FORWARD_LOOP: u32 = 0;

/// What goes into a `smpl` chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerInfo {
    /// Root key. The fractional part becomes the pitch fraction.
    pub unity_note: f64,
    /// Inclusive forward loop in frames.
    pub sample_loop: Option<(u64, u64)>,
}

struct RiffChunk {
    id: [u8; 4],
    data: Vec<u8>,
}

fn invalid(path: &Path, reason: impl Into<String>) -> ConvertError {
    ConvertError::InvalidWav {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn read_chunks(bytes: &[u8], path: &Path) -> Result<Vec<RiffChunk>> {
    let mut cursor = Cursor::new(bytes);
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf)?;
    if &buf != b"RIFF" {
        return Err(invalid(path, "missing RIFF signature"));
    }
    let _riff_size = cursor.read_u32::<LittleEndian>()?;
    cursor.read_exact(&mut buf)?;
    if &buf != b"WAVE" {
        return Err(invalid(path, "missing WAVE signature"));
    }

    let mut chunks = Vec::new();
    while cursor.position() as usize + 8 <= bytes.len() {
        let mut id = [0u8; 4];
        cursor.read_exact(&mut id)?;
        let size = cursor.read_u32::<LittleEndian>()? as usize;
        let start = cursor.position() as usize;
        let end = start
            .checked_add(size)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                invalid(
                    path,
                    format!("'{}' chunk runs past the end", String::from_utf8_lossy(&id)),
                )
            })?;
        chunks.push(RiffChunk {
            id,
            data: bytes[start..end].to_vec(),
        });
        // Odd-sized chunks carry a pad byte.
        cursor.set_position((end + size % 2) as u64);
    }
    Ok(chunks)
}

fn smpl_body(info: &SamplerInfo, sample_rate: u32, path: &Path) -> Result<Vec<u8>> {
    let note = info.unity_note.clamp(0.0, 127.0);
    let unity = note.floor();
    let fraction = ((note - unity) * 4_294_967_296.0) as u32;
    let loop_count = u32::from(info.sample_loop.is_some());

    let mut body = Vec::with_capacity(SMPL_HEADER_LEN + LOOP_RECORD_LEN);
    body.write_u32::<LittleEndian>(0)?; // manufacturer
    body.write_u32::<LittleEndian>(0)?; // product
    body.write_u32::<LittleEndian>(1_000_000_000 / sample_rate.max(1))?;
    body.write_u32::<LittleEndian>(unity as u32)?;
    body.write_u32::<LittleEndian>(fraction)?;
    body.write_u32::<LittleEndian>(0)?; // SMPTE format
    body.write_u32::<LittleEndian>(0)?; // SMPTE offset
    body.write_u32::<LittleEndian>(loop_count)?;
    body.write_u32::<LittleEndian>(0)?; // sampler data

    if let Some((start, end)) = info.sample_loop {
        let frame = |value: u64| {
            u32::try_from(value).map_err(|_| invalid(path, format!("loop point {value} too large")))
        };
        body.write_u32::<LittleEndian>(0)?; // cue point id
        body.write_u32::<LittleEndian>(FORWARD_LOOP)?;
        body.write_u32::<LittleEndian>(frame(start)?)?;
        body.write_u32::<LittleEndian>(frame(end)?)?;
        body.write_u32::<LittleEndian>(0)?; // fraction
        body.write_u32::<LittleEndian>(0)?; // play count, 0 loops forever
    }
    Ok(body)
}

/// Writes (or replaces) the `smpl` chunk of the WAV at `path`. Every
/// other chunk is kept in order.
pub fn embed_smpl_chunk(path: &Path, info: &SamplerInfo) -> Result<()> {
    let bytes = fs::read(path)?;
    let mut chunks = read_chunks(&bytes, path)?;

    let sample_rate = chunks
        .iter()
        .find(|c| c.id == FMT_ID)
        .and_then(|c| c.data.get(4..8))
        .map(LittleEndian::read_u32)
        .ok_or_else(|| invalid(path, "no fmt chunk"))?;

    chunks.retain(|c| c.id != SMPL_ID);
    chunks.push(RiffChunk {
        id: SMPL_ID,
        data: smpl_body(info, sample_rate, path)?,
    });

    let mut out = Vec::with_capacity(bytes.len() + SMPL_HEADER_LEN + LOOP_RECORD_LEN + 8);
    out.extend_from_slice(b"RIFF");
    out.write_u32::<LittleEndian>(0)?;
    out.extend_from_slice(b"WAVE");
    for chunk in &chunks {
        out.extend_from_slice(&chunk.id);
        out.write_u32::<LittleEndian>(chunk.data.len() as u32)?;
        out.extend_from_slice(&chunk.data);
        if chunk.data.len() % 2 == 1 {
            out.push(0);
        }
    }
    let riff_size = u32::try_from(out.len() - 8).map_err(|_| invalid(path, "file exceeds 4 GiB"))?;
    LittleEndian::write_u32(&mut out[4..8], riff_size);

    let scratch = path.with_extension("smpl.wav");
    fs::write(&scratch, &out)?;
    fs::rename(&scratch, path)?;
    log::debug!("Embedded smpl chunk in {}", path.display());
    Ok(())
}

/// Reads back the `smpl` chunk, if the file has one. Only the first loop
/// record is returned.
pub fn read_smpl_chunk(path: &Path) -> Result<Option<SamplerInfo>> {
    let bytes = fs::read(path)?;
    let Some(chunk) = read_chunks(&bytes, path)?
        .into_iter()
        .find(|c| c.id == SMPL_ID)
    else {
        return Ok(None);
    };
    if chunk.data.len() < SMPL_HEADER_LEN {
        return Err(invalid(path, "smpl chunk too short"));
    }

    let mut cursor = Cursor::new(&chunk.data[12..]);
    let unity = cursor.read_u32::<LittleEndian>()?;
    let fraction = cursor.read_u32::<LittleEndian>()?;
    let unity_note = f64::from(unity) + f64::from(fraction) / 4_294_967_296.0;

    let loop_count = LittleEndian::read_u32(&chunk.data[28..32]);
    let sample_loop = if loop_count > 0 {
        let record = chunk
            .data
            .get(SMPL_HEADER_LEN..SMPL_HEADER_LEN + LOOP_RECORD_LEN)
            .ok_or_else(|| invalid(path, "smpl loop record truncated"))?;
        Some((
            u64::from(LittleEndian::read_u32(&record[8..12])),
            u64::from(LittleEndian::read_u32(&record[12..16])),
        ))
    } else {
        None
    };
    Ok(Some(SamplerInfo {
        unity_note,
        sample_loop,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::read_pcm;
    use crate::audio::test_support::write_wav;

    #[test]
    fn test_loop_points_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.wav");
        let frames: Vec<i32> = (0..1000).collect();
        write_wav(&path, 48_000, &frames);

        let info = SamplerInfo {
            unity_note: 62.0,
            sample_loop: Some((100, 899)),
        };
        embed_smpl_chunk(&path, &info).unwrap();
        assert_eq!(read_smpl_chunk(&path).unwrap(), Some(info));
        // Audio is untouched.
        assert_eq!(read_pcm(&path).unwrap().frames, frames);
    }

    #[test]
    fn test_embed_replaces_existing_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.wav");
        write_wav(&path, 44_100, &[0; 64]);
        embed_smpl_chunk(
            &path,
            &SamplerInfo {
                unity_note: 60.0,
                sample_loop: Some((1, 10)),
            },
        )
        .unwrap();
        let first_len = fs::metadata(&path).unwrap().len();

        let root_only = SamplerInfo {
            unity_note: 84.5,
            sample_loop: None,
        };
        embed_smpl_chunk(&path, &root_only).unwrap();
        assert_eq!(read_smpl_chunk(&path).unwrap(), Some(root_only));
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            first_len - LOOP_RECORD_LEN as u64
        );

        let bytes = fs::read(&path).unwrap();
        assert_eq!(
            LittleEndian::read_u32(&bytes[4..8]) as usize,
            bytes.len() - 8
        );
    }

    #[test]
    fn test_missing_chunk_and_bad_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("plain.wav");
        write_wav(&path, 44_100, &[0; 8]);
        assert_eq!(read_smpl_chunk(&path).unwrap(), None);

        let junk = tmp.path().join("junk.wav");
        fs::write(&junk, b"RIFX\0\0\0\0WAVE").unwrap();
        assert!(matches!(
            embed_smpl_chunk(&junk, &SamplerInfo {
                unity_note: 60.0,
                sample_loop: None,
            }),
            Err(ConvertError::InvalidWav { .. })
        ));
    }
}
