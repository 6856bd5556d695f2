//! EXS24 instrument decoding.
//!
//! An EXS file is a flat run of chunks. Every chunk starts with the same
//! 84-byte header:
//!
//! ```text
//! +0   signature   u32   chunk type (see `ChunkKind`)
//! +4   body length u32   bytes following the header
//! +8   object id   u32
//! +12  reserved    8     bytes 16..20 carry the "TBOS"/"SOBT" magic
//! +20  name        64    null-terminated
//! ```
//!
//! The byte order is fixed by the header chunk and applies to every
//! integer field of every later chunk.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use binrw::{BinRead, Endian};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::config::ConvertConfig;
use crate::error::{FormatError, Result};

pub const CHUNK_HEADER_LEN: usize = 84;

const NEW_ERA_BIT: u32 = 0x4000_0000;
const SIG_HEADER: u32 = 0x0000_0101;
const SIG_ZONE: u32 = 0x0100_0101;
const SIG_GROUP: u32 = 0x0200_0101;
const SIG_SAMPLE: u32 = 0x0300_0101;
const SIG_PARAMETERS: u32 = 0x0400_0101;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Header,
    Zone,
    Group,
    Sample,
    Parameters,
}

/// Signature family. The newer family sets bit 30 of the legacy value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureEra {
    Legacy,
    New,
}

impl ChunkKind {
    pub fn from_signature(signature: u32) -> Option<(ChunkKind, SignatureEra)> {
        let era = if signature & NEW_ERA_BIT != 0 {
            SignatureEra::New
        } else {
            SignatureEra::Legacy
        };
        let kind = match signature & !NEW_ERA_BIT {
            SIG_HEADER => ChunkKind::Header,
            SIG_ZONE => ChunkKind::Zone,
            SIG_GROUP => ChunkKind::Group,
            SIG_SAMPLE => ChunkKind::Sample,
            SIG_PARAMETERS => ChunkKind::Parameters,
            _ => return None,
        };
        Some((kind, era))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChunkKind::Header => "header",
            ChunkKind::Zone => "zone",
            ChunkKind::Group => "group",
            ChunkKind::Sample => "sample",
            ChunkKind::Parameters => "parameters",
        }
    }
}

#[derive(BinRead, Debug)]
struct ChunkHeaderRaw {
    signature: u32,
    body_len: u32,
    object_id: u32,
    _reserved: [u8; 8],
    name: [u8; 64],
}

/// Bounds-checked access to the fields of one chunk, including its header.
/// Field offsets are relative to the chunk start.
pub struct FieldReader<'a> {
    bytes: &'a [u8],
    endian: Endian,
    kind: ChunkKind,
    offset: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(bytes: &'a [u8], endian: Endian, kind: ChunkKind, offset: usize) -> Self {
        FieldReader {
            bytes,
            endian,
            kind,
            offset,
        }
    }

    fn slice(&self, field: usize, len: usize) -> std::result::Result<&'a [u8], FormatError> {
        self.bytes
            .get(field..field + len)
            .ok_or(FormatError::FieldOutOfBounds {
                chunk: self.kind.name(),
                offset: self.offset,
                field,
                len: self.bytes.len(),
            })
    }

    pub fn u8_at(&self, field: usize) -> std::result::Result<u8, FormatError> {
        Ok(self.slice(field, 1)?[0])
    }

    pub fn i8_at(&self, field: usize) -> std::result::Result<i8, FormatError> {
        Ok(self.u8_at(field)? as i8)
    }

    pub fn i32_at(&self, field: usize) -> std::result::Result<i32, FormatError> {
        let bytes = self.slice(field, 4)?;
        Ok(match self.endian {
            Endian::Little => LittleEndian::read_i32(bytes),
            Endian::Big => BigEndian::read_i32(bytes),
        })
    }

    pub fn u32_at(&self, field: usize) -> std::result::Result<u32, FormatError> {
        let bytes = self.slice(field, 4)?;
        Ok(match self.endian {
            Endian::Little => LittleEndian::read_u32(bytes),
            Endian::Big => BigEndian::read_u32(bytes),
        })
    }

    /// Null-terminated text in a fixed-width field. Bytes past the end of
    /// the chunk are treated as absent; an empty string yields `None`.
    pub fn text_at(&self, field: usize, width: usize) -> Option<String> {
        let end = self.bytes.len().min(field + width);
        let raw = self.bytes.get(field..end)?;
        let text = until_nul(raw);
        (!text.is_empty()).then_some(text)
    }
}

fn until_nul(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

// --- Records ---

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneRecord {
    pub flags: u8,
    pub root_note: u8,
    pub fine_tune: i8,
    pub pan: i8,
    pub volume: i8,
    pub key_low: u8,
    pub key_high: u8,
    pub velocity_low: u8,
    pub velocity_high: u8,
    pub sample_start: i32,
    pub sample_end: i32,
    pub loop_start: i32,
    pub loop_end: i32,
    pub loop_crossfade_ms: i32,
    pub loop_options: u8,
    /// Negative means "last group".
    pub group: i32,
    pub sample_index: u32,
}

impl ZoneRecord {
    fn read(reader: &FieldReader<'_>) -> std::result::Result<Self, FormatError> {
        Ok(ZoneRecord {
            flags: reader.u8_at(84)?,
            root_note: reader.u8_at(85)?,
            fine_tune: reader.i8_at(86)?,
            pan: reader.i8_at(87)?,
            volume: reader.i8_at(88)?,
            key_low: reader.u8_at(90)?,
            key_high: reader.u8_at(91)?,
            velocity_low: reader.u8_at(93)?,
            velocity_high: reader.u8_at(94)?,
            sample_start: reader.i32_at(96)?,
            sample_end: reader.i32_at(100)?,
            loop_start: reader.i32_at(104)?,
            loop_end: reader.i32_at(108)?,
            loop_crossfade_ms: reader.i32_at(112)?,
            loop_options: reader.u8_at(117)?,
            group: reader.i32_at(172)?,
            sample_index: reader.u32_at(176)?,
        })
    }

    pub fn loop_enabled(&self) -> bool {
        self.loop_options & 1 != 0
    }

    pub fn loop_equal_power(&self) -> bool {
        self.loop_options & 2 != 0
    }

    /// Set when looping stops on note release. The inverse of
    /// keep-looping-on-release.
    pub fn play_to_end_on_release(&self) -> bool {
        self.loop_options & 4 != 0
    }

    pub fn pitch_tracking(&self) -> bool {
        self.flags & 1 == 0
    }

    pub fn one_shot(&self) -> bool {
        self.flags & 2 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableBy {
    None,
    Note,
    RoundRobin,
    Control,
    Bend,
    Channel,
    Articulation,
    Tempo,
    Other(u8),
}

impl From<u8> for EnableBy {
    fn from(value: u8) -> Self {
        match value {
            0 => EnableBy::None,
            1 => EnableBy::Note,
            2 => EnableBy::RoundRobin,
            3 => EnableBy::Control,
            4 => EnableBy::Bend,
            5 => EnableBy::Channel,
            6 => EnableBy::Articulation,
            7 => EnableBy::Tempo,
            other => EnableBy::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupRecord {
    pub polyphony: u8,
    pub trigger: u8,
    pub output: u8,
    pub sequence: i32,
    pub enable_by: EnableBy,
}

impl GroupRecord {
    fn read(reader: &FieldReader<'_>) -> std::result::Result<Self, FormatError> {
        // Older groups end before the sequencing fields.
        Ok(GroupRecord {
            polyphony: reader.u8_at(86)?,
            trigger: reader.u8_at(157).unwrap_or(0),
            output: reader.u8_at(158).unwrap_or(0),
            sequence: reader.i32_at(164).unwrap_or(-1),
            enable_by: reader.u8_at(168).map(EnableBy::from).unwrap_or(EnableBy::None),
        })
    }

    pub fn round_robin_position(&self) -> Option<u32> {
        match self.enable_by {
            EnableBy::RoundRobin => u32::try_from(self.sequence).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub length: i32,
    pub rate: i32,
    pub bit_depth: u8,
    /// Directory or full path as stored by the authoring machine.
    pub file_path: Option<String>,
    pub file_name: Option<String>,
}

impl SampleRecord {
    fn read(reader: &FieldReader<'_>) -> std::result::Result<Self, FormatError> {
        Ok(SampleRecord {
            length: reader.i32_at(88)?,
            rate: reader.i32_at(92)?,
            bit_depth: reader.u8_at(96)?,
            file_path: reader.text_at(164, 256),
            file_name: reader.text_at(420, 256),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Header,
    Zone(ZoneRecord),
    Group(GroupRecord),
    Sample(SampleRecord),
    Parameters { body_len: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    pub kind: ChunkKind,
    pub era: SignatureEra,
    pub object_id: u32,
    pub name: String,
    pub offset: usize,
    pub record: RawRecord,
}

/// A fully decoded EXS buffer.
#[derive(Debug, Clone)]
pub struct ExsDocument {
    pub endian: Endian,
    pub chunks: Vec<RawChunk>,
}

impl ExsDocument {
    pub fn instrument_name(&self) -> &str {
        self.chunks
            .first()
            .map(|c| c.name.as_str())
            .unwrap_or_default()
    }

    pub fn zones(&self) -> impl Iterator<Item = (&RawChunk, &ZoneRecord)> {
        self.chunks.iter().filter_map(|c| match &c.record {
            RawRecord::Zone(z) => Some((c, z)),
            _ => None,
        })
    }

    pub fn groups(&self) -> Vec<&GroupRecord> {
        self.chunks
            .iter()
            .filter_map(|c| match &c.record {
                RawRecord::Group(g) => Some(g),
                _ => None,
            })
            .collect()
    }

    pub fn samples(&self) -> Vec<(&RawChunk, &SampleRecord)> {
        self.chunks
            .iter()
            .filter_map(|c| match &c.record {
                RawRecord::Sample(s) => Some((c, s)),
                _ => None,
            })
            .collect()
    }
}

fn detect_endian(buffer: &[u8]) -> std::result::Result<Endian, FormatError> {
    let Some(first) = buffer.get(0..4) else {
        return Err(FormatError::TruncatedChunk {
            offset: 0,
            declared: CHUNK_HEADER_LEN,
            remaining: buffer.len(),
        });
    };
    let little = LittleEndian::read_u32(first);
    let big = BigEndian::read_u32(first);
    for (signature, endian) in [(little, Endian::Little), (big, Endian::Big)] {
        if let Some((ChunkKind::Header, _)) = ChunkKind::from_signature(signature) {
            return Ok(endian);
        }
    }
    match ChunkKind::from_signature(little).or(ChunkKind::from_signature(big)) {
        Some(_) => Err(FormatError::MissingHeaderChunk),
        None => Err(FormatError::UnknownSignature {
            offset: 0,
            signature: little,
        }),
    }
}

/// Decodes a complete EXS buffer. Nothing is returned unless every chunk
/// decodes.
pub fn decode(buffer: &[u8]) -> std::result::Result<ExsDocument, FormatError> {
    let endian = detect_endian(buffer)?;
    log::debug!("EXS byte order: {endian:?}");

    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < buffer.len() {
        let remaining = buffer.len() - offset;
        if remaining < CHUNK_HEADER_LEN {
            return Err(FormatError::TruncatedChunk {
                offset,
                declared: CHUNK_HEADER_LEN,
                remaining,
            });
        }

        let mut cursor = Cursor::new(&buffer[offset..offset + CHUNK_HEADER_LEN]);
        let header = ChunkHeaderRaw::read_options(&mut cursor, endian, ()).map_err(|_| {
            FormatError::TruncatedChunk {
                offset,
                declared: CHUNK_HEADER_LEN,
                remaining,
            }
        })?;

        let (kind, era) =
            ChunkKind::from_signature(header.signature).ok_or(FormatError::UnknownSignature {
                offset,
                signature: header.signature,
            })?;

        let body_len = header.body_len as usize;
        if body_len > remaining - CHUNK_HEADER_LEN {
            return Err(FormatError::TruncatedChunk {
                offset,
                declared: body_len,
                remaining: remaining - CHUNK_HEADER_LEN,
            });
        }

        let nul = header
            .name
            .iter()
            .position(|&b| b == 0)
            .ok_or(FormatError::UnterminatedName { offset })?;
        let name = String::from_utf8_lossy(&header.name[..nul]).to_string();

        let bytes = &buffer[offset..offset + CHUNK_HEADER_LEN + body_len];
        let reader = FieldReader::new(bytes, endian, kind, offset);
        let record = match kind {
            ChunkKind::Header => RawRecord::Header,
            ChunkKind::Zone => RawRecord::Zone(ZoneRecord::read(&reader)?),
            ChunkKind::Group => RawRecord::Group(GroupRecord::read(&reader)?),
            ChunkKind::Sample => RawRecord::Sample(SampleRecord::read(&reader)?),
            ChunkKind::Parameters => RawRecord::Parameters { body_len },
        };
        log::debug!("{} chunk '{}' at offset {}", kind.name(), name, offset);

        chunks.push(RawChunk {
            kind,
            era,
            object_id: header.object_id,
            name,
            offset,
            record,
        });
        offset += CHUNK_HEADER_LEN + body_len;
    }

    Ok(ExsDocument { endian, chunks })
}

/// Reads and decodes an EXS file, refusing files above the configured size.
pub fn read_exs_file(path: &Path, config: &ConvertConfig) -> Result<ExsDocument> {
    let size = fs::metadata(path)?.len();
    if size > config.max_binary_size {
        return Err(FormatError::FileTooLarge(size).into());
    }
    let buffer = fs::read(path)?;
    Ok(decode(&buffer)?)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builds EXS buffers field by field for tests.

    use super::*;

    pub const ZONE_LEN: usize = 180;
    pub const GROUP_LEN: usize = 172;
    pub const SAMPLE_LEN: usize = 676;

    pub struct ExsBuilder {
        big_endian: bool,
        new_era: bool,
        pub bytes: Vec<u8>,
    }

    pub struct ZoneSpec {
        pub root_note: u8,
        pub velocity_low: u8,
        pub velocity_high: u8,
        pub sample_start: i32,
        pub sample_end: i32,
        pub loop_on: bool,
        pub play_to_end_on_release: bool,
        pub loop_start: i32,
        pub loop_end: i32,
        pub loop_crossfade_ms: i32,
        pub group: i32,
        pub sample_index: u32,
    }

    impl Default for ZoneSpec {
        fn default() -> Self {
            ZoneSpec {
                root_note: 60,
                velocity_low: 0,
                velocity_high: 127,
                sample_start: 0,
                sample_end: 0,
                loop_on: false,
                play_to_end_on_release: false,
                loop_start: 0,
                loop_end: 0,
                loop_crossfade_ms: 0,
                group: 0,
                sample_index: 0,
            }
        }
    }

    impl ExsBuilder {
        pub fn new(name: &str) -> Self {
            Self::with_layout(name, false, false)
        }

        pub fn with_layout(name: &str, big_endian: bool, new_era: bool) -> Self {
            let mut builder = ExsBuilder {
                big_endian,
                new_era,
                bytes: Vec::new(),
            };
            let mut chunk = builder.chunk(SIG_HEADER, name, CHUNK_HEADER_LEN + 16);
            let magic = if big_endian { b"SOBT" } else { b"TBOS" };
            chunk[16..20].copy_from_slice(magic);
            builder.bytes.extend(chunk);
            builder
        }

        fn put_u32(&self, chunk: &mut [u8], at: usize, value: u32) {
            if self.big_endian {
                BigEndian::write_u32(&mut chunk[at..at + 4], value);
            } else {
                LittleEndian::write_u32(&mut chunk[at..at + 4], value);
            }
        }

        fn chunk(&self, signature: u32, name: &str, total_len: usize) -> Vec<u8> {
            let signature = if self.new_era {
                signature | NEW_ERA_BIT
            } else {
                signature
            };
            let mut chunk = vec![0u8; total_len];
            self.put_u32(&mut chunk, 0, signature);
            self.put_u32(&mut chunk, 4, (total_len - CHUNK_HEADER_LEN) as u32);
            chunk[20..20 + name.len()].copy_from_slice(name.as_bytes());
            chunk
        }

        pub fn zone(mut self, name: &str, spec: ZoneSpec) -> Self {
            let mut chunk = self.chunk(SIG_ZONE, name, ZONE_LEN);
            chunk[85] = spec.root_note;
            chunk[90] = spec.root_note;
            chunk[91] = spec.root_note;
            chunk[93] = spec.velocity_low;
            chunk[94] = spec.velocity_high;
            self.put_u32(&mut chunk, 96, spec.sample_start as u32);
            self.put_u32(&mut chunk, 100, spec.sample_end as u32);
            self.put_u32(&mut chunk, 104, spec.loop_start as u32);
            self.put_u32(&mut chunk, 108, spec.loop_end as u32);
            self.put_u32(&mut chunk, 112, spec.loop_crossfade_ms as u32);
            chunk[117] = u8::from(spec.loop_on) | (u8::from(spec.play_to_end_on_release) << 2);
            self.put_u32(&mut chunk, 172, spec.group as u32);
            self.put_u32(&mut chunk, 176, spec.sample_index);
            self.bytes.extend(chunk);
            self
        }

        pub fn group(mut self, name: &str, round_robin: Option<i32>) -> Self {
            let mut chunk = self.chunk(SIG_GROUP, name, GROUP_LEN);
            chunk[86] = 16;
            if let Some(position) = round_robin {
                self.put_u32(&mut chunk, 164, position as u32);
                chunk[168] = 2;
            }
            self.bytes.extend(chunk);
            self
        }

        pub fn sample(mut self, name: &str, length: i32, rate: i32, path: &str) -> Self {
            let mut chunk = self.chunk(SIG_SAMPLE, name, SAMPLE_LEN);
            self.put_u32(&mut chunk, 88, length as u32);
            self.put_u32(&mut chunk, 92, rate as u32);
            chunk[96] = 24;
            chunk[164..164 + path.len()].copy_from_slice(path.as_bytes());
            chunk[420..420 + name.len()].copy_from_slice(name.as_bytes());
            self.bytes.extend(chunk);
            self
        }

        pub fn build(self) -> Vec<u8> {
            self.bytes
        }
    }
}
