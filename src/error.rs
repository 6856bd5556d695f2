use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

// --- Error Types ---

/// Top-level error for loading, mapping and converting one instrument.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    MissingResource(#[from] MissingResourceError),
    #[error("Resampler failed on '{path}': {reason}")]
    Resampler { path: PathBuf, reason: String },
    #[error("Invalid WAV file '{path}': {reason}")]
    InvalidWav { path: PathBuf, reason: String },
}

/// Malformed or unrecognized input. Always fatal for the instrument.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("Unrecognized chunk signature 0x{signature:08x} at offset {offset}")]
    UnknownSignature { offset: usize, signature: u32 },
    #[error("Chunk at offset {offset} declares {declared} body bytes but only {remaining} remain")]
    TruncatedChunk {
        offset: usize,
        declared: usize,
        remaining: usize,
    },
    #[error("Chunk name at offset {offset} is not null-terminated")]
    UnterminatedName { offset: usize },
    #[error("Field at +{field} of {chunk} chunk (offset {offset}) lies outside its {len} bytes")]
    FieldOutOfBounds {
        chunk: &'static str,
        offset: usize,
        field: usize,
        len: usize,
    },
    #[error("Instrument does not start with a header chunk")]
    MissingHeaderChunk,
    #[error("Zone {zone} references {target} {index}, which does not exist")]
    DanglingReference {
        zone: usize,
        target: &'static str,
        index: usize,
    },
    #[error("Instrument file is too large ({0} bytes)")]
    FileTooLarge(u64),
    #[error("Illegal header '<{0}>'")]
    IllegalHeader(String),
    #[error("Unsupported directive '#{0}'")]
    UnsupportedDirective(String),
    #[error("Malformed text near '{0}'")]
    Syntax(String),
    #[error("Unsupported file format '{0}'. Supported: .exs, .sfz")]
    UnsupportedExtension(String),
}

/// Values that stay out of range after auto-correction, or policy
/// violations such as an overlong name.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Name too long ({len} chars). Maximum allowed: {max} chars")]
    NameTooLong { len: usize, max: usize },
    #[error("{field} {value} lies outside the {frame_count} frames of the sample")]
    PositionOutOfRange {
        field: &'static str,
        value: u64,
        frame_count: u64,
    },
    #[error("{field_a} ({a}) must be below {field_b} ({b})")]
    InvertedRange {
        field_a: &'static str,
        a: u64,
        field_b: &'static str,
        b: u64,
    },
    #[error("Invalid value '{value}' for opcode '{opcode}'")]
    InvalidOpcodeValue { opcode: String, value: String },
    #[error("Invalid note '{0}'")]
    InvalidNote(String),
    #[error("Region defines no pitch (pitch_keycenter or key)")]
    MissingPitch,
    #[error("Region has no sample opcode")]
    MissingSample,
    #[error("Invalid anchor note '{0}'. Use 0-11 or C, C#, Db, D, D#, Eb, E, F, F#, Gb, G, G#, Ab, A, A#, Bb, B, H")]
    InvalidAnchor(String),
    #[error("Thinning factor must be >= 2, got {0}")]
    ThinFactorTooSmall(u8),
    #[error("Thinning by {factor} from anchor {anchor} would remove every zone")]
    ThinningEmpty { factor: u8, anchor: u8 },
    #[error("Instrument has no playable zones")]
    NoZones,
}

/// A sample file referenced by a zone could not be found. Fatal for that
/// zone only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Sample '{sample}' not found (searched {searched} location(s))")]
pub struct MissingResourceError {
    pub sample: String,
    pub searched: usize,
}

pub type Result<T> = std::result::Result<T, ConvertError>;

// --- Diagnostics ---

/// A non-fatal finding: a name-length warning, a bounds auto-correction,
/// a dropped zone and the reason it was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub subject: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.message)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subject: impl Into<String>, message: impl Into<String>) {
        let diagnostic = Diagnostic {
            subject: subject.into(),
            message: message.into(),
        };
        log::warn!("{diagnostic}");
        self.entries.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when any diagnostic about `subject` contains `needle`.
    pub fn mentions(&self, subject: &str, needle: &str) -> bool {
        self.entries
            .iter()
            .any(|d| d.subject == subject && d.message.contains(needle))
    }
}
