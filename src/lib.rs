//! EXS24 and SFZ instruments to Elektron multi-sample (`.elmulti`)
//! mappings.

pub mod audio;
pub mod config;
pub mod error;
pub mod exs;
pub mod locate;
pub mod loops;
pub mod mapper;
pub mod pipeline;
pub mod riff;
pub mod sfz;
pub mod thin;
pub mod writer;
pub mod zone;

pub use audio::{FfmpegResampler, RenderRequest, RenderedSample, Resampler, SampleProbe, WavProbe};
pub use config::{ConvertConfig, ThinConfig};
pub use error::{ConvertError, Diagnostics, FormatError, MissingResourceError, ValidationError};
pub use locate::{FsSampleLocator, SampleLocator};
pub use mapper::SourceFormat;
pub use pipeline::{ConversionReport, ConversionStats, Converter};
pub use riff::{SamplerInfo, embed_smpl_chunk, read_smpl_chunk};
pub use thin::parse_anchor;
pub use writer::{ElmultiWriter, InstrumentFormat};
pub use zone::{Crossfade, Instrument, ZoneData};
