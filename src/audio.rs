//! Sample inspection and rendering.
//!
//! Rendering shells out to `ffmpeg` (soxr resampler, 24-bit PCM output);
//! everything that reads audio back goes through `hound`.

use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::{ConvertError, Result};

const OUTPUT_CODEC: &str = "pcm_s24le";
const OUTPUT_BITS: u16 = 24;
/// Gains smaller than this are not worth a second ffmpeg pass.
const MIN_NORMALIZE_GAIN_DB: f64 = 0.1;

/// Install locations checked when a tool is not on `PATH`, which is
/// common for apps launched outside a shell.
#[cfg(target_os = "macos")]
const TOOL_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin"];
#[cfg(windows)]
const TOOL_DIRS: &[&str] = &[
    r"C:\Program Files\ffmpeg\bin",
    r"C:\Program Files (x86)\ffmpeg\bin",
    r"C:\ffmpeg\bin",
    r"C:\tools\ffmpeg\bin",
];
#[cfg(not(any(target_os = "macos", windows)))]
const TOOL_DIRS: &[&str] = &["/usr/local/bin", "/usr/bin"];

fn wav_error(path: &Path, e: hound::Error) -> ConvertError {
    match e {
        hound::Error::IoError(e) => ConvertError::Io(e),
        other => ConvertError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: {other}", path.display()),
        )),
    }
}

// --- Probing ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub rate: u32,
    pub frame_count: Option<u64>,
}

/// Reads a sample's native rate and length without decoding it.
pub trait SampleProbe {
    fn probe(&self, path: &Path) -> Result<SampleInfo>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WavProbe;

impl SampleProbe for WavProbe {
    fn probe(&self, path: &Path) -> Result<SampleInfo> {
        let reader = hound::WavReader::open(path).map_err(|e| wav_error(path, e))?;
        Ok(SampleInfo {
            rate: reader.spec().sample_rate,
            frame_count: Some(u64::from(reader.duration())),
        })
    }
}

// --- PCM ---

/// Mono mix-down of a rendered sample, used to score loop seams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmData {
    pub frames: Vec<i32>,
    pub bits_per_sample: u16,
}

impl PcmData {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn full_scale(&self) -> i64 {
        (1i64 << (self.bits_per_sample.clamp(2, 32) - 1)) - 1
    }
}

pub fn read_pcm(path: &Path) -> Result<PcmData> {
    let mut reader = hound::WavReader::open(path).map_err(|e| wav_error(path, e))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let (interleaved, bits_per_sample): (Vec<i64>, u16) = match spec.sample_format {
        hound::SampleFormat::Int => (
            reader
                .samples::<i32>()
                .map(|s| s.map(i64::from))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| wav_error(path, e))?,
            spec.bits_per_sample,
        ),
        hound::SampleFormat::Float => {
            let scale = f64::from((1i32 << (OUTPUT_BITS - 1)) - 1);
            (
                reader
                    .samples::<f32>()
                    .map(|s| s.map(|v| (f64::from(v).clamp(-1.0, 1.0) * scale).round() as i64))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| wav_error(path, e))?,
                OUTPUT_BITS,
            )
        }
    };

    let frames = interleaved
        .chunks(channels)
        .map(|frame| (frame.iter().sum::<i64>() / frame.len() as i64) as i32)
        .collect();

    Ok(PcmData {
        frames,
        bits_per_sample,
    })
}

// --- Rendering ---

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub source: &'a Path,
    pub dest: &'a Path,
    /// `None` keeps the source rate.
    pub target_rate: Option<u32>,
    /// Peak level to normalize to, in dBFS.
    pub normalize_db: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RenderedSample {
    pub original_rate: u32,
    pub output_rate: u32,
    pub source_frames: Option<u64>,
    pub pcm: PcmData,
    pub normalize_gain_db: Option<f64>,
    /// Problems that did not stop the render.
    pub warnings: Vec<String>,
}

impl RenderedSample {
    pub fn output_frames(&self) -> u64 {
        self.pcm.len() as u64
    }

    pub fn was_resampled(&self) -> bool {
        self.original_rate != self.output_rate
    }

    /// Position scaling factor. The nominal ratio is the rate quotient;
    /// the accurate one is measured from the frame counts ffmpeg actually
    /// produced.
    pub fn resample_ratio(&self, accurate: bool) -> f64 {
        let nominal = f64::from(self.output_rate) / f64::from(self.original_rate.max(1));
        if !accurate || !self.was_resampled() {
            return nominal;
        }
        match self.source_frames {
            Some(source) if source > 0 && !self.pcm.is_empty() => {
                self.output_frames() as f64 / source as f64
            }
            _ => nominal,
        }
    }
}

/// Produces the target-rate file for one zone.
pub trait Resampler {
    fn render(&self, request: &RenderRequest<'_>) -> Result<RenderedSample>;
}

#[derive(Debug, Clone)]
pub struct FfmpegResampler {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegResampler {
    fn default() -> Self {
        let search_path = env::var_os("PATH");
        let dirs: Vec<&Path> = TOOL_DIRS.iter().map(Path::new).collect();
        FfmpegResampler {
            ffmpeg: find_tool("ffmpeg", search_path.as_ref(), &dirs),
            ffprobe: find_tool("ffprobe", search_path.as_ref(), &dirs),
        }
    }
}

/// Bare `name` when it is on `search_path` (or nowhere), else the first
/// install directory holding it.
fn find_tool(name: &str, search_path: Option<&OsString>, dirs: &[&Path]) -> PathBuf {
    let exe = format!("{name}{}", env::consts::EXE_SUFFIX);
    let on_path = search_path
        .is_some_and(|paths| env::split_paths(paths).any(|dir| dir.join(&exe).is_file()));
    if on_path {
        return PathBuf::from(name);
    }
    dirs.iter()
        .map(|dir| dir.join(&exe))
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(name))
}

impl FfmpegResampler {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        FfmpegResampler {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn run(&self, program: &Path, args: &[&OsStr], subject: &Path) -> Result<Output> {
        let output = Command::new(program).args(args).output().map_err(|e| {
            let reason = if e.kind() == io::ErrorKind::NotFound {
                format!("'{}' is not installed or not on PATH", program.display())
            } else {
                e.to_string()
            };
            ConvertError::Resampler {
                path: subject.to_path_buf(),
                reason,
            }
        })?;
        if !output.status.success() {
            return Err(ConvertError::Resampler {
                path: subject.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Fails unless ffmpeg is installed with the soxr resampler.
    pub fn check(&self) -> Result<()> {
        let output = self.run(&self.ffmpeg, &[OsStr::new("-version")], &self.ffmpeg)?;
        if !String::from_utf8_lossy(&output.stdout).contains("--enable-libsoxr") {
            return Err(ConvertError::Resampler {
                path: self.ffmpeg.clone(),
                reason: "ffmpeg is not built with libsoxr".to_string(),
            });
        }
        Ok(())
    }

    fn probe_source(&self, source: &Path) -> Result<SampleInfo> {
        if let Ok(info) = WavProbe.probe(source) {
            return Ok(info);
        }
        let output = self.run(
            &self.ffprobe,
            &[
                OsStr::new("-v"),
                OsStr::new("error"),
                OsStr::new("-select_streams"),
                OsStr::new("a:0"),
                OsStr::new("-show_entries"),
                OsStr::new("stream=sample_rate,duration_ts"),
                OsStr::new("-of"),
                OsStr::new("default=noprint_wrappers=1"),
                source.as_os_str(),
            ],
            source,
        )?;
        let text = String::from_utf8_lossy(&output.stdout);
        let field = |key: &str| {
            text.lines()
                .find_map(|l| l.strip_prefix(key)?.strip_prefix('='))
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        let rate = field("sample_rate").ok_or_else(|| ConvertError::Resampler {
            path: source.to_path_buf(),
            reason: "ffprobe reported no sample rate".to_string(),
        })?;
        Ok(SampleInfo {
            rate: u32::try_from(rate).unwrap_or(u32::MAX),
            frame_count: field("duration_ts"),
        })
    }

    fn peak_db(&self, path: &Path) -> Result<Option<f64>> {
        let output = self.run(
            &self.ffmpeg,
            &[
                OsStr::new("-hide_banner"),
                OsStr::new("-i"),
                path.as_os_str(),
                OsStr::new("-af"),
                OsStr::new("volumedetect"),
                OsStr::new("-f"),
                OsStr::new("null"),
                OsStr::new("-"),
            ],
            path,
        )?;
        Ok(parse_max_volume(&String::from_utf8_lossy(&output.stderr)))
    }

    /// A failed pass keeps the file as rendered and leaves a warning.
    fn normalize_or_warn(
        &self,
        dest: &Path,
        target_db: f64,
        warnings: &mut Vec<String>,
    ) -> Option<f64> {
        match self.normalize(dest, target_db) {
            Ok(gain) => gain,
            Err(e) => {
                warnings.push(format!("not normalized: {e}"));
                None
            }
        }
    }

    fn normalize(&self, dest: &Path, target_db: f64) -> Result<Option<f64>> {
        let Some(peak) = self.peak_db(dest)? else {
            log::warn!("Could not measure peak of {}, not normalizing", dest.display());
            return Ok(None);
        };
        let gain = target_db - peak;
        if gain.abs() < MIN_NORMALIZE_GAIN_DB {
            return Ok(None);
        }

        let scratch = dest.with_extension("norm.wav");
        let filter = format!("volume={gain:.2}dB");
        let pass = self.run(
            &self.ffmpeg,
            &[
                OsStr::new("-y"),
                OsStr::new("-v"),
                OsStr::new("error"),
                OsStr::new("-i"),
                dest.as_os_str(),
                OsStr::new("-af"),
                OsStr::new(&filter),
                OsStr::new("-acodec"),
                OsStr::new(OUTPUT_CODEC),
                scratch.as_os_str(),
            ],
            dest,
        );
        if let Err(e) = pass {
            if let Err(e) = fs::remove_file(&scratch) {
                log::debug!("Could not remove {}: {e}", scratch.display());
            }
            return Err(e);
        }
        fs::rename(&scratch, dest)?;
        log::debug!("Normalized {} by {gain:+.2} dB", dest.display());
        Ok(Some(gain))
    }
}

fn parse_max_volume(stderr: &str) -> Option<f64> {
    stderr.lines().find_map(|line| {
        let value = line.split("max_volume:").nth(1)?;
        value.trim().trim_end_matches("dB").trim().parse().ok()
    })
}

impl Resampler for FfmpegResampler {
    fn render(&self, request: &RenderRequest<'_>) -> Result<RenderedSample> {
        let source = self.probe_source(request.source)?;
        let output_rate = request.target_rate.unwrap_or(source.rate);

        let rate_arg = output_rate.to_string();
        let mut args: Vec<&OsStr> = vec![
            OsStr::new("-y"),
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-i"),
            request.source.as_os_str(),
        ];
        if output_rate != source.rate {
            args.extend([
                OsStr::new("-af"),
                OsStr::new("aresample=resampler=soxr"),
                OsStr::new("-ar"),
                OsStr::new(&rate_arg),
            ]);
        }
        args.extend([
            OsStr::new("-acodec"),
            OsStr::new(OUTPUT_CODEC),
            request.dest.as_os_str(),
        ]);
        self.run(&self.ffmpeg, &args, request.source)?;

        let mut warnings = Vec::new();
        let normalize_gain_db = match request.normalize_db {
            Some(target) => self.normalize_or_warn(request.dest, target, &mut warnings),
            None => None,
        };

        Ok(RenderedSample {
            original_rate: source.rate,
            output_rate,
            source_frames: source.frame_count,
            pcm: read_pcm(request.dest)?,
            normalize_gain_db,
            warnings,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn write_wav(path: &Path, rate: u32, frames: &[i32]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 24,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for frame in frames {
            writer.write_sample(*frame).unwrap();
        }
        writer.finalize().unwrap();
    }

    /// Renders by nearest-neighbour decimation/duplication, so tests can
    /// run without ffmpeg.
    #[derive(Debug, Default)]
    pub struct NearestResampler;

    impl Resampler for NearestResampler {
        fn render(&self, request: &RenderRequest<'_>) -> Result<RenderedSample> {
            let source = read_pcm(request.source)?;
            let original_rate = WavProbe.probe(request.source)?.rate;
            let output_rate = request.target_rate.unwrap_or(original_rate);
            let ratio = f64::from(output_rate) / f64::from(original_rate);
            let out_len = (source.len() as f64 * ratio).round() as usize;
            let frames: Vec<i32> = (0..out_len)
                .map(|i| {
                    let src = ((i as f64 / ratio) as usize).min(source.len().saturating_sub(1));
                    source.frames[src]
                })
                .collect();
            write_wav(request.dest, output_rate, &frames);
            Ok(RenderedSample {
                original_rate,
                output_rate,
                source_frames: Some(source.len() as u64),
                pcm: PcmData {
                    frames,
                    bits_per_sample: 24,
                },
                normalize_gain_db: None,
                warnings: Vec::new(),
            })
        }
    }
}
