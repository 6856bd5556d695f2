//! Maps decoded source records onto the canonical zone model.
//!
//! Each source format has its own case of [`SourceRecord`]; everything
//! after [`map_zone`] is format independent. Zone-level failures
//! (validation, missing samples) drop the zone with a diagnostic and the
//! rest of the instrument carries on. Format errors abort the instrument.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::audio::{SampleInfo, SampleProbe};
use crate::config::ConvertConfig;
use crate::error::{
    ConvertError, Diagnostics, FormatError, MissingResourceError, Result, ValidationError,
};
use crate::exs::{ExsDocument, GroupRecord, SampleRecord, ZoneRecord};
use crate::locate::{SampleLocator, SampleQuery};
use crate::sfz::{OpcodeMap, SfzDocument, parse_note};
use crate::zone::{Crossfade, Instrument, LoopRegion, ZoneData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Exs,
    Sfz,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> std::result::Result<Self, FormatError> {
        let extension = path
            .extension()
            .and_then(OsStr::to_str)
            .map(str::to_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "exs" => Ok(SourceFormat::Exs),
            "sfz" => Ok(SourceFormat::Sfz),
            _ => Err(FormatError::UnsupportedExtension(format!(".{extension}"))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SourceFormat::Exs => "exs",
            SourceFormat::Sfz => "sfz",
        }
    }
}

/// One zone as the source format describes it.
#[derive(Debug)]
pub enum SourceRecord<'a> {
    Exs {
        index: usize,
        zone_name: &'a str,
        zone: &'a ZoneRecord,
        group: Option<&'a GroupRecord>,
        sample_name: &'a str,
        sample: &'a SampleRecord,
        source: &'a std::result::Result<PathBuf, MissingResourceError>,
    },
    Sfz {
        index: usize,
        region: &'a OpcodeMap,
        default_path: Option<&'a str>,
    },
}

/// Everything a mapping needs besides the record itself.
pub struct MappingContext<'a> {
    pub config: &'a ConvertConfig,
    pub locator: &'a dyn SampleLocator,
    pub probe: &'a dyn SampleProbe,
    pub instrument_dir: &'a Path,
    pub instrument_stem: &'a str,
    pub diagnostics: Diagnostics,
}

impl MappingContext<'_> {
    fn locate(
        &self,
        stored_path: Option<&str>,
        file_name: &str,
    ) -> std::result::Result<PathBuf, MissingResourceError> {
        self.locator.locate(&SampleQuery {
            stored_path,
            file_name,
            instrument_dir: self.instrument_dir,
            instrument_stem: self.instrument_stem,
        })
    }

    fn probe_or_fallback(&mut self, path: &Path, subject: &str) -> SampleInfo {
        match self.probe.probe(path) {
            Ok(info) => info,
            Err(e) => {
                self.diagnostics.push(
                    subject,
                    format!(
                        "cannot read sample header ({e}), assuming {} Hz",
                        self.config.fallback_rate
                    ),
                );
                SampleInfo {
                    rate: self.config.fallback_rate,
                    frame_count: None,
                }
            }
        }
    }
}

/// Enforces the name-length policy on the final (prefixed) name.
pub fn validate_name(
    name: &str,
    config: &ConvertConfig,
    diagnostics: &mut Diagnostics,
) -> std::result::Result<(), ValidationError> {
    let len = name.chars().count();
    if len > config.name_error_len {
        return Err(ValidationError::NameTooLong {
            len,
            max: config.name_error_len,
        });
    }
    if len > config.name_warn_len {
        diagnostics.push(
            name,
            format!(
                "name is {len} chars, longer than the {} the device displays",
                config.name_warn_len
            ),
        );
    }
    Ok(())
}

pub fn map_zone(record: &SourceRecord<'_>, ctx: &mut MappingContext<'_>) -> Result<ZoneData> {
    let zone = match record {
        SourceRecord::Exs {
            index,
            zone_name,
            zone,
            group,
            sample_name,
            sample,
            source,
        } => map_exs_zone(*index, zone_name, zone, *group, sample_name, sample, source, ctx)?,
        SourceRecord::Sfz {
            region,
            default_path,
            ..
        } => map_sfz_region(region, *default_path, ctx)?,
    };
    normalize_bounds(zone, &mut ctx.diagnostics)
}

fn record_label(record: &SourceRecord<'_>) -> String {
    match record {
        SourceRecord::Exs {
            zone_name, index, ..
        } if zone_name.is_empty() => format!("zone {index}"),
        SourceRecord::Exs { zone_name, .. } => zone_name.to_string(),
        SourceRecord::Sfz { region, index, .. } => region
            .get("sample")
            .cloned()
            .unwrap_or_else(|| format!("region {index}")),
    }
}

fn collect(
    name: &str,
    records: Vec<SourceRecord<'_>>,
    ctx: &mut MappingContext<'_>,
) -> Result<Instrument> {
    let mut zones = Vec::with_capacity(records.len());
    for record in &records {
        match map_zone(record, ctx) {
            Ok(zone) => zones.push(zone),
            Err(e @ (ConvertError::Validation(_) | ConvertError::MissingResource(_))) => {
                ctx.diagnostics
                    .push(record_label(record), format!("zone dropped: {e}"));
            }
            Err(e) => return Err(e),
        }
    }
    if zones.is_empty() {
        return Err(ValidationError::NoZones.into());
    }
    log::info!("Mapped {} of {} zones", zones.len(), records.len());
    Ok(Instrument::new(name, zones))
}

// --- EXS ---

pub fn map_exs(doc: &ExsDocument, ctx: &mut MappingContext<'_>) -> Result<Instrument> {
    let groups = doc.groups();
    let samples = doc.samples();

    // Resolve each sample once; several zones usually share one.
    let sources: Vec<_> = samples
        .iter()
        .map(|(chunk, sample)| {
            let file_name = sample.file_name.as_deref().unwrap_or(&chunk.name);
            ctx.locate(sample.file_path.as_deref(), file_name)
        })
        .collect();

    let mut records = Vec::new();
    for (index, (chunk, zone)) in doc.zones().enumerate() {
        let sample_index = zone.sample_index as usize;
        let Some(&(sample_chunk, sample)) = samples.get(sample_index) else {
            return Err(FormatError::DanglingReference {
                zone: index,
                target: "sample",
                index: sample_index,
            }
            .into());
        };
        // Negative group indices refer to the last group.
        let group = if zone.group < 0 {
            groups.last().copied()
        } else {
            groups.get(zone.group as usize).copied()
        };
        records.push(SourceRecord::Exs {
            index,
            zone_name: &chunk.name,
            zone,
            group,
            sample_name: sample
                .file_name
                .as_deref()
                .unwrap_or(sample_chunk.name.as_str()),
            sample,
            source: &sources[sample_index],
        });
    }

    let name = ctx.instrument_stem.to_string();
    collect(&name, records, ctx)
}

fn non_negative(field: &'static str, value: i32) -> std::result::Result<u64, ValidationError> {
    u64::try_from(value).map_err(|_| ValidationError::InvalidOpcodeValue {
        opcode: field.to_string(),
        value: value.to_string(),
    })
}

#[allow(clippy::too_many_arguments)]
fn map_exs_zone(
    index: usize,
    zone_name: &str,
    zone: &ZoneRecord,
    group: Option<&GroupRecord>,
    sample_name: &str,
    sample: &SampleRecord,
    source: &std::result::Result<PathBuf, MissingResourceError>,
    ctx: &mut MappingContext<'_>,
) -> Result<ZoneData> {
    let source_path = source.clone()?;
    if zone.root_note > 127 {
        return Err(ValidationError::InvalidNote(zone.root_note.to_string()).into());
    }

    let subject = if zone_name.is_empty() {
        format!("zone {index}")
    } else {
        zone_name.to_string()
    };
    let (rate, frame_count) = match (u32::try_from(sample.rate), u64::try_from(sample.length)) {
        (Ok(rate), Ok(length)) if rate > 0 && length > 0 => (rate, Some(length)),
        _ => {
            let info = ctx.probe_or_fallback(&source_path, &subject);
            (info.rate, info.frame_count)
        }
    };

    let looping = if zone.loop_enabled() {
        let crossfade = Crossfade::Milliseconds(zone.loop_crossfade_ms.max(0).unsigned_abs());
        Some(LoopRegion {
            start: non_negative("loop_start", zone.loop_start)?,
            end: non_negative("loop_end", zone.loop_end)?,
            crossfade,
            crossfade_samples: crossfade.samples_at(rate),
        })
    } else {
        None
    };

    Ok(ZoneData {
        pitch: zone.root_note,
        key_center: f64::from(zone.root_note),
        min_velocity: zone.velocity_low.min(127),
        max_velocity: zone.velocity_high.min(127),
        source_path,
        sample_name: sample_name.to_string(),
        trim_start: u64::try_from(zone.sample_start).ok().filter(|v| *v > 0),
        trim_end: u64::try_from(zone.sample_end).ok().filter(|v| *v > 0),
        looping,
        keep_looping_on_release: !zone.play_to_end_on_release(),
        round_robin_position: group.and_then(GroupRecord::round_robin_position),
        original_rate: rate,
        frame_count,
        velocity_layer_index: 0,
        output_filename: None,
        resample_ratio: 1.0,
        output_rate: None,
    })
}

// --- SFZ ---

pub fn map_sfz(doc: &SfzDocument, ctx: &mut MappingContext<'_>) -> Result<Instrument> {
    let default_path = doc.default_path();
    let records = doc
        .regions
        .iter()
        .enumerate()
        .map(|(index, region)| SourceRecord::Sfz {
            index,
            region,
            default_path: default_path.as_deref(),
        })
        .collect();
    let name = ctx.instrument_stem.to_string();
    collect(&name, records, ctx)
}

fn invalid(opcode: &str, value: &str) -> ValidationError {
    ValidationError::InvalidOpcodeValue {
        opcode: opcode.to_string(),
        value: value.to_string(),
    }
}

/// First present opcode among `names` (aliases), parsed as `T`.
fn opcode<T: FromStr>(
    region: &OpcodeMap,
    names: &[&str],
) -> std::result::Result<Option<T>, ValidationError> {
    let Some((name, value)) = names
        .iter()
        .find_map(|n| region.get(*n).map(|v| (*n, v.trim())))
    else {
        return Ok(None);
    };
    value.parse().map(Some).map_err(|_| invalid(name, value))
}

/// Integer opcode, also accepting integral floats such as `100.0`.
fn int_opcode(region: &OpcodeMap, names: &[&str]) -> std::result::Result<Option<i64>, ValidationError> {
    match opcode::<i64>(region, names) {
        Ok(v) => Ok(v),
        Err(e) => match opcode::<f64>(region, names)? {
            Some(f) if f.fract() == 0.0 && f.is_finite() => Ok(Some(f as i64)),
            _ => Err(e),
        },
    }
}

fn velocity_opcode(
    region: &OpcodeMap,
    name: &str,
    default: u8,
) -> std::result::Result<u8, ValidationError> {
    match int_opcode(region, &[name])? {
        None => Ok(default),
        Some(v) => u8::try_from(v)
            .ok()
            .filter(|v| *v <= 127)
            .ok_or_else(|| invalid(name, &v.to_string())),
    }
}

fn note_opcode(region: &OpcodeMap, name: &str) -> std::result::Result<Option<u8>, ValidationError> {
    match region.get(name) {
        None => Ok(None),
        Some(value) => parse_note(value)
            .map(Some)
            .ok_or_else(|| ValidationError::InvalidNote(value.clone())),
    }
}

fn map_sfz_region(
    region: &OpcodeMap,
    default_path: Option<&str>,
    ctx: &mut MappingContext<'_>,
) -> Result<ZoneData> {
    let stored = region
        .get("sample")
        .map(|s| s.trim().replace('\\', "/"))
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::MissingSample)?;
    let stored = match default_path {
        Some(prefix) => format!("{prefix}{stored}"),
        None => stored,
    };
    let file_name = stored.rsplit('/').next().unwrap_or(&stored).to_string();

    let pitch = match note_opcode(region, "pitch_keycenter")? {
        Some(pitch) => pitch,
        None => note_opcode(region, "key")?.ok_or(ValidationError::MissingPitch)?,
    };
    let transpose = int_opcode(region, &["transpose"])?.unwrap_or(0);
    let min_velocity = velocity_opcode(region, "lovel", 0)?;
    let max_velocity = velocity_opcode(region, "hivel", 127)?;

    let round_robin_position = match int_opcode(region, &["seq_position"])? {
        Some(position) if position >= 1 => u32::try_from(position - 1).ok(),
        _ => None,
    };

    let (looping, keep_looping_on_release) = match region
        .get("loop_mode")
        .or_else(|| region.get("loopmode"))
        .map(|m| m.trim())
    {
        None | Some("no_loop") | Some("one_shot") => (false, false),
        Some("loop_continuous") => (true, true),
        Some("loop_sustain") => (true, false),
        Some(other) => return Err(invalid("loop_mode", other).into()),
    };

    let source_path = ctx.locate(Some(&stored), &file_name)?;
    let info = ctx.probe_or_fallback(&source_path, &file_name);

    let position = |names: &[&str]| -> std::result::Result<Option<u64>, ValidationError> {
        Ok(int_opcode(region, names)?.and_then(|v| u64::try_from(v).ok()))
    };

    let looping = if looping {
        let start = position(&["loop_start", "loopstart"])?.unwrap_or(0);
        let end = position(&["loop_end", "loopend"])?.unwrap_or(0);
        if start == 0 && end == 0 {
            ctx.diagnostics
                .push(&file_name, "loop mode set without loop points, loop disabled");
            None
        } else {
            let seconds = opcode::<f64>(region, &["loop_crossfade"])?.unwrap_or(0.0);
            if seconds < 0.0 || !seconds.is_finite() {
                return Err(invalid("loop_crossfade", &seconds.to_string()).into());
            }
            let crossfade = Crossfade::Seconds(seconds);
            Some(LoopRegion {
                start,
                end,
                crossfade,
                crossfade_samples: crossfade.samples_at(info.rate),
            })
        }
    } else {
        None
    };

    Ok(ZoneData {
        pitch,
        key_center: f64::from(pitch) - transpose as f64,
        min_velocity,
        max_velocity,
        source_path,
        sample_name: file_name,
        trim_start: position(&["offset"])?.filter(|v| *v > 0),
        trim_end: position(&["end"])?.filter(|v| *v > 0),
        looping,
        keep_looping_on_release,
        round_robin_position,
        original_rate: info.rate,
        frame_count: info.frame_count,
        velocity_layer_index: 0,
        output_filename: None,
        resample_ratio: 1.0,
        output_rate: None,
    })
}

// --- Bounds ---

/// Pulls positions inside the sample where a correction exists, and
/// rejects the zone where none does.
pub fn normalize_bounds(mut zone: ZoneData, diagnostics: &mut Diagnostics) -> Result<ZoneData> {
    let label = zone.sample_name.clone();

    if let Some(frame_count) = zone.frame_count {
        if let Some(start) = zone.trim_start.filter(|s| *s >= frame_count) {
            return Err(ValidationError::PositionOutOfRange {
                field: "trim_start",
                value: start,
                frame_count,
            }
            .into());
        }
        if let Some(end) = zone.trim_end.filter(|e| *e >= frame_count) {
            diagnostics.push(
                &label,
                format!("trim-end {end} is past the last frame ({frame_count}), omitted"),
            );
            zone.trim_end = None;
        }
        if let Some(region) = zone.looping.as_mut() {
            if region.start >= frame_count {
                return Err(ValidationError::PositionOutOfRange {
                    field: "loop_start",
                    value: region.start,
                    frame_count,
                }
                .into());
            }
            if region.end >= frame_count {
                let clamped = frame_count - 1;
                diagnostics.push(
                    &label,
                    format!("loop-end {} clamped to {clamped}", region.end),
                );
                region.end = clamped;
            }
        }
    }

    if let (Some(start), Some(end)) = (zone.trim_start, zone.trim_end) {
        if start > end {
            return Err(ValidationError::InvertedRange {
                field_a: "trim_start",
                a: start,
                field_b: "trim_end",
                b: end,
            }
            .into());
        }
    }
    if let Some(region) = &zone.looping {
        if region.start >= region.end {
            return Err(ValidationError::InvertedRange {
                field_a: "loop_start",
                a: region.start,
                field_b: "loop_end",
                b: region.end,
            }
            .into());
        }
    }
    Ok(zone)
}
