//! One instrument from source file to `.elmulti` folder.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::audio::{FfmpegResampler, RenderRequest, Resampler, SampleProbe, WavProbe};
use crate::config::{ConvertConfig, sanitize_filename};
use crate::error::{ConvertError, Diagnostics, Result, ValidationError};
use crate::exs::read_exs_file;
use crate::locate::{FsSampleLocator, SampleLocator};
use crate::loops::{LoopClass, optimize_zone};
use crate::mapper::{MappingContext, SourceFormat, map_exs, map_sfz, validate_name};
use crate::riff::{SamplerInfo, embed_smpl_chunk};
use crate::sfz::read_sfz_file;
use crate::thin::{SampleMapAnalysis, ThinPlan, analyze, apply, plan};
use crate::writer::{ElmultiWriter, InstrumentFormat};
use crate::zone::Instrument;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThinSummary {
    pub instruments: usize,
    pub zones_before: usize,
    pub zones_after: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ConversionStats {
    pub files_processed: usize,
    pub files_failed: usize,
    pub samples_rendered: usize,
    pub samples_resampled: usize,
    pub samples_normalized: usize,
    pub samples_embedded: usize,
    pub loops_with_loop: usize,
    pub loops_without_loop: usize,
    pub loops_single_cycle: usize,
    pub loops_normal: usize,
    pub loops_optimized: usize,
    pub thinning: Option<ThinSummary>,
    pub diagnostics: Diagnostics,
}

impl ConversionStats {
    pub fn merge(&mut self, other: ConversionStats) {
        self.files_processed += other.files_processed;
        self.files_failed += other.files_failed;
        self.samples_rendered += other.samples_rendered;
        self.samples_resampled += other.samples_resampled;
        self.samples_normalized += other.samples_normalized;
        self.samples_embedded += other.samples_embedded;
        self.loops_with_loop += other.loops_with_loop;
        self.loops_without_loop += other.loops_without_loop;
        self.loops_single_cycle += other.loops_single_cycle;
        self.loops_normal += other.loops_normal;
        self.loops_optimized += other.loops_optimized;
        if let Some(thin) = other.thinning {
            let total = self.thinning.get_or_insert_with(ThinSummary::default);
            total.instruments += thin.instruments;
            total.zones_before += thin.zones_before;
            total.zones_after += thin.zones_after;
        }
        self.diagnostics.extend(other.diagnostics);
    }
}

impl fmt::Display for ConversionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Conversion summary")?;
        writeln!(
            f,
            "  Files:   {} converted, {} failed",
            self.files_processed, self.files_failed
        )?;
        writeln!(
            f,
            "  Samples: {} rendered, {} resampled, {} normalized, {} with smpl chunk",
            self.samples_rendered,
            self.samples_resampled,
            self.samples_normalized,
            self.samples_embedded
        )?;
        writeln!(
            f,
            "  Loops:   {} looped ({} single-cycle, {} normal, {} optimized), {} one-shot",
            self.loops_with_loop,
            self.loops_single_cycle,
            self.loops_normal,
            self.loops_optimized,
            self.loops_without_loop
        )?;
        if let Some(thin) = &self.thinning {
            writeln!(
                f,
                "  Thinned: {} instrument(s), {} -> {} zones",
                thin.instruments, thin.zones_before, thin.zones_after
            )?;
        }
        write!(f, "  Warnings: {}", self.diagnostics.len())?;
        for diagnostic in self.diagnostics.iter() {
            write!(f, "\n    {diagnostic}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct LoadedInstrument {
    pub format: SourceFormat,
    pub instrument: Instrument,
    pub diagnostics: Diagnostics,
}

#[derive(Debug)]
pub struct ConversionReport {
    pub output_dir: PathBuf,
    pub elmulti_path: PathBuf,
    pub stats: ConversionStats,
}

pub struct Converter {
    config: ConvertConfig,
    locator: Box<dyn SampleLocator>,
    probe: Box<dyn SampleProbe>,
    resampler: Box<dyn Resampler>,
}

impl Converter {
    pub fn new(config: ConvertConfig) -> Self {
        Converter {
            config,
            locator: Box::new(FsSampleLocator),
            probe: Box::new(WavProbe),
            resampler: Box::new(FfmpegResampler::default()),
        }
    }

    pub fn with_resampler(mut self, resampler: impl Resampler + 'static) -> Self {
        self.resampler = Box::new(resampler);
        self
    }

    pub fn with_locator(mut self, locator: impl SampleLocator + 'static) -> Self {
        self.locator = Box::new(locator);
        self
    }

    pub fn with_probe(mut self, probe: impl SampleProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    /// Decodes and maps an instrument. Nothing is rendered.
    pub fn load(&self, path: &Path) -> Result<LoadedInstrument> {
        let format = SourceFormat::from_path(path)?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let dir = path.parent().unwrap_or(Path::new("."));

        let mut ctx = MappingContext {
            config: &self.config,
            locator: self.locator.as_ref(),
            probe: self.probe.as_ref(),
            instrument_dir: dir,
            instrument_stem: &stem,
            diagnostics: Diagnostics::new(),
        };
        validate_name(&self.config.display_name(&stem), &self.config, &mut ctx.diagnostics)?;

        log::info!("Loading {}", path.display());
        let instrument = match format {
            SourceFormat::Exs => {
                let doc = read_exs_file(path, &self.config)?;
                map_exs(&doc, &mut ctx)?
            }
            SourceFormat::Sfz => {
                let doc = read_sfz_file(path)?;
                map_sfz(&doc, &mut ctx)?
            }
        };

        Ok(LoadedInstrument {
            format,
            instrument,
            diagnostics: ctx.diagnostics,
        })
    }

    /// Thinning preview: loads the instrument and plans without writing.
    pub fn preview_thinning(&self, path: &Path) -> Result<(SampleMapAnalysis, Option<ThinPlan>)> {
        let loaded = self.load(path)?;
        let analysis = analyze(&loaded.instrument);
        let thin_plan = match &self.config.thin {
            Some(thin) => Some(plan(&loaded.instrument, thin)?),
            None => None,
        };
        Ok((analysis, thin_plan))
    }

    /// Converts one instrument into `<output_root>/<name>/`.
    pub fn convert(&self, path: &Path, output_root: &Path) -> Result<ConversionReport> {
        let LoadedInstrument {
            mut instrument,
            diagnostics,
            ..
        } = self.load(path)?;
        let mut stats = ConversionStats {
            diagnostics,
            ..ConversionStats::default()
        };

        if let Some(thin) = &self.config.thin {
            let thin_plan = plan(&instrument, thin)?;
            apply(&mut instrument, &thin_plan);
            for (low, high) in &thin_plan.selection.uncapped {
                stats.diagnostics.push(
                    &instrument.name,
                    format!("thinning gap {low}-{high} exceeds the max interval"),
                );
            }
            stats.thinning = Some(ThinSummary {
                instruments: 1,
                zones_before: thin_plan.original_zones,
                zones_after: thin_plan.retained_zones,
            });
        }

        let display_name = self.config.display_name(&instrument.name);
        let safe_name = sanitize_filename(&display_name);
        instrument.name = display_name;
        instrument.assign_output_names(&safe_name);

        let output_dir = output_root.join(&safe_name);
        fs::create_dir_all(&output_dir)?;

        let mut dropped = Vec::new();
        for zone in instrument.zones_mut() {
            let filename = zone.label().to_string();
            let dest = output_dir.join(&filename);
            log::debug!("Rendering {} -> {}", zone.source_path.display(), dest.display());
            let rendered = self.resampler.render(&RenderRequest {
                source: &zone.source_path,
                dest: &dest,
                target_rate: self.config.target_rate,
                normalize_db: self.config.normalize_db,
            })?;

            stats.samples_rendered += 1;
            if rendered.was_resampled() {
                stats.samples_resampled += 1;
            }
            if rendered.normalize_gain_db.is_some() {
                stats.samples_normalized += 1;
            }
            for warning in &rendered.warnings {
                stats.diagnostics.push(&filename, warning.as_str());
            }

            let ratio = rendered.resample_ratio(self.config.accurate_ratio);
            let frames = rendered.output_frames();
            zone.resample_ratio = ratio;
            zone.output_rate = Some(rendered.output_rate);
            zone.frame_count = Some(frames);

            zone.trim_start = zone
                .trim_start
                .map(|p| self.config.scale_position(p, ratio))
                .filter(|p| *p > 0);
            if let Some(start) = zone.trim_start.filter(|s| *s >= frames) {
                stats.diagnostics.push(
                    &filename,
                    format!("trim-start {start} is past the last frame ({frames}), omitted"),
                );
                zone.trim_start = None;
            }
            zone.trim_end = zone.trim_end.map(|p| self.config.scale_position(p, ratio));
            if let Some(end) = zone.trim_end.filter(|e| *e >= frames) {
                stats.diagnostics.push(
                    &filename,
                    format!("trim-end {end} is past the last frame ({frames}), omitted"),
                );
                zone.trim_end = None;
            }

            match optimize_zone(zone, &rendered.pcm, &self.config, &mut stats.diagnostics) {
                Ok(Some(outcome)) => {
                    stats.loops_with_loop += 1;
                    match outcome.class {
                        LoopClass::SingleCycle => stats.loops_single_cycle += 1,
                        LoopClass::Normal => stats.loops_normal += 1,
                    }
                    if outcome.optimized {
                        stats.loops_optimized += 1;
                    }
                }
                Ok(None) => stats.loops_without_loop += 1,
                Err(e) => {
                    stats
                        .diagnostics
                        .push(&filename, format!("zone dropped: {e}"));
                    if let Err(e) = fs::remove_file(&dest) {
                        log::debug!("Could not remove {}: {e}", dest.display());
                    }
                    dropped.push(filename);
                    continue;
                }
            }

            if self.config.embed_loop {
                let sampler = SamplerInfo {
                    unity_note: zone.key_center,
                    sample_loop: zone.looping.as_ref().map(|l| (l.start, l.end)),
                };
                match embed_smpl_chunk(&dest, &sampler) {
                    Ok(()) => stats.samples_embedded += 1,
                    Err(e) => stats
                        .diagnostics
                        .push(&filename, format!("smpl chunk not written: {e}")),
                }
            }
        }

        if !dropped.is_empty() {
            instrument.retain(|z| !dropped.iter().any(|d| d == z.label()));
        }
        if instrument.is_empty() {
            return Err(ConvertError::Validation(ValidationError::NoZones));
        }

        let writer = ElmultiWriter;
        let elmulti_path = output_dir.join(format!("{safe_name}.{}", writer.file_extension()));
        fs::write(&elmulti_path, writer.render(&instrument))?;
        log::info!(
            "Wrote {} ({} zones)",
            elmulti_path.display(),
            instrument.zones().len()
        );

        stats.files_processed = 1;
        Ok(ConversionReport {
            output_dir,
            elmulti_path,
            stats,
        })
    }
}
