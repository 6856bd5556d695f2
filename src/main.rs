use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use rusty_elmulti::{
    ConversionStats, ConvertConfig, ConvertError, Converter, FfmpegResampler, SourceFormat,
    ThinConfig, parse_anchor,
};

#[derive(Parser)]
#[command(
    version,
    about = "Converts EXS24 and SFZ instruments to Elektron multi-sample mappings",
    after_help = "Writes one folder per instrument holding the .elmulti file and its WAV samples."
)]
struct Args {
    /// Instrument files (.exs, .sfz) or directories to scan for them
    #[arg(required = true, num_args = 1..)]
    inputs: Vec<PathBuf>,
    /// Output directory for .elmulti and WAV files
    output_dir: PathBuf,
    /// Resample to this rate in Hz
    #[arg(short = 'R', long, default_value_t = 48_000, value_name = "RATE")]
    resample_rate: u32,
    /// Keep each sample's original rate
    #[arg(long)]
    no_resample: bool,
    /// Round scaled loop points instead of truncating them
    #[arg(long)]
    round_loop: bool,
    /// Derive the resample ratio from rendered frame counts
    #[arg(long)]
    use_accurate_ratio: bool,
    /// Search for seamless loop points after resampling
    #[arg(short = 'O', long)]
    optimize_loop: bool,
    /// Frames to search in each direction when optimizing loops
    #[arg(long, default_value_t = 5, value_name = "N")]
    loop_search_range: usize,
    /// Longest loop treated as a single-cycle waveform (0 disables)
    #[arg(long, default_value_t = 512, value_name = "N")]
    single_cycle_threshold: usize,
    /// Disable single-cycle waveform handling
    #[arg(long)]
    no_single_cycle: bool,
    /// Prefix for the instrument name and sample file names
    #[arg(long, default_value = "", value_name = "PREFIX")]
    prefix: String,
    /// Peak-normalize samples to this level in dBFS (0 dB when no value)
    #[arg(
        short = 'N',
        long,
        num_args = 0..=1,
        default_missing_value = "0.0",
        allow_negative_numbers = true,
        value_name = "DB"
    )]
    normalize: Option<f64>,
    /// Do not write root key and loop points into the WAV files
    #[arg(long)]
    no_embed_loop: bool,
    /// Keep one of every N sampled pitches
    #[arg(short = 'T', long, value_name = "N")]
    thin: Option<u8>,
    /// Show what thinning would do without converting
    #[arg(long)]
    thin_preview: bool,
    /// Never leave more than N semitones between kept pitches
    #[arg(long, value_name = "N")]
    thin_max_interval: Option<u8>,
    /// Pitch class thinning counts from (0-11 or C, C#, Db, ...)
    #[arg(long, default_value = "C", value_name = "NOTE")]
    thin_anchor: String,
    /// Show extra debugging info
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> Result<ConvertConfig, ConvertError> {
        let thin = match self.thin {
            Some(factor) => Some(ThinConfig {
                factor,
                anchor: parse_anchor(&self.thin_anchor)?,
                max_interval: self.thin_max_interval,
            }),
            None => None,
        };
        Ok(ConvertConfig {
            target_rate: (!self.no_resample).then_some(self.resample_rate),
            round_loop_points: self.round_loop,
            accurate_ratio: self.use_accurate_ratio,
            optimize_loops: self.optimize_loop,
            loop_search_range: self.loop_search_range,
            single_cycle_threshold: if self.no_single_cycle {
                0
            } else {
                self.single_cycle_threshold
            },
            prefix: self.prefix.clone(),
            normalize_db: self.normalize,
            embed_loop: !self.no_embed_loop,
            thin,
            ..ConvertConfig::default()
        })
    }
}

/// Expands directories into the instruments they directly contain.
fn collect_inputs(inputs: &[PathBuf], output_dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for input in inputs {
        if input == output_dir {
            continue;
        }
        if !input.is_dir() {
            files.push(input.clone());
            continue;
        }
        match fs::read_dir(input) {
            Ok(entries) => {
                let mut found: Vec<PathBuf> = entries
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| p.is_file() && SourceFormat::from_path(p).is_ok())
                    .collect();
                if found.is_empty() {
                    log::warn!("No .exs or .sfz files in {}", input.display());
                }
                found.sort();
                files.extend(found);
            }
            Err(e) => log::error!("Cannot read {}: {e}", input.display()),
        }
    }
    files
}

fn preview(converter: &Converter, files: &[PathBuf]) -> bool {
    let mut ok = true;
    for file in files {
        match converter.preview_thinning(file) {
            Ok((analysis, plan)) => {
                println!("{}", file.display());
                println!(
                    "  {} zones on {} pitches, typical interval {}, {} velocity layer(s){}",
                    analysis.zone_count,
                    analysis.unique_pitches.len(),
                    analysis
                        .typical_interval
                        .map(|i| i.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    analysis.velocity_layers,
                    if analysis.has_round_robin {
                        ", round-robin"
                    } else {
                        ""
                    }
                );
                if let Some(plan) = plan {
                    println!("{plan}");
                }
            }
            Err(e) => {
                log::error!("{}: {e}", file.display());
                ok = false;
            }
        }
    }
    ok
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        true => log::LevelFilter::Debug,
        false => log::LevelFilter::Info,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_env("RUST_LOG")
        .init();

    let config = match args.config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let files = collect_inputs(&args.inputs, &args.output_dir);
    if files.is_empty() {
        log::error!("No instruments to convert");
        return ExitCode::FAILURE;
    }

    let converter = Converter::new(config);
    if args.thin_preview {
        return match preview(&converter, &files) {
            true => ExitCode::SUCCESS,
            false => ExitCode::FAILURE,
        };
    }

    if let Err(e) = FfmpegResampler::default().check() {
        log::error!("{e}");
        return ExitCode::FAILURE;
    }

    let mut total = ConversionStats::default();
    for file in &files {
        match converter.convert(file, &args.output_dir) {
            Ok(report) => {
                log::info!("{} -> {}", file.display(), report.elmulti_path.display());
                total.merge(report.stats);
            }
            Err(e) => {
                log::error!("{}: {e}", file.display());
                total.files_failed += 1;
            }
        }
    }

    println!("{total}");
    match total.files_failed {
        0 => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
