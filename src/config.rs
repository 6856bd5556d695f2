//! Conversion settings shared by every stage of the pipeline.

/// Characters that cannot appear in output file names on any platform.
pub const INVALID_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Settings for one conversion run. Built once (by the CLI or a caller)
/// and passed by reference; never mutated while a pipeline is running.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertConfig {
    /// Output sample rate. `None` keeps each sample's original rate.
    pub target_rate: Option<u32>,
    /// Round scaled positions instead of truncating them.
    pub round_loop_points: bool,
    /// Derive the resample ratio from measured frame counts.
    pub accurate_ratio: bool,
    /// Run the bounded loop-point search on normal loops.
    pub optimize_loops: bool,
    pub loop_search_range: usize,
    /// Loops at or below this length are single-cycle. 0 disables.
    pub single_cycle_threshold: usize,
    pub prefix: String,
    pub normalize_db: Option<f64>,
    /// Write root key and loop points into each rendered WAV's `smpl`
    /// chunk.
    pub embed_loop: bool,
    pub thin: Option<ThinConfig>,
    pub name_warn_len: usize,
    pub name_error_len: usize,
    /// Rate assumed when a sample file cannot be probed.
    pub fallback_rate: u32,
    pub max_binary_size: u64,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        ConvertConfig {
            target_rate: Some(48_000),
            round_loop_points: false,
            accurate_ratio: false,
            optimize_loops: false,
            loop_search_range: 5,
            single_cycle_threshold: 512,
            prefix: String::new(),
            normalize_db: None,
            embed_loop: true,
            thin: None,
            name_warn_len: 24,
            name_error_len: 64,
            fallback_rate: 44_100,
            max_binary_size: 1024 * 1024,
        }
    }
}

impl ConvertConfig {
    /// Instrument name with the configured prefix applied.
    pub fn display_name(&self, instrument_name: &str) -> String {
        format!("{}{}", self.prefix, instrument_name)
    }

    /// Scales a sample position, truncating or rounding per configuration.
    pub fn scale_position(&self, position: u64, ratio: f64) -> u64 {
        let scaled = position as f64 * ratio;
        if self.round_loop_points {
            scaled.round() as u64
        } else {
            scaled as u64
        }
    }
}

/// Keep one of every `factor` pitches, counted from `anchor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinConfig {
    pub factor: u8,
    /// Pitch class 0-11 (0 = C).
    pub anchor: u8,
    pub max_interval: Option<u8>,
}

impl ThinConfig {
    pub fn new(factor: u8) -> Self {
        ThinConfig {
            factor,
            anchor: 0,
            max_interval: None,
        }
    }
}

/// Replaces characters that are invalid in file names and trims the ends.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if INVALID_FILENAME_CHARS.contains(&c) { '_' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConvertConfig::default();
        assert_eq!(config.target_rate, Some(48_000));
        assert_eq!(config.loop_search_range, 5);
        assert_eq!(config.single_cycle_threshold, 512);
        assert!(config.embed_loop);
        assert_eq!(config.name_warn_len, 24);
        assert_eq!(config.name_error_len, 64);
    }

    #[test]
    fn test_scale_position_truncates_unless_rounding() {
        let mut config = ConvertConfig::default();
        let ratio = 48_000.0 / 44_100.0;
        assert_eq!(config.scale_position(101, ratio), 109); // 109.93
        config.round_loop_points = true;
        assert_eq!(config.scale_position(101, ratio), 110);
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("  Pad: A/B?  "), "Pad_ A_B_");
        assert_eq!(sanitize_filename("JV1010 - Strings"), "JV1010 - Strings");
    }

    #[test]
    fn test_display_name_applies_prefix() {
        let config = ConvertConfig {
            prefix: "JV - ".to_string(),
            ..ConvertConfig::default()
        };
        assert_eq!(config.display_name("Strings"), "JV - Strings");
    }
}
