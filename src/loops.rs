//! Loop points after resampling.
//!
//! Naively scaled loop points rarely land on matching sample values, so
//! normal loops get a small grid search for the quietest seam. Short
//! single-cycle loops instead keep their exact scaled length, since the
//! length is what sets their pitch.

use crate::audio::PcmData;
use crate::config::ConvertConfig;
use crate::error::{Diagnostics, ValidationError};
use crate::zone::{Crossfade, LoopRegion, ZoneData};

/// Seam mismatch above this share of full scale is reported for
/// single-cycle loops.
const PHASE_WARN_RATIO: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopClass {
    SingleCycle,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopCandidate {
    pub start: u64,
    pub end: u64,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub class: LoopClass,
    /// The search moved the points off their naive scaled values.
    pub optimized: bool,
    pub region: LoopRegion,
}

/// `length` is the scaled `loop_end - loop_start`. A threshold of 0
/// disables single-cycle handling.
pub fn classify(length: u64, threshold: usize) -> LoopClass {
    if threshold > 0 && length <= threshold as u64 {
        LoopClass::SingleCycle
    } else {
        LoopClass::Normal
    }
}

/// Jump in value when playback wraps from `end` back to `start`: the
/// frame after `end` against the frame at `start`.
pub fn seam_discontinuity(frames: &[i32], start: u64, end: u64) -> Option<i64> {
    let after_end = *frames.get(usize::try_from(end.checked_add(1)?).ok()?)?;
    let at_start = *frames.get(usize::try_from(start).ok()?)?;
    Some((i64::from(after_end) - i64::from(at_start)).abs())
}

/// Scores every `(start + ds, end + de)` with `ds, de` in `-range..=range`
/// and returns the lowest seam discontinuity. Equal scores prefer the
/// smaller `|ds| + |de|`, then the earlier candidate in grid order.
pub fn search_loop_points(
    frames: &[i32],
    start: u64,
    end: u64,
    range: usize,
) -> Option<LoopCandidate> {
    let range = range as i64;
    let mut best: Option<(LoopCandidate, i64)> = None;

    for ds in -range..=range {
        let Some(candidate_start) = start.checked_add_signed(ds) else {
            continue;
        };
        for de in -range..=range {
            let Some(candidate_end) = end.checked_add_signed(de) else {
                continue;
            };
            if candidate_end <= candidate_start {
                continue;
            }
            let Some(score) = seam_discontinuity(frames, candidate_start, candidate_end) else {
                continue;
            };
            let displacement = ds.abs() + de.abs();
            let better = match &best {
                None => true,
                Some((current, current_displacement)) => {
                    (score, displacement) < (current.score, *current_displacement)
                }
            };
            if better {
                best = Some((
                    LoopCandidate {
                        start: candidate_start,
                        end: candidate_end,
                        score,
                    },
                    displacement,
                ));
            }
        }
    }
    best.map(|(candidate, _)| candidate)
}

/// Scales a single-cycle loop keeping its inclusive length at
/// `round(len * ratio)` frames, so the cycle's pitch survives.
fn scale_single_cycle(region: &LoopRegion, ratio: f64) -> (u64, u64) {
    let length = ((region.len() as f64 * ratio).round() as u64).max(1);
    let start = (region.start as f64 * ratio).round() as u64;
    (start, start + length - 1)
}

/// Re-derives one zone's loop for its rendered sample. The zone's
/// `resample_ratio` must already be set. Returns `None` for zones that
/// do not loop.
pub fn optimize_zone(
    zone: &mut ZoneData,
    pcm: &PcmData,
    config: &ConvertConfig,
    diagnostics: &mut Diagnostics,
) -> Result<Option<LoopOutcome>, ValidationError> {
    let Some(original) = zone.looping.clone() else {
        return Ok(None);
    };
    let label = zone.label().to_string();
    let ratio = zone.resample_ratio;
    let total = pcm.len() as u64;

    let naive_start = config.scale_position(original.start, ratio);
    let naive_end = config.scale_position(original.end, ratio);
    let class = classify(
        naive_end.saturating_sub(naive_start),
        config.single_cycle_threshold,
    );

    let mut optimized = false;
    let (mut start, mut end) = match class {
        LoopClass::SingleCycle => {
            let (start, end) = scale_single_cycle(&original, ratio);
            log::debug!(
                "{label}: single-cycle loop of {} frames kept at {}",
                original.len(),
                end - start + 1
            );
            (start, end)
        }
        LoopClass::Normal if config.optimize_loops && ratio != 1.0 => {
            let naive_score = seam_discontinuity(&pcm.frames, naive_start, naive_end);
            match search_loop_points(&pcm.frames, naive_start, naive_end, config.loop_search_range)
            {
                Some(found) if naive_score.is_none_or(|naive| found.score < naive) => {
                    log::debug!(
                        "{label}: loop {naive_start}-{naive_end} moved to {}-{} (seam {:?} -> {})",
                        found.start,
                        found.end,
                        naive_score,
                        found.score
                    );
                    optimized = true;
                    (found.start, found.end)
                }
                _ => (naive_start, naive_end),
            }
        }
        LoopClass::Normal => (naive_start, naive_end),
    };

    if start >= total {
        return Err(ValidationError::PositionOutOfRange {
            field: "loop_start",
            value: start,
            frame_count: total,
        });
    }
    if end >= total {
        let clamped = total - 1;
        diagnostics.push(&label, format!("loop-end {end} clamped to {clamped}"));
        end = clamped;
        if class == LoopClass::SingleCycle {
            // Keep the cycle length by sliding the loop back instead.
            let length = end.saturating_sub(start);
            let wanted = ((original.len() as f64 * ratio).round() as u64).max(1) - 1;
            if length < wanted && end >= wanted {
                start = end - wanted;
            }
        }
    }
    if end <= start {
        return Err(ValidationError::InvertedRange {
            field_a: "loop_start",
            a: start,
            field_b: "loop_end",
            b: end,
        });
    }

    if class == LoopClass::SingleCycle {
        if let Some(jump) = seam_discontinuity(&pcm.frames, start, end) {
            let limit = pcm.full_scale() as f64 * PHASE_WARN_RATIO;
            if jump as f64 > limit {
                diagnostics.push(
                    &label,
                    format!(
                        "single-cycle loop seam jumps by {:.1}% of full scale",
                        jump as f64 * 100.0 / pcm.full_scale() as f64
                    ),
                );
            }
        }
    }

    // Millisecond crossfades are recounted at the output rate, the rest scale.
    let crossfade_samples = match (original.crossfade, zone.output_rate) {
        (Crossfade::Milliseconds(_), Some(rate)) => original.crossfade.samples_at(rate),
        _ => (original.crossfade_samples as f64 * ratio).round() as u64,
    };
    let region = LoopRegion {
        start,
        end,
        crossfade: original.crossfade,
        crossfade_samples,
    };
    zone.looping = Some(region.clone());
    Ok(Some(LoopOutcome {
        class,
        optimized,
        region,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::test_support::zone;

    fn saw(len: usize, period: usize) -> Vec<i32> {
        (0..len).map(|i| ((i % period) * 10) as i32).collect()
    }

    fn pcm(frames: Vec<i32>) -> PcmData {
        PcmData {
            frames,
            bits_per_sample: 24,
        }
    }

    fn looped_zone(start: u64, end: u64, crossfade_samples: u64, ratio: f64) -> ZoneData {
        let mut z = zone(60, 0);
        z.looping = Some(LoopRegion {
            start,
            end,
            crossfade: Crossfade::Seconds(crossfade_samples as f64 / 44_100.0),
            crossfade_samples,
        });
        z.resample_ratio = ratio;
        z
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(512, 512), LoopClass::SingleCycle);
        assert_eq!(classify(513, 512), LoopClass::Normal);
        assert_eq!(classify(10, 0), LoopClass::Normal);
    }

    #[test]
    fn test_search_finds_perfect_seam_within_range() {
        let frames = saw(3000, 100);
        // Naive end is two frames short of a full period.
        let naive_score = seam_discontinuity(&frames, 1000, 1097).unwrap();
        assert_eq!(naive_score, 980);

        let found = search_loop_points(&frames, 1000, 1097, 5).unwrap();
        assert_eq!(found.score, 0);
        assert_eq!(found.end - found.start, 99);
        assert!(found.start.abs_diff(1000) + found.end.abs_diff(1097) <= 2);
    }

    #[test]
    fn test_search_tie_prefers_naive_point() {
        let frames = vec![0; 200];
        let found = search_loop_points(&frames, 50, 150, 3).unwrap();
        assert_eq!((found.start, found.end, found.score), (50, 150, 0));
    }

    #[test]
    fn test_search_ignores_out_of_bounds_candidates() {
        let frames = saw(20, 10);
        let found = search_loop_points(&frames, 1, 18, 5).unwrap();
        assert!(found.end + 1 < frames.len() as u64);
    }

    #[test]
    fn test_optimize_normal_loop_after_resample() {
        let config = ConvertConfig {
            optimize_loops: true,
            single_cycle_threshold: 0,
            ..ConvertConfig::default()
        };
        let ratio = 48_000.0 / 44_100.0;
        // 10_000..=45_000 scales to 10_884..=48_979.
        let mut z = looped_zone(10_000, 45_000, 2205, ratio);
        let frames = saw(60_000, 100);
        let mut diagnostics = Diagnostics::new();

        let outcome = optimize_zone(&mut z, &pcm(frames.clone()), &config, &mut diagnostics)
            .unwrap()
            .unwrap();
        assert_eq!(outcome.class, LoopClass::Normal);
        assert!(outcome.optimized);
        let region = z.looping.unwrap();
        assert_eq!(seam_discontinuity(&frames, region.start, region.end), Some(0));
        assert_eq!(region.crossfade_samples, 2400);
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn test_millisecond_crossfade_recounted_at_output_rate() {
        let ratio = 48_000.0 / 44_100.0;
        // 50 ms at 44.1 kHz is 50 * 44 samples.
        let mut z = looped_zone(10_000, 45_000, 2200, ratio);
        if let Some(region) = z.looping.as_mut() {
            region.crossfade = Crossfade::Milliseconds(50);
        }
        z.output_rate = Some(48_000);
        let outcome = optimize_zone(
            &mut z,
            &pcm(saw(60_000, 100)),
            &ConvertConfig::default(),
            &mut Diagnostics::new(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(outcome.region.crossfade_samples, 2400);
        assert_eq!(outcome.region.crossfade, Crossfade::Milliseconds(50));
    }

    #[test]
    fn test_second_crossfade_scaled_by_ratio() {
        let ratio = 96_000.0 / 44_100.0;
        let mut z = looped_zone(10_000, 45_000, 441, ratio);
        z.output_rate = Some(96_000);
        let outcome = optimize_zone(
            &mut z,
            &pcm(saw(120_000, 100)),
            &ConvertConfig::default(),
            &mut Diagnostics::new(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(outcome.region.crossfade_samples, 960);
    }

    #[test]
    fn test_optimize_skipped_without_rate_change() {
        let config = ConvertConfig {
            optimize_loops: true,
            ..ConvertConfig::default()
        };
        let mut z = looped_zone(1000, 5000, 100, 1.0);
        let outcome = optimize_zone(&mut z, &pcm(saw(10_000, 7)), &config, &mut Diagnostics::new())
            .unwrap()
            .unwrap();
        assert!(!outcome.optimized);
        assert_eq!((outcome.region.start, outcome.region.end), (1000, 5000));
        assert_eq!(outcome.region.crossfade_samples, 100);
    }

    #[test]
    fn test_single_cycle_keeps_scaled_length() {
        let config = ConvertConfig {
            optimize_loops: true,
            ..ConvertConfig::default()
        };
        let ratio = 48_000.0 / 44_100.0;
        // 100 frames at 44.1k is 108.84, so 109 frames at 48k.
        let mut z = looped_zone(441, 540, 0, ratio);
        let outcome = optimize_zone(&mut z, &pcm(vec![0; 2000]), &config, &mut Diagnostics::new())
            .unwrap()
            .unwrap();
        assert_eq!(outcome.class, LoopClass::SingleCycle);
        assert!(!outcome.optimized);
        assert_eq!(outcome.region.start, 480);
        assert_eq!(outcome.region.len(), 109);
    }

    #[test]
    fn test_single_cycle_phase_warning() {
        let config = ConvertConfig::default();
        let mut frames = vec![0; 300];
        frames[200] = 1 << 22;
        let mut z = looped_zone(100, 199, 0, 1.0);
        let mut diagnostics = Diagnostics::new();
        optimize_zone(&mut z, &pcm(frames), &config, &mut diagnostics).unwrap();
        assert!(diagnostics.mentions(z.label(), "full scale"));
    }

    #[test]
    fn test_loop_end_clamped_to_rendered_length() {
        let config = ConvertConfig::default();
        let mut z = looped_zone(1000, 5000, 0, 1.0);
        let mut diagnostics = Diagnostics::new();
        let outcome = optimize_zone(&mut z, &pcm(vec![0; 4000]), &config, &mut diagnostics)
            .unwrap()
            .unwrap();
        assert_eq!(outcome.region.end, 3999);
        assert!(diagnostics.mentions(z.label(), "clamped"));
    }

    #[test]
    fn test_loop_start_past_end_of_sample_is_rejected() {
        let config = ConvertConfig::default();
        let mut z = looped_zone(5000, 6000, 0, 1.0);
        assert!(matches!(
            optimize_zone(&mut z, &pcm(vec![0; 4000]), &config, &mut Diagnostics::new()),
            Err(ValidationError::PositionOutOfRange { .. })
        ));
    }

    #[test]
    fn test_non_looping_zone_untouched() {
        let mut z = zone(60, 0);
        let outcome = optimize_zone(
            &mut z,
            &pcm(vec![0; 10]),
            &ConvertConfig::default(),
            &mut Diagnostics::new(),
        )
        .unwrap();
        assert!(outcome.is_none());
        assert!(z.looping.is_none());
    }
}
