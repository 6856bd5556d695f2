//! Pitch-based sample thinning.
//!
//! Keeps every zone whose pitch is `(pitch - anchor) mod factor == 0`,
//! then puts back the nearest source pitches wherever that leaves a gap
//! wider than `max_interval`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::config::ThinConfig;
use crate::error::ValidationError;
use crate::zone::{Instrument, NOTE_NAMES, note_name};

/// Parses a thinning anchor: a pitch class `0..=11` or a note name.
pub fn parse_anchor(value: &str) -> Result<u8, ValidationError> {
    let value = value.trim();
    if let Ok(n) = value.parse::<u8>() {
        return if n <= 11 {
            Ok(n)
        } else {
            Err(ValidationError::InvalidAnchor(value.to_string()))
        };
    }
    let class = match value.to_uppercase().as_str() {
        "C" => 0,
        "C#" | "DB" => 1,
        "D" => 2,
        "D#" | "EB" => 3,
        "E" => 4,
        "F" => 5,
        "F#" | "GB" => 6,
        "G" => 7,
        "G#" | "AB" => 8,
        "A" => 9,
        "A#" | "BB" => 10,
        "B" | "H" => 11,
        _ => return Err(ValidationError::InvalidAnchor(value.to_string())),
    };
    Ok(class)
}

/// What an instrument's sample map looks like before thinning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleMapAnalysis {
    pub zone_count: usize,
    pub unique_pitches: Vec<u8>,
    /// Most common gap between adjacent sampled pitches.
    pub typical_interval: Option<u8>,
    pub pitch_range: Option<(u8, u8)>,
    /// Highest number of velocity layers on any one pitch.
    pub velocity_layers: usize,
    pub has_round_robin: bool,
}

fn intervals(pitches: &[u8]) -> Vec<u8> {
    pitches.windows(2).map(|w| w[1] - w[0]).collect()
}

pub fn analyze(instrument: &Instrument) -> SampleMapAnalysis {
    let unique_pitches = instrument.unique_pitches();

    let mut counts: HashMap<u8, usize> = HashMap::new();
    for interval in intervals(&unique_pitches) {
        *counts.entry(interval).or_default() += 1;
    }
    // Smallest interval wins a tie.
    let typical_interval = counts
        .into_iter()
        .max_by_key(|(interval, count)| (*count, std::cmp::Reverse(*interval)))
        .map(|(interval, _)| interval);

    let velocity_layers = instrument
        .key_zones()
        .iter()
        .map(|k| k.layers.len())
        .max()
        .unwrap_or(0);

    SampleMapAnalysis {
        zone_count: instrument.zones().len(),
        pitch_range: unique_pitches.first().zip(unique_pitches.last()).map(|(a, b)| (*a, *b)),
        typical_interval,
        unique_pitches,
        velocity_layers,
        has_round_robin: instrument
            .zones()
            .iter()
            .any(|z| z.round_robin_position.is_some()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PitchSelection {
    /// Every kept pitch, ascending.
    pub kept: Vec<u8>,
    /// Kept pitches that only survive to cap a gap.
    pub reinserted: Vec<u8>,
    /// Gaps still wider than `max_interval` because no source pitch lies
    /// inside them.
    pub uncapped: Vec<(u8, u8)>,
}

/// Chooses pitches to keep from `pitches`, in any order and with
/// duplicates.
pub fn select_pitches(pitches: &[u8], thin: &ThinConfig) -> Result<PitchSelection, ValidationError> {
    if thin.factor < 2 {
        return Err(ValidationError::ThinFactorTooSmall(thin.factor));
    }
    let source: Vec<u8> = pitches.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    let strict: Vec<u8> = source
        .iter()
        .copied()
        .filter(|p| (i16::from(*p) - i16::from(thin.anchor)).rem_euclid(i16::from(thin.factor)) == 0)
        .collect();
    let Some((&first, rest)) = strict.split_first() else {
        return Err(ValidationError::ThinningEmpty {
            factor: thin.factor,
            anchor: thin.anchor,
        });
    };

    let mut kept = vec![first];
    let mut reinserted = Vec::new();
    let mut uncapped = Vec::new();
    for &next in rest {
        if let Some(max) = thin.max_interval {
            loop {
                let last = kept[kept.len() - 1];
                if next - last <= max {
                    break;
                }
                let reach = u16::from(last) + u16::from(max);
                match source
                    .iter()
                    .rev()
                    .find(|p| **p > last && u16::from(**p) <= reach)
                {
                    Some(&fill) => {
                        kept.push(fill);
                        reinserted.push(fill);
                    }
                    None => {
                        uncapped.push((last, next));
                        break;
                    }
                }
            }
        }
        kept.push(next);
    }

    Ok(PitchSelection {
        kept,
        reinserted,
        uncapped,
    })
}

/// A thinning decision that has not been applied yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinPlan {
    pub config: ThinConfig,
    pub original_pitches: Vec<u8>,
    pub selection: PitchSelection,
    pub original_zones: usize,
    pub retained_zones: usize,
}

impl ThinPlan {
    pub fn removed_pitches(&self) -> Vec<u8> {
        self.original_pitches
            .iter()
            .copied()
            .filter(|p| !self.selection.kept.contains(p))
            .collect()
    }

    pub fn removed_zones(&self) -> usize {
        self.original_zones - self.retained_zones
    }

    pub fn intervals(&self) -> Vec<u8> {
        intervals(&self.selection.kept)
    }

    pub fn is_noop(&self) -> bool {
        self.removed_zones() == 0
    }
}

impl fmt::Display for ThinPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |pitches: &[u8]| {
            pitches
                .iter()
                .map(|p| format!("{p} ({})", note_name(*p)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        writeln!(
            f,
            "Thin by {} from anchor {}{}",
            self.config.factor,
            NOTE_NAMES[usize::from(self.config.anchor % 12)],
            self.config
                .max_interval
                .map(|m| format!(", max interval {m}"))
                .unwrap_or_default()
        )?;
        writeln!(
            f,
            "  Pitches: {} -> {} ({} removed)",
            self.original_pitches.len(),
            self.selection.kept.len(),
            self.removed_pitches().len()
        )?;
        writeln!(
            f,
            "  Zones:   {} -> {} ({} removed)",
            self.original_zones,
            self.retained_zones,
            self.removed_zones()
        )?;
        writeln!(f, "  Kept: {}", names(&self.selection.kept))?;
        if !self.selection.reinserted.is_empty() {
            writeln!(f, "  Reinserted to cap gaps: {}", names(&self.selection.reinserted))?;
        }
        for (low, high) in &self.selection.uncapped {
            writeln!(f, "  Gap {low}-{high} cannot be capped: no source pitch between")?;
        }
        let intervals: Vec<String> = self.intervals().iter().map(u8::to_string).collect();
        write!(f, "  Intervals: [{}]", intervals.join(", "))
    }
}

/// Computes the thinning of `instrument` without changing it.
pub fn plan(instrument: &Instrument, thin: &ThinConfig) -> Result<ThinPlan, ValidationError> {
    let original_pitches = instrument.unique_pitches();
    let selection = select_pitches(&original_pitches, thin)?;
    let retained_zones = instrument
        .zones()
        .iter()
        .filter(|z| selection.kept.contains(&z.pitch))
        .count();
    Ok(ThinPlan {
        config: *thin,
        original_pitches,
        selection,
        original_zones: instrument.zones().len(),
        retained_zones,
    })
}

pub fn apply(instrument: &mut Instrument, plan: &ThinPlan) {
    instrument.retain(|z| plan.selection.kept.contains(&z.pitch));
    log::info!(
        "Thinned {}: kept {} of {} zones",
        instrument.name,
        instrument.zones().len(),
        plan.original_zones
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::test_support::zone;

    fn config(factor: u8, anchor: u8, max_interval: Option<u8>) -> ThinConfig {
        ThinConfig {
            factor,
            anchor,
            max_interval,
        }
    }

    #[test]
    fn test_parse_anchor() {
        assert_eq!(parse_anchor("0").unwrap(), 0);
        assert_eq!(parse_anchor("11").unwrap(), 11);
        assert_eq!(parse_anchor("c#").unwrap(), 1);
        assert_eq!(parse_anchor("Db").unwrap(), 1);
        assert_eq!(parse_anchor("H").unwrap(), 11);
        assert_eq!(parse_anchor("bb").unwrap(), 10);
        assert!(matches!(parse_anchor("12"), Err(ValidationError::InvalidAnchor(_))));
        assert!(matches!(parse_anchor("X"), Err(ValidationError::InvalidAnchor(_))));
    }

    #[test]
    fn test_strict_thinning() {
        let pitches: Vec<u8> = (0..12).collect();
        let selection = select_pitches(&pitches, &config(3, 0, None)).unwrap();
        assert_eq!(selection.kept, vec![0, 3, 6, 9]);
        assert!(selection.reinserted.is_empty());
    }

    #[test]
    fn test_anchor_shifts_selection() {
        let pitches: Vec<u8> = (48..60).collect();
        let selection = select_pitches(&pitches, &config(4, 2, None)).unwrap();
        assert_eq!(selection.kept, vec![50, 54, 58]);
    }

    #[test]
    fn test_max_interval_caps_gaps() {
        let pitches: Vec<u8> = (0..=12).collect();
        let selection = select_pitches(&pitches, &config(6, 0, Some(2))).unwrap();
        assert_eq!(selection.kept, vec![0, 2, 4, 6, 8, 10, 12]);
        assert_eq!(selection.reinserted, vec![2, 4, 8, 10]);

        let sparse = [40, 41, 43, 45, 46, 48, 50, 52, 53, 55, 57, 59, 60];
        let selection = select_pitches(&sparse, &config(12, 0, Some(2))).unwrap();
        assert!(selection.kept.windows(2).all(|w| w[1] - w[0] <= 2));
        assert!(selection.uncapped.is_empty());
    }

    #[test]
    fn test_uncappable_gap_is_reported() {
        let selection = select_pitches(&[36, 48], &config(12, 0, Some(5))).unwrap();
        assert_eq!(selection.kept, vec![36, 48]);
        assert_eq!(selection.uncapped, vec![(36, 48)]);
    }

    #[test]
    fn test_selection_ignores_input_order() {
        let ordered: Vec<u8> = (30..70).step_by(2).collect();
        let mut shuffled = ordered.clone();
        shuffled.reverse();
        shuffled.swap(3, 11);
        shuffled.extend([40, 40]);
        let thin = config(5, 7, Some(4));
        assert_eq!(
            select_pitches(&ordered, &thin).unwrap(),
            select_pitches(&shuffled, &thin).unwrap()
        );
    }

    #[test]
    fn test_invalid_configurations() {
        assert_eq!(
            select_pitches(&[60], &config(1, 0, None)),
            Err(ValidationError::ThinFactorTooSmall(1))
        );
        assert_eq!(
            select_pitches(&[61, 62], &config(12, 0, None)),
            Err(ValidationError::ThinningEmpty {
                factor: 12,
                anchor: 0
            })
        );
    }

    #[test]
    fn test_preview_does_not_mutate() {
        let zones = vec![zone(60, 0), zone(60, 64), zone(61, 0), zone(62, 0), zone(63, 0)];
        let mut instrument = Instrument::new("Keys", zones);
        let plan = plan(&instrument, &config(3, 0, None)).unwrap();
        assert_eq!(instrument.zones().len(), 5);
        assert_eq!(plan.selection.kept, vec![60, 63]);
        assert_eq!(plan.retained_zones, 3);
        assert_eq!(plan.removed_pitches(), vec![61, 62]);
        assert!(plan.to_string().contains("Zones:   5 -> 3 (2 removed)"));

        apply(&mut instrument, &plan);
        assert_eq!(instrument.unique_pitches(), vec![60, 63]);
    }

    #[test]
    fn test_analysis() {
        let mut rr = zone(64, 0);
        rr.round_robin_position = Some(1);
        let instrument = Instrument::new(
            "Keys",
            vec![zone(60, 0), zone(60, 100), zone(62, 0), zone(64, 0), rr, zone(67, 0)],
        );
        let analysis = analyze(&instrument);
        assert_eq!(analysis.zone_count, 6);
        assert_eq!(analysis.unique_pitches, vec![60, 62, 64, 67]);
        assert_eq!(analysis.typical_interval, Some(2));
        assert_eq!(analysis.pitch_range, Some((60, 67)));
        assert_eq!(analysis.velocity_layers, 2);
        assert!(analysis.has_round_robin);
    }
}
