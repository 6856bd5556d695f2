//! Canonical zone model shared by every source format.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

pub const NOTE_NAMES: [&str; 12] = [
    "c", "c#", "d", "d#", "e", "f", "f#", "g", "g#", "a", "a#", "b",
];

/// Lower-case note name with the target's octave numbering (60 = "c3",
/// 0 = "c-2").
pub fn note_name(pitch: u8) -> String {
    let octave = i32::from(pitch) / 12 - 2;
    format!("{}{}", NOTE_NAMES[usize::from(pitch % 12)], octave)
}

/// Layer threshold as the target's 0.0-1.0 velocity. A zero threshold is
/// exactly 0.0.
pub fn layer_velocity(min_velocity: u8) -> f64 {
    if min_velocity == 0 {
        0.0
    } else {
        f64::from(min_velocity) / 127.0
    }
}

/// Loop crossfade as the source file stores it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Crossfade {
    /// Whole milliseconds (EXS), each worth `rate / 1000` samples.
    Milliseconds(u32),
    /// Seconds (SFZ), rounded to the nearest sample.
    Seconds(f64),
}

impl Crossfade {
    pub fn samples_at(&self, rate: u32) -> u64 {
        match *self {
            Crossfade::Milliseconds(ms) => u64::from(ms) * u64::from(rate / 1000),
            Crossfade::Seconds(seconds) => (seconds * f64::from(rate)).round() as u64,
        }
    }
}

/// Loop region in sample frames at the zone's current rate. `end` is
/// inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopRegion {
    pub start: u64,
    pub end: u64,
    pub crossfade: Crossfade,
    pub crossfade_samples: u64,
}

impl LoopRegion {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// One pitch/velocity/round-robin mapping of one audio file.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneData {
    pub pitch: u8,
    pub key_center: f64,
    pub min_velocity: u8,
    pub max_velocity: u8,
    pub source_path: PathBuf,
    pub sample_name: String,
    pub trim_start: Option<u64>,
    pub trim_end: Option<u64>,
    pub looping: Option<LoopRegion>,
    pub keep_looping_on_release: bool,
    pub round_robin_position: Option<u32>,
    pub original_rate: u32,
    pub frame_count: Option<u64>,

    pub velocity_layer_index: usize,
    pub output_filename: Option<String>,
    pub resample_ratio: f64,
    pub output_rate: Option<u32>,
}

impl ZoneData {
    pub fn velocity(&self) -> f64 {
        layer_velocity(self.min_velocity)
    }

    /// Name used in diagnostics: the output file once assigned, else the
    /// source sample.
    pub fn label(&self) -> &str {
        self.output_filename.as_deref().unwrap_or(&self.sample_name)
    }
}

#[derive(Debug)]
pub struct VelocityLayer<'a> {
    pub index: usize,
    pub min_velocity: u8,
    pub velocity: f64,
    pub slots: Vec<&'a ZoneData>,
}

#[derive(Debug)]
pub struct KeyZone<'a> {
    pub pitch: u8,
    pub key_center: f64,
    pub layers: Vec<VelocityLayer<'a>>,
}

/// An instrument's zones kept in target order: by pitch, then velocity
/// threshold, then round-robin position (source order when unset).
#[derive(Debug, Clone)]
pub struct Instrument {
    pub name: String,
    zones: Vec<ZoneData>,
}

impl Instrument {
    pub fn new(name: impl Into<String>, zones: Vec<ZoneData>) -> Self {
        let mut instrument = Instrument {
            name: name.into(),
            zones,
        };
        instrument.organize();
        instrument
    }

    fn organize(&mut self) {
        self.zones
            .sort_by_key(|z| (z.pitch, z.min_velocity, z.round_robin_position));

        let mut thresholds: HashMap<u8, Vec<u8>> = HashMap::new();
        for zone in &self.zones {
            let layer = thresholds.entry(zone.pitch).or_default();
            if layer.last() != Some(&zone.min_velocity) {
                layer.push(zone.min_velocity);
            }
        }
        for zone in &mut self.zones {
            zone.velocity_layer_index = thresholds[&zone.pitch]
                .iter()
                .position(|v| *v == zone.min_velocity)
                .unwrap_or_default();
        }
    }

    pub fn zones(&self) -> &[ZoneData] {
        &self.zones
    }

    pub fn zones_mut(&mut self) -> &mut [ZoneData] {
        &mut self.zones
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Removes zones; surviving zones are never edited here.
    pub fn retain(&mut self, keep: impl FnMut(&ZoneData) -> bool) {
        self.zones.retain(keep);
        self.organize();
    }

    pub fn unique_pitches(&self) -> Vec<u8> {
        let mut pitches: Vec<u8> = self.zones.iter().map(|z| z.pitch).collect();
        pitches.dedup();
        pitches
    }

    pub fn key_zones(&self) -> Vec<KeyZone<'_>> {
        let mut key_zones: Vec<KeyZone<'_>> = Vec::new();
        for zone in &self.zones {
            if key_zones.last().map(|k| k.pitch) != Some(zone.pitch) {
                key_zones.push(KeyZone {
                    pitch: zone.pitch,
                    key_center: zone.key_center,
                    layers: Vec::new(),
                });
            }
            let Some(key_zone) = key_zones.last_mut() else {
                continue;
            };
            if key_zone.layers.last().map(|l| l.min_velocity) != Some(zone.min_velocity) {
                key_zone.layers.push(VelocityLayer {
                    index: zone.velocity_layer_index,
                    min_velocity: zone.min_velocity,
                    velocity: zone.velocity(),
                    slots: Vec::new(),
                });
            }
            if let Some(layer) = key_zone.layers.last_mut() {
                layer.slots.push(zone);
            }
        }
        key_zones
    }

    /// Names every zone `{Name}-{layer:03}-{pitch:03}-{note}{rr}.wav`.
    ///
    /// Round-robin zones get `-rr<position>`. Further slots in the same
    /// layer count up from `-rr1`, skipping positions already claimed, so
    /// no two zones share a file.
    pub fn assign_output_names(&mut self, safe_name: &str) {
        let mut claimed: HashMap<(u8, usize), HashSet<u32>> = HashMap::new();
        for zone in &self.zones {
            if let Some(position) = zone.round_robin_position {
                claimed
                    .entry((zone.pitch, zone.velocity_layer_index))
                    .or_default()
                    .insert(position);
            }
        }

        let mut taken: HashMap<(u8, usize), HashSet<Option<u32>>> = HashMap::new();
        for zone in &mut self.zones {
            let key = (zone.pitch, zone.velocity_layer_index);
            let used = taken.entry(key).or_default();
            let wanted = zone.round_robin_position;
            let suffix = if !used.contains(&wanted) {
                wanted
            } else {
                let reserved = claimed.get(&key);
                (1..)
                    .find(|n| {
                        !used.contains(&Some(*n)) && !reserved.is_some_and(|r| r.contains(n))
                    })
            };
            used.insert(suffix);

            zone.output_filename = Some(format!(
                "{}-{:03}-{:03}-{}{}.wav",
                safe_name,
                zone.velocity_layer_index,
                zone.pitch,
                note_name(zone.pitch),
                suffix.map(|n| format!("-rr{n}")).unwrap_or_default()
            ));
        }
    }
}
