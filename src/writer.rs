//! Elektron multi-sample (`.elmulti`) output.

use crate::zone::Instrument;

pub trait InstrumentFormat {
    fn render(&self, instrument: &Instrument) -> String;
    fn file_extension(&self) -> &str;
}

pub struct ElmultiWriter;

impl InstrumentFormat for ElmultiWriter {
    fn render(&self, instrument: &Instrument) -> String {
        instrument.to_elmulti_string()
    }

    fn file_extension(&self) -> &str {
        "elmulti"
    }
}

/// Floats always carry a fractional part; the device parser rejects
/// `key-center = 60`.
fn float_literal(value: f64) -> String {
    let text = value.to_string();
    if text.contains(['.', 'e', 'E']) || !value.is_finite() {
        text
    } else {
        format!("{text}.0")
    }
}

fn string_literal(value: &str) -> String {
    if value.contains('\'') || value.chars().any(char::is_control) {
        let mut escaped = String::with_capacity(value.len() + 2);
        escaped.push('"');
        for c in value.chars() {
            match c {
                '"' => escaped.push_str("\\\""),
                '\\' => escaped.push_str("\\\\"),
                '\n' => escaped.push_str("\\n"),
                '\t' => escaped.push_str("\\t"),
                c if c.is_control() => escaped.push_str(&format!("\\u{:04X}", u32::from(c))),
                c => escaped.push(c),
            }
        }
        escaped.push('"');
        escaped
    } else {
        format!("'{value}'")
    }
}

// --- Elmulti Generation Logic ---

impl Instrument {
    /// Serializes key-zones, velocity layers and sample slots in model
    /// order. Loop fields appear only for looping slots.
    pub fn to_elmulti_string(&self) -> String {
        let mut out = String::new();
        out.push_str("# ELEKTRON MULTI-SAMPLE MAPPING FORMAT\n");
        out.push_str("version = 0\n");
        out.push_str(&format!("name = {}\n", string_literal(&self.name)));

        for key_zone in self.key_zones() {
            out.push_str("\n[[key-zones]]\n");
            out.push_str(&format!("pitch = {}\n", key_zone.pitch));
            out.push_str(&format!("key-center = {}\n", float_literal(key_zone.key_center)));

            for layer in &key_zone.layers {
                out.push_str("\n[[key-zones.velocity-layers]]\n");
                out.push_str(&format!("velocity = {}\n", float_literal(layer.velocity)));
                out.push_str("strategy = 'Forward'\n");

                for slot in &layer.slots {
                    out.push_str("\n[[key-zones.velocity-layers.sample-slots]]\n");
                    out.push_str(&format!("sample = {}\n", string_literal(slot.label())));
                    if let Some(start) = slot.trim_start {
                        out.push_str(&format!("trim-start = {start}\n"));
                    }
                    if let Some(end) = slot.trim_end {
                        out.push_str(&format!("trim-end = {end}\n"));
                    }
                    if let Some(region) = &slot.looping {
                        out.push_str("loop-mode = 'Forward'\n");
                        out.push_str(&format!("loop-start = {}\n", region.start));
                        out.push_str(&format!("loop-end = {}\n", region.end));
                        if region.crossfade_samples > 0 {
                            out.push_str(&format!(
                                "loop-crossfade = {}\n",
                                region.crossfade_samples
                            ));
                        }
                        if slot.keep_looping_on_release {
                            out.push_str("keep-looping-on-release = true\n");
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::{Crossfade, LoopRegion};
    use crate::zone::test_support::zone;

    #[test]
    fn test_literals() {
        assert_eq!(float_literal(60.0), "60.0");
        assert_eq!(float_literal(0.0), "0.0");
        assert_eq!(float_literal(84.5), "84.5");
        assert_eq!(string_literal("Strings"), "'Strings'");
        assert_eq!(string_literal("Bob's Pad"), "\"Bob's Pad\"");
    }

    #[test]
    fn test_render_structure() {
        let mut soft = zone(60, 0);
        soft.trim_start = Some(10);
        let mut loud = zone(60, 64);
        loud.looping = Some(LoopRegion {
            start: 100,
            end: 900,
            crossfade: Crossfade::Milliseconds(50),
            crossfade_samples: 2400,
        });
        loud.keep_looping_on_release = true;
        let mut instrument = Instrument::new("Keys", vec![loud, soft, zone(62, 0)]);
        instrument.assign_output_names("Keys");

        let text = ElmultiWriter.render(&instrument);
        assert!(text.starts_with("# ELEKTRON MULTI-SAMPLE MAPPING FORMAT\nversion = 0\nname = 'Keys'\n"));
        assert_eq!(text.matches("[[key-zones]]").count(), 2);
        assert_eq!(text.matches("[[key-zones.velocity-layers]]").count(), 3);
        assert_eq!(text.matches("[[key-zones.velocity-layers.sample-slots]]").count(), 3);
        assert!(text.contains("pitch = 60\nkey-center = 60.0\n"));
        assert!(text.contains("velocity = 0.0\nstrategy = 'Forward'\n"));
        assert!(text.contains("velocity = 0.50393700787"));
        assert!(text.contains("sample = 'Keys-000-060-c3.wav'\ntrim-start = 10\n"));
        assert!(text.contains(
            "loop-mode = 'Forward'\nloop-start = 100\nloop-end = 900\nloop-crossfade = 2400\nkeep-looping-on-release = true\n"
        ));
        assert_eq!(ElmultiWriter.file_extension(), "elmulti");
    }

    #[test]
    fn test_non_looping_slot_has_no_loop_fields() {
        let mut instrument = Instrument::new("Pad", vec![zone(48, 0)]);
        instrument.assign_output_names("Pad");
        let text = instrument.to_elmulti_string();
        assert!(!text.contains("loop-"));
        assert!(!text.contains("keep-looping"));
        assert!(!text.contains("trim-"));
    }

    #[test]
    fn test_zones_in_pitch_order() {
        let instrument = Instrument::new("x", vec![zone(72, 0), zone(36, 0), zone(48, 0)]);
        let text = instrument.to_elmulti_string();
        let positions: Vec<usize> = ["pitch = 36", "pitch = 48", "pitch = 72"]
            .iter()
            .map(|p| text.find(p).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }
}
