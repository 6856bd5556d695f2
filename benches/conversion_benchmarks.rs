use std::hint::black_box;
use std::path::PathBuf;

use criterion::{Criterion, criterion_group, criterion_main};

use rusty_elmulti::config::ThinConfig;
use rusty_elmulti::loops::search_loop_points;
use rusty_elmulti::thin::select_pitches;
use rusty_elmulti::zone::{Crossfade, Instrument, LoopRegion, ZoneData};
use rusty_elmulti::{exs, sfz};

fn exs_buffer(zones: usize) -> Vec<u8> {
    fn chunk(signature: u32, total_len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; total_len];
        bytes[0..4].copy_from_slice(&signature.to_le_bytes());
        bytes[4..8].copy_from_slice(&((total_len - 84) as u32).to_le_bytes());
        bytes
    }
    let mut out = chunk(0x0000_0101, 100);
    out[16..20].copy_from_slice(b"TBOS");
    for i in 0..zones {
        let mut zone = chunk(0x0100_0101, 180);
        zone[85] = 36 + (i % 60) as u8;
        zone[94] = 127;
        out.extend(zone);
    }
    out.extend(chunk(0x0200_0101, 172));
    out.extend(chunk(0x0300_0101, 676));
    out
}

fn sfz_text(regions: usize) -> String {
    let mut text = String::from("<control> default_path=samples\\\n<group> loop_mode=loop_continuous\n");
    for i in 0..regions {
        text.push_str(&format!(
            "<region> sample=Piano {i}.wav pitch_keycenter={} lovel=0 hivel=127 loop_start=100 loop_end=40000 // note\n",
            36 + i % 60
        ));
    }
    text
}

fn instrument(zones: usize) -> Instrument {
    let zones = (0..zones)
        .map(|i| ZoneData {
            pitch: 36 + (i % 60) as u8,
            key_center: f64::from(36 + (i % 60) as u8),
            min_velocity: ((i / 60) * 32) as u8,
            max_velocity: 127,
            source_path: PathBuf::from(format!("/samples/{i}.wav")),
            sample_name: format!("{i}.wav"),
            trim_start: None,
            trim_end: Some(96_000),
            looping: Some(LoopRegion {
                start: 1_000,
                end: 90_000,
                crossfade: Crossfade::Milliseconds(50),
                crossfade_samples: 2_400,
            }),
            keep_looping_on_release: true,
            round_robin_position: None,
            original_rate: 44_100,
            frame_count: Some(96_000),
            velocity_layer_index: 0,
            output_filename: None,
            resample_ratio: 1.0,
            output_rate: Some(48_000),
        })
        .collect();
    let mut instrument = Instrument::new("Bench", zones);
    instrument.assign_output_names("Bench");
    instrument
}

fn benchmarks(c: &mut Criterion) {
    let buffer = exs_buffer(240);
    c.bench_function("exs_decode_240_zones", |b| {
        b.iter(|| exs::decode(black_box(&buffer)))
    });

    let text = sfz_text(240);
    c.bench_function("sfz_parse_240_regions", |b| b.iter(|| sfz::parse(black_box(&text))));

    let frames: Vec<i32> = (0..200_000)
        .map(|i| ((i as f64 * 0.013).sin() * 4_000_000.0) as i32)
        .collect();
    c.bench_function("loop_search_range_5", |b| {
        b.iter(|| search_loop_points(black_box(&frames), 10_884, 148_979, 5))
    });
    c.bench_function("loop_search_range_50", |b| {
        b.iter(|| search_loop_points(black_box(&frames), 10_884, 148_979, 50))
    });

    let pitches: Vec<u8> = (0..128).collect();
    let thin = ThinConfig {
        factor: 5,
        anchor: 0,
        max_interval: Some(3),
    };
    c.bench_function("thin_128_pitches", |b| {
        b.iter(|| select_pitches(black_box(&pitches), &thin))
    });

    let instrument = instrument(240);
    c.bench_function("elmulti_render_240_zones", |b| {
        b.iter(|| black_box(&instrument).to_elmulti_string())
    });
}

criterion_group!(benches, benchmarks);
criterion_main!(benches);
