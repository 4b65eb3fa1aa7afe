//! Seeded synthetic input bursts for property tests, benchmarks and
//! `rasoom bench`.

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use crate::normalize::{ChannelKind, CoordRange, RawChannel, RawInput, RawSample};

const WORDS: [&str; 8] = [
    "confirm", "open", "move", "left", "right", "stop", "here", "again",
];

/// One random burst: a pointer channel, usually pressure, sometimes gaze
/// and voice. Ranges, rates and confidences vary per channel.
pub fn raw_input(rng: &mut impl Rng) -> RawInput {
    let start_ms = 1_700_000_000_000.0 + rng.random_range(0.0..1e9_f64).floor();
    let mut channels = vec![pointer_like(rng, ChannelKind::Pointer, start_ms)];
    if rng.random_bool(0.8) {
        channels.push(pressure(rng, start_ms));
    }
    if rng.random_bool(0.3) {
        channels.push(pointer_like(rng, ChannelKind::Gaze, start_ms));
    }
    if rng.random_bool(0.25) {
        channels.push(voice(rng, start_ms));
    }
    RawInput { channels }
}

/// `count` bursts from a fixed seed.
pub fn corpus(seed: u64, count: usize) -> Vec<RawInput> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..count).map(|_| raw_input(&mut rng)).collect()
}

fn timeline(rng: &mut impl Rng, start_ms: f64, samples: usize, period_ms: f64) -> Vec<f64> {
    let jitter = rng.random_range(0.0..0.4f64) * period_ms;
    let mut t = start_ms;
    (0..samples)
        .map(|_| {
            let now = t;
            t += period_ms + rng.random_range(-jitter..=jitter);
            now
        })
        .collect()
}

fn pointer_like(rng: &mut impl Rng, kind: ChannelKind, start_ms: f64) -> RawChannel {
    let range = if rng.random_bool(0.5) {
        CoordRange { min: 0.0, max: 1920.0 }
    } else {
        CoordRange::default()
    };
    let span = range.max - range.min;
    let samples = rng.random_range(2..=16);
    let period = rng.random_range(8.0..40.0);
    let (x0, y0): (f64, f64) = (rng.random_range(0.0..1.0), rng.random_range(0.0..1.0));
    let (dx, dy): (f64, f64) = (rng.random_range(-0.3..0.3), rng.random_range(-0.3..0.3));
    let times = timeline(rng, start_ms, samples, period);
    let last = (samples - 1).max(1) as f64;
    RawChannel {
        kind,
        confidence: rng.random_range(0.4..=1.0),
        range,
        samples: times
            .into_iter()
            .enumerate()
            .map(|(i, t_ms)| {
                let f = i as f64 / last;
                RawSample {
                    t_ms,
                    x: range.min + span * (x0 + dx * f),
                    y: range.min + span * (y0 + dy * f),
                    ..Default::default()
                }
            })
            .collect(),
    }
}

fn pressure(rng: &mut impl Rng, start_ms: f64) -> RawChannel {
    let samples = rng.random_range(2..=8);
    let period = rng.random_range(15.0..60.0);
    let base: f64 = rng.random_range(0.0..1.0);
    let times = timeline(rng, start_ms, samples, period);
    RawChannel {
        kind: ChannelKind::Pressure,
        confidence: rng.random_range(0.3..=1.0),
        range: CoordRange::default(),
        samples: times
            .into_iter()
            .map(|t_ms| RawSample {
                t_ms,
                value: (base + rng.random_range(-0.1..0.1)).clamp(0.0, 1.0),
                ..Default::default()
            })
            .collect(),
    }
}

fn voice(rng: &mut impl Rng, start_ms: f64) -> RawChannel {
    let words = rng.random_range(1..=3);
    RawChannel {
        kind: ChannelKind::Voice,
        confidence: rng.random_range(0.5..=1.0),
        range: CoordRange::default(),
        samples: (0..words)
            .map(|i| RawSample {
                t_ms: start_ms + 50.0 * i as f64,
                text: Some(WORDS[rng.random_range(0..WORDS.len())].to_string()),
                ..Default::default()
            })
            .collect(),
    }
}
