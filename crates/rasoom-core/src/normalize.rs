//! FeatureNormalizer: raw multi-channel samples → one `MultimodalEvent`.
//!
//! Channels arrive at heterogeneous rates and coordinate ranges. All numeric
//! channels are resampled onto the timeline of the highest-confidence channel
//! by linear interpolation, rescaled into [0, 1], and summarized into an
//! ambiguity score from channel confidence and sampling jitter.

use serde::{Deserialize, Serialize};

use crate::constants::{EPSILON, FEATURE_COUNT, VELOCITY_SCALE};
use crate::error::PipelineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Pointer,
    Gaze,
    Pressure,
    Voice,
}

impl ChannelKind {
    fn is_numeric(self) -> bool {
        !matches!(self, ChannelKind::Voice)
    }
}

/// Coordinate range of a channel before rescaling.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordRange {
    pub min: f64,
    pub max: f64,
}

impl Default for CoordRange {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

impl CoordRange {
    fn rescale(self, v: f64) -> f64 {
        ((v - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
    }
}

/// One raw sample. Pointer/gaze use `x`/`y`, pressure uses `value`, voice uses `text`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub t_ms: f64,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawChannel {
    pub kind: ChannelKind,
    /// Sensor confidence in [0, 1].
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub range: CoordRange,
    pub samples: Vec<RawSample>,
}

fn default_confidence() -> f64 {
    1.0
}

/// A burst of raw input across channels.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInput {
    pub channels: Vec<RawChannel>,
}

/// One resampled instant on the unified timeline. All values in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureFrame {
    /// Milliseconds after the event timestamp.
    pub offset_ms: u32,
    pub pointer: [f64; 2],
    pub gaze: Option<[f64; 2]>,
    pub pressure: f64,
    pub velocity: f64,
}

/// Fixed-order feature vector used by tree induction:
/// `[pointer_x, pointer_y, velocity, pressure, context]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub [f64; FEATURE_COUNT]);

impl FeatureVector {
    pub const POINTER_X: usize = 0;
    pub const POINTER_Y: usize = 1;
    pub const VELOCITY: usize = 2;
    pub const PRESSURE: usize = 3;
    pub const CONTEXT: usize = 4;

    pub const NAMES: [&'static str; FEATURE_COUNT] =
        ["pointer_x", "pointer_y", "velocity", "pressure", "context"];

    pub fn get(&self, feature: usize) -> f64 {
        self.0[feature]
    }

    /// Component-wise midpoint of two vectors.
    pub fn midpoint(&self, other: &FeatureVector) -> FeatureVector {
        let mut out = [0.0; FEATURE_COUNT];
        for (i, v) in out.iter_mut().enumerate() {
            *v = (self.0[i] + other.0[i]) / 2.0;
        }
        FeatureVector(out)
    }
}

/// Normalized, immutable result of one input burst.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultimodalEvent {
    timestamp_ms: u64,
    frames: Vec<FeatureFrame>,
    text: Option<String>,
    ambiguity: f64,
}

impl MultimodalEvent {
    /// A single-instant event built from already-normalized values.
    pub fn single(
        timestamp_ms: u64,
        pointer: [f64; 2],
        velocity: f64,
        pressure: f64,
        ambiguity: f64,
    ) -> Self {
        Self {
            timestamp_ms,
            frames: vec![FeatureFrame {
                offset_ms: 0,
                pointer: [pointer[0].clamp(0.0, 1.0), pointer[1].clamp(0.0, 1.0)],
                gaze: None,
                pressure: pressure.clamp(0.0, 1.0),
                velocity: velocity.clamp(0.0, 1.0),
            }],
            text: None,
            ambiguity: ambiguity.clamp(0.0, 1.0),
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn frames(&self) -> &[FeatureFrame] {
        &self.frames
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn ambiguity(&self) -> f64 {
        self.ambiguity
    }

    /// Feature vector of one frame, with the event ambiguity as context.
    pub fn frame_vector(&self, frame: &FeatureFrame) -> FeatureVector {
        FeatureVector([
            frame.pointer[0],
            frame.pointer[1],
            frame.velocity,
            frame.pressure,
            self.ambiguity,
        ])
    }

    /// Mean feature vector across all frames.
    pub fn feature_vector(&self) -> FeatureVector {
        let n = self.frames.len().max(1) as f64;
        let mut sums = [0.0; FEATURE_COUNT];
        for frame in &self.frames {
            sums[FeatureVector::POINTER_X] += frame.pointer[0];
            sums[FeatureVector::POINTER_Y] += frame.pointer[1];
            sums[FeatureVector::VELOCITY] += frame.velocity;
            sums[FeatureVector::PRESSURE] += frame.pressure;
        }
        for s in sums.iter_mut().take(FeatureVector::CONTEXT) {
            *s /= n;
        }
        sums[FeatureVector::CONTEXT] = self.ambiguity;
        FeatureVector(sums)
    }
}

/// Stateless; never blocks.
pub struct FeatureNormalizer;

impl FeatureNormalizer {
    pub fn normalize(input: &RawInput) -> Result<MultimodalEvent, PipelineError> {
        let channels: Vec<&RawChannel> = input
            .channels
            .iter()
            .filter(|c| !c.samples.is_empty())
            .collect();
        if channels.is_empty() {
            return Err(PipelineError::MalformedInput(
                "no channel carries samples".to_string(),
            ));
        }
        for channel in &channels {
            validate_channel(channel)?;
        }

        let sorted: Vec<(ChannelKind, f64, CoordRange, Vec<RawSample>)> = channels
            .iter()
            .map(|c| {
                let mut samples = c.samples.clone();
                samples.sort_by(|a, b| a.t_ms.total_cmp(&b.t_ms));
                (c.kind, c.confidence.clamp(0.0, 1.0), c.range, samples)
            })
            .collect();

        // Reference timeline: highest-confidence numeric channel, earliest on ties.
        let reference = sorted
            .iter()
            .enumerate()
            .filter(|(_, (kind, ..))| kind.is_numeric())
            .fold(None::<(usize, f64)>, |best, (i, (_, conf, ..))| match best {
                Some((_, best_conf)) if best_conf >= *conf => best,
                _ => Some((i, *conf)),
            })
            .map(|(i, _)| i);

        let timeline: Vec<f64> = {
            let source = match reference {
                Some(i) => &sorted[i].3,
                None => &sorted[0].3,
            };
            let mut times: Vec<f64> = source.iter().map(|s| s.t_ms).collect();
            times.dedup_by(|a, b| (*a - *b).abs() < EPSILON);
            times
        };
        let t0 = timeline[0];

        let find = |kind: ChannelKind| sorted.iter().find(|(k, ..)| *k == kind);
        let pointer = find(ChannelKind::Pointer);
        let gaze = find(ChannelKind::Gaze);
        let pressure = find(ChannelKind::Pressure);

        let mut frames = Vec::with_capacity(timeline.len());
        for &t in &timeline {
            let gaze_xy = gaze.map(|(_, _, range, samples)| {
                [
                    range.rescale(interpolate(samples, t, |s| s.x)),
                    range.rescale(interpolate(samples, t, |s| s.y)),
                ]
            });
            let pointer_xy = match pointer {
                Some((_, _, range, samples)) => [
                    range.rescale(interpolate(samples, t, |s| s.x)),
                    range.rescale(interpolate(samples, t, |s| s.y)),
                ],
                None => gaze_xy.unwrap_or([0.5, 0.5]),
            };
            let pressure_v = pressure
                .map(|(_, _, range, samples)| range.rescale(interpolate(samples, t, |s| s.value)))
                .unwrap_or(0.0);
            frames.push(FeatureFrame {
                offset_ms: (t - t0).round().max(0.0) as u32,
                pointer: pointer_xy,
                gaze: gaze_xy,
                pressure: pressure_v,
                velocity: 0.0,
            });
        }
        assign_velocities(&mut frames, &timeline);

        let text = {
            let words: Vec<String> = sorted
                .iter()
                .filter(|(k, ..)| *k == ChannelKind::Voice)
                .flat_map(|(.., samples)| samples.iter().filter_map(|s| s.text.clone()))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if words.is_empty() { None } else { Some(words.join(" ")) }
        };

        let mean_confidence =
            sorted.iter().map(|(_, conf, ..)| *conf).sum::<f64>() / sorted.len() as f64;
        let jitters: Vec<f64> = sorted
            .iter()
            .filter(|(k, ..)| k.is_numeric())
            .map(|(.., samples)| interval_jitter(samples))
            .collect();
        let jitter = if jitters.is_empty() {
            0.0
        } else {
            jitters.iter().sum::<f64>() / jitters.len() as f64
        };
        let ambiguity = (0.6 * (1.0 - mean_confidence) + 0.4 * jitter).clamp(0.0, 1.0);

        Ok(MultimodalEvent {
            timestamp_ms: t0.round().max(0.0) as u64,
            frames,
            text,
            ambiguity,
        })
    }
}

fn validate_channel(channel: &RawChannel) -> Result<(), PipelineError> {
    if !channel.confidence.is_finite() {
        return Err(PipelineError::MalformedInput(format!(
            "{:?} channel confidence is not finite",
            channel.kind
        )));
    }
    if channel.kind.is_numeric()
        && (!channel.range.min.is_finite()
            || !channel.range.max.is_finite()
            || channel.range.max - channel.range.min < EPSILON)
    {
        return Err(PipelineError::MalformedInput(format!(
            "{:?} channel has degenerate range [{}, {}]",
            channel.kind, channel.range.min, channel.range.max
        )));
    }
    let bad = channel
        .samples
        .iter()
        .any(|s| !s.t_ms.is_finite() || !s.x.is_finite() || !s.y.is_finite() || !s.value.is_finite());
    if bad {
        return Err(PipelineError::MalformedInput(format!(
            "{:?} channel contains non-finite samples",
            channel.kind
        )));
    }
    Ok(())
}

/// Linear interpolation of `extract` at time `t`, clamped at both ends.
fn interpolate(samples: &[RawSample], t: f64, extract: impl Fn(&RawSample) -> f64) -> f64 {
    let first = &samples[0];
    let last = &samples[samples.len() - 1];
    if t <= first.t_ms {
        return extract(first);
    }
    if t >= last.t_ms {
        return extract(last);
    }
    let idx = samples.partition_point(|s| s.t_ms <= t);
    let (a, b) = (&samples[idx - 1], &samples[idx]);
    let span = b.t_ms - a.t_ms;
    if span < EPSILON {
        return extract(b);
    }
    let w = (t - a.t_ms) / span;
    extract(a) + w * (extract(b) - extract(a))
}

/// Normalized pointer speed per frame. The first frame borrows the second's.
fn assign_velocities(frames: &mut [FeatureFrame], timeline: &[f64]) {
    for i in 1..frames.len() {
        let dt_s = (timeline[i] - timeline[i - 1]) / 1000.0;
        let dx = frames[i].pointer[0] - frames[i - 1].pointer[0];
        let dy = frames[i].pointer[1] - frames[i - 1].pointer[1];
        let speed = if dt_s > EPSILON {
            (dx * dx + dy * dy).sqrt() / dt_s
        } else {
            0.0
        };
        frames[i].velocity = (speed / VELOCITY_SCALE).min(1.0);
    }
    if frames.len() > 1 {
        frames[0].velocity = frames[1].velocity;
    }
}

/// Coefficient of variation of inter-sample intervals, clamped to [0, 1].
/// Channels with fewer than three samples contribute no jitter.
fn interval_jitter(samples: &[RawSample]) -> f64 {
    if samples.len() < 3 {
        return 0.0;
    }
    let gaps: Vec<f64> = samples.windows(2).map(|w| w[1].t_ms - w[0].t_ms).collect();
    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    if mean < EPSILON {
        return 1.0;
    }
    let var = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
    (var.sqrt() / mean).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pointer_channel(confidence: f64, points: &[(f64, f64, f64)]) -> RawChannel {
        RawChannel {
            kind: ChannelKind::Pointer,
            confidence,
            range: CoordRange::default(),
            samples: points
                .iter()
                .map(|&(t, x, y)| RawSample { t_ms: t, x, y, ..Default::default() })
                .collect(),
        }
    }

    #[test]
    fn test_zero_channels_is_malformed() {
        let err = FeatureNormalizer::normalize(&RawInput::default()).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedInput(_)));
    }

    #[test]
    fn test_empty_channels_are_malformed() {
        let input = RawInput {
            channels: vec![pointer_channel(1.0, &[])],
        };
        assert!(matches!(
            FeatureNormalizer::normalize(&input),
            Err(PipelineError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_degenerate_range_rejected() {
        let mut ch = pointer_channel(1.0, &[(0.0, 0.5, 0.5)]);
        ch.range = CoordRange { min: 3.0, max: 3.0 };
        let input = RawInput { channels: vec![ch] };
        assert!(FeatureNormalizer::normalize(&input).is_err());
    }

    #[test]
    fn test_rescales_into_unit_range() {
        let mut ch = pointer_channel(1.0, &[(1000.0, 960.0, 540.0), (1010.0, 2500.0, -20.0)]);
        ch.range = CoordRange { min: 0.0, max: 1920.0 };
        let event = FeatureNormalizer::normalize(&RawInput { channels: vec![ch] }).unwrap();
        let f = event.frames();
        assert!((f[0].pointer[0] - 0.5).abs() < 1e-12);
        assert_eq!(f[1].pointer[0], 1.0);
        assert_eq!(f[1].pointer[1], 0.0);
        assert_eq!(event.timestamp_ms(), 1000);
        assert_eq!(f[1].offset_ms, 10);
    }

    #[test]
    fn test_resamples_onto_highest_confidence_timeline() {
        let pointer = pointer_channel(0.9, &[(0.0, 0.0, 0.0), (10.0, 0.1, 0.0), (20.0, 0.2, 0.0)]);
        let pressure = RawChannel {
            kind: ChannelKind::Pressure,
            confidence: 0.5,
            range: CoordRange::default(),
            samples: vec![
                RawSample { t_ms: 0.0, value: 0.0, ..Default::default() },
                RawSample { t_ms: 40.0, value: 0.8, ..Default::default() },
            ],
        };
        let event = FeatureNormalizer::normalize(&RawInput {
            channels: vec![pressure, pointer],
        })
        .unwrap();
        assert_eq!(event.frames().len(), 3);
        // pressure interpolated at t = 10 and t = 20
        assert!((event.frames()[1].pressure - 0.2).abs() < 1e-12);
        assert!((event.frames()[2].pressure - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_velocity_from_pointer_motion() {
        // 0.1 units per 100ms = 1 unit/s → 0.25 after scaling
        let ch = pointer_channel(1.0, &[(0.0, 0.0, 0.0), (100.0, 0.1, 0.0)]);
        let event = FeatureNormalizer::normalize(&RawInput { channels: vec![ch] }).unwrap();
        assert!((event.frames()[1].velocity - 0.25).abs() < 1e-9);
        assert_eq!(event.frames()[0].velocity, event.frames()[1].velocity);
    }

    #[test]
    fn test_ambiguity_grows_with_jitter_and_low_confidence() {
        let steady = pointer_channel(1.0, &[(0.0, 0.1, 0.1), (10.0, 0.1, 0.1), (20.0, 0.1, 0.1), (30.0, 0.1, 0.1)]);
        let jittery = pointer_channel(0.4, &[(0.0, 0.1, 0.1), (2.0, 0.1, 0.1), (30.0, 0.1, 0.1), (31.0, 0.1, 0.1)]);
        let a = FeatureNormalizer::normalize(&RawInput { channels: vec![steady] }).unwrap();
        let b = FeatureNormalizer::normalize(&RawInput { channels: vec![jittery] }).unwrap();
        assert!(a.ambiguity() < 1e-9, "steady full-confidence input: {}", a.ambiguity());
        assert!(b.ambiguity() > 0.5, "jittery low-confidence input: {}", b.ambiguity());
    }

    #[test]
    fn test_voice_only_event() {
        let voice = RawChannel {
            kind: ChannelKind::Voice,
            confidence: 0.8,
            range: CoordRange::default(),
            samples: vec![
                RawSample { t_ms: 5.0, text: Some("open".into()), ..Default::default() },
                RawSample { t_ms: 9.0, text: Some(" the door ".into()), ..Default::default() },
            ],
        };
        let event = FeatureNormalizer::normalize(&RawInput { channels: vec![voice] }).unwrap();
        assert_eq!(event.text(), Some("open the door"));
        assert_eq!(event.frames()[0].pointer, [0.5, 0.5]);
    }

    #[test]
    fn test_single_event_feature_vector() {
        let event = MultimodalEvent::single(0, [0.2, 0.2], 0.1, 0.05, 0.1);
        let fv = event.feature_vector();
        assert_eq!(fv.0, [0.2, 0.2, 0.1, 0.05, 0.1]);
    }
}
