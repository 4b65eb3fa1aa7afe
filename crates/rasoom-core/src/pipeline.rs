//! Stage composition: raw input → binary frame, and back.
//!
//! Each stage is a plain function over owned values. `Pipeline` only holds
//! configuration and the Reed–Solomon generator, so it is `Send + Sync` and
//! one instance can serve any number of worker threads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::affect::AffectVector;
use crate::constants::{DEFAULT_PRIORITY, ESCALATION_THRESHOLD, MAX_UNITS_PER_RESOLUTION};
use crate::ecc::EccConfig;
use crate::equation::{EquationConverter, EquationSystem};
use crate::error::{CodecError, PipelineError};
use crate::frame::{BinaryCodec, BinaryFrame, FrameFlags, FrameHeader, MessageType, PayloadSections};
use crate::intent::{IntentTreeBuilder, TreePath};
use crate::normalize::{FeatureFrame, FeatureNormalizer, MultimodalEvent, RawInput};
use crate::sections;
use crate::series::{GodelCode, NumberSeries, RoutingMetadata, SeriesEncoder};
use crate::symbol::{SymbolicUnit, SymbolicUnitMapper};
use crate::tier::{Resolution, Tier};
use crate::time::now_unix_millis;
use crate::tone::{TierCheck, ToneSequence, ToneSequencer};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ecc: EccConfig,
    /// Ambiguity at or above which a message requests escalation.
    pub escalation_threshold: f64,
    /// Units kept per resolution; at most `GodelCode::MAX_UNITS`.
    pub max_units_per_resolution: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ecc: EccConfig::default(),
            escalation_threshold: ESCALATION_THRESHOLD,
            max_units_per_resolution: MAX_UNITS_PER_RESOLUTION,
        }
    }
}

/// Addressing and framing parameters supplied by the sender.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub source_id: String,
    #[serde(default = "default_target")]
    pub target: Tier,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub cluster_id: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub sequence: u32,
    /// Sender asks for emergency bypass.
    #[serde(default)]
    pub bypass: bool,
    /// Overrides the timestamp of command frames.
    #[serde(default)]
    pub timestamp_ms: Option<u64>,
}

fn default_target() -> Tier {
    Tier::Prime
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Envelope {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            target: default_target(),
            agent_id: None,
            cluster_id: None,
            priority: DEFAULT_PRIORITY,
            sequence: 0,
            bypass: false,
            timestamp_ms: None,
        }
    }

    pub fn to(mut self, tier: Tier) -> Self {
        self.target = tier;
        self
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn bypass(mut self) -> Self {
        self.bypass = true;
        self
    }

    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if !(1..=10).contains(&self.priority) {
            return Err(PipelineError::InvalidPriority(self.priority));
        }
        if self.source_id.is_empty() {
            return Err(PipelineError::MalformedInput("empty source id".into()));
        }
        let too_long = [Some(&self.source_id), self.agent_id.as_ref(), self.cluster_id.as_ref()]
            .into_iter()
            .flatten()
            .any(|s| s.len() > u16::MAX as usize);
        if too_long {
            return Err(PipelineError::MalformedInput(
                "identifier longer than 65535 bytes".into(),
            ));
        }
        Ok(())
    }
}

/// A frame plus every intermediate form that produced it.
#[derive(Clone, Debug)]
pub struct EncodedMessage {
    pub frame: BinaryFrame,
    pub intents: Vec<TreePath>,
    pub units: Vec<SymbolicUnit>,
    pub tones: ToneSequence,
    pub equation: EquationSystem,
    pub series: NumberSeries,
    pub tier_check: TierCheck,
}

#[derive(Clone, Debug, Serialize)]
pub struct DecodedMessage {
    pub header: FrameHeader,
    pub ambiguity: f64,
    pub text: Option<String>,
    /// Summary path per resolution; empty for command frames.
    pub intents: Vec<TreePath>,
    pub units: Vec<SymbolicUnit>,
    pub tones: ToneSequence,
    pub equation: EquationSystem,
    pub series: NumberSeries,
    pub tier_check: TierCheck,
    /// Symbols repaired by Reed–Solomon.
    pub corrected: usize,
    /// True when the payload could not be corrected and was parsed as-is.
    pub degraded: bool,
}

impl DecodedMessage {
    pub fn intent(&self, resolution: Resolution) -> Option<&TreePath> {
        self.intents.iter().find(|p| p.resolution == resolution)
    }

    pub fn metadata(&self) -> &RoutingMetadata {
        &self.series.metadata
    }
}

struct Draft<'a> {
    message_type: MessageType,
    timestamp_ms: u64,
    ambiguity: f64,
    text: Option<&'a str>,
    intents: Vec<TreePath>,
    units: Vec<SymbolicUnit>,
    escalate: bool,
}

#[derive(Clone, Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    codec: BinaryCodec,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let cap = config.max_units_per_resolution;
        if cap == 0 || cap > GodelCode::MAX_UNITS {
            return Err(PipelineError::Config(format!(
                "max_units_per_resolution must be within 1..={}, got {cap}",
                GodelCode::MAX_UNITS
            )));
        }
        let codec = BinaryCodec::new(&config.ecc)?;
        Ok(Self { config, codec })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Full path: normalize raw channels, then encode.
    pub fn encode(&self, raw: &RawInput, envelope: &Envelope) -> Result<EncodedMessage, PipelineError> {
        envelope.validate()?;
        let event = FeatureNormalizer::normalize(raw)?;
        self.encode_event(&event, envelope)
    }

    /// Encode an already-normalized event.
    pub fn encode_event(
        &self,
        event: &MultimodalEvent,
        envelope: &Envelope,
    ) -> Result<EncodedMessage, PipelineError> {
        envelope.validate()?;
        let trees = IntentTreeBuilder::build(event);
        let summary = event.feature_vector();
        let intents: Vec<TreePath> = trees.iter().map(|t| t.path(&summary, 0)).collect();

        let frames = decimate(event.frames(), self.config.max_units_per_resolution);
        let units: Vec<SymbolicUnit> = trees
            .iter()
            .flat_map(|tree| {
                frames.iter().map(move |f| {
                    SymbolicUnitMapper::map(&tree.path(&event.frame_vector(f), f.offset_ms))
                })
            })
            .collect();

        self.finish(
            Draft {
                message_type: MessageType::Data,
                timestamp_ms: event.timestamp_ms(),
                ambiguity: event.ambiguity(),
                text: event.text(),
                intents,
                units,
                escalate: event.ambiguity() >= self.config.escalation_threshold,
            },
            envelope,
        )
    }

    /// Legacy text command: a single unit at the target tier, with no
    /// normalization or tree induction.
    pub fn encode_command(
        &self,
        command: &str,
        envelope: &Envelope,
    ) -> Result<EncodedMessage, PipelineError> {
        envelope.validate()?;
        let command = command.trim();
        if command.is_empty() {
            return Err(PipelineError::MalformedInput("empty command".into()));
        }
        if command.len() > u16::MAX as usize {
            return Err(PipelineError::MalformedInput(format!(
                "command of {} bytes exceeds 65535",
                command.len()
            )));
        }
        let checksum: u32 = command.bytes().map(u32::from).sum();
        let unit = SymbolicUnit {
            base_symbol: (checksum % 12) as u8,
            length_class: 1,
            intensity_class: envelope.priority.clamp(1, 9),
            tier: envelope.target,
            affect: AffectVector::neutral(),
            offset_ms: 0,
        };
        self.finish(
            Draft {
                message_type: MessageType::Command,
                timestamp_ms: envelope.timestamp_ms.unwrap_or_else(now_unix_millis),
                ambiguity: 0.0,
                text: Some(command),
                intents: Vec::new(),
                units: vec![unit],
                escalate: false,
            },
            envelope,
        )
    }

    fn finish(&self, draft: Draft<'_>, envelope: &Envelope) -> Result<EncodedMessage, PipelineError> {
        let tones = ToneSequencer::sequence(&draft.units);
        let tier_check = tones.tier_check(&draft.units);
        let equation = EquationConverter::convert(&tones);
        let metadata = RoutingMetadata {
            tier: envelope.target,
            agent_id: envelope.agent_id.clone(),
            cluster_id: envelope.cluster_id.clone(),
            priority: envelope.priority,
            timestamp_ms: draft.timestamp_ms,
            escalate: draft.escalate,
        };
        let series = SeriesEncoder::encode(&equation, &draft.units, metadata)?;

        let payload = PayloadSections {
            affect: sections::write_affect(&draft.intents)?,
            tree: sections::write_tree(draft.ambiguity, draft.text, &draft.intents)?,
            symbolic: sections::write_symbolic(&draft.units)?,
            equation: sections::write_equation(&equation)?,
            series: sections::write_series(&series)?,
        };
        let header = FrameHeader {
            version: 0,
            message_type: draft.message_type,
            flags: FrameFlags {
                escalate: draft.escalate,
                bypass: envelope.bypass,
            },
            timestamp_ms: draft.timestamp_ms,
            source_id: envelope.source_id.clone(),
            target_tier: envelope.target,
            priority: envelope.priority,
            sequence: envelope.sequence,
            total_length: 0,
        };
        Ok(EncodedMessage {
            frame: self.codec.encode(header, payload)?,
            intents: draft.intents,
            units: draft.units,
            tones,
            equation,
            series,
            tier_check,
        })
    }

    /// Strict decode: ECC failure is an error carrying the degraded frame.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedMessage, PipelineError> {
        let decoded = self.codec.decode(bytes)?;
        interpret(
            decoded.frame.header().clone(),
            decoded.frame.sections().clone(),
            decoded.corrected,
            false,
        )
    }

    /// Like `decode`, but parses an uncorrectable payload as-is and marks
    /// the result `degraded`.
    pub fn decode_lossy(&self, bytes: &[u8]) -> Result<DecodedMessage, PipelineError> {
        match self.codec.decode(bytes) {
            Ok(decoded) => interpret(
                decoded.frame.header().clone(),
                decoded.frame.sections().clone(),
                decoded.corrected,
                false,
            ),
            Err(CodecError::EccUncorrectable { degraded, .. }) => {
                let degraded = *degraded;
                let sections = PayloadSections::from_bytes(Bytes::from(degraded.payload))?;
                interpret(degraded.header, sections, 0, true)
            }
            Err(other) => Err(other.into()),
        }
    }
}

fn interpret(
    header: FrameHeader,
    payload: PayloadSections,
    corrected: usize,
    degraded: bool,
) -> Result<DecodedMessage, PipelineError> {
    let affect = sections::read_affect(payload.affect)?;
    let tree = sections::read_tree(payload.tree)?;
    if affect.len() != tree.paths.len() {
        return Err(CodecError::InvalidField {
            field: "affect vector count",
            value: affect.len() as u64,
        }
        .into());
    }
    let intents: Vec<TreePath> = tree
        .paths
        .into_iter()
        .zip(affect)
        .map(|(mut path, affect)| {
            path.leaf.affect = affect;
            path
        })
        .collect();

    let units = sections::read_symbolic(payload.symbolic)?;
    let equation = sections::read_equation(payload.equation)?;
    let series = sections::read_series(payload.series)?;

    if series.metadata.tier != header.target_tier {
        return Err(PipelineError::TierMismatch {
            metadata: series.metadata.tier,
            header: header.target_tier,
        });
    }
    if series.metadata.priority != header.priority {
        return Err(CodecError::InvalidField {
            field: "metadata priority",
            value: u64::from(series.metadata.priority),
        }
        .into());
    }
    if !series.codes_match(&units) {
        return Err(CodecError::InvalidField {
            field: "godel code",
            value: units.len() as u64,
        }
        .into());
    }

    let tones = equation.to_tone_sequence()?;
    let tier_check = tones.tier_check(&units);
    Ok(DecodedMessage {
        header,
        ambiguity: tree.ambiguity,
        text: tree.text,
        intents,
        units,
        tones,
        equation,
        series,
        tier_check,
        corrected,
        degraded,
    })
}

/// At most `cap` frames, evenly strided, first frame always kept.
fn decimate(frames: &[FeatureFrame], cap: usize) -> Vec<FeatureFrame> {
    let cap = cap.max(1);
    let stride = frames.len().div_ceil(cap).max(1);
    frames.iter().step_by(stride).take(cap).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> Pipeline {
        Pipeline::new(PipelineConfig::default()).unwrap()
    }

    fn scenario() -> MultimodalEvent {
        MultimodalEvent::single(1_700_000_000_000, [0.2, 0.2], 0.1, 0.05, 0.1)
    }

    #[test]
    fn test_scenario_frame_targets_prime() {
        let msg = pipeline().encode_event(&scenario(), &Envelope::new("prime-01")).unwrap();
        assert_eq!(msg.frame.header().target_tier, Tier::Prime);
        assert_eq!(msg.frame.as_bytes()[msg.frame.header().source_id.len() + 12], 1);
        assert_eq!(msg.intents[0].leaf.label, "confirm");
        let first = msg.units[0];
        assert_eq!(
            (first.base_symbol, first.length_class, first.intensity_class, first.tier),
            (2, 1, 1, Tier::Prime)
        );
        let tone = msg.tones.tones()[0];
        assert_eq!(tone.step.index(), 0);
        assert!(tone.gamaka < 0.1, "gamaka {}", tone.gamaka);
        assert!(msg.tier_check.is_consistent());
        assert!(!msg.series.metadata.escalate);
    }

    #[test]
    fn test_decode_restores_intents() {
        let p = pipeline();
        let msg = p.encode_event(&scenario(), &Envelope::new("prime-01")).unwrap();
        let back = p.decode(msg.frame.as_bytes()).unwrap();
        assert_eq!(back.intents, msg.intents);
        assert_eq!(back.units, msg.units);
        assert_eq!(back.tones, msg.tones);
        assert_eq!(back.series, msg.series);
        assert!(!back.degraded);
        assert_eq!(back.corrected, 0);
    }

    #[test]
    fn test_high_ambiguity_sets_escalate_flag() {
        let event = MultimodalEvent::single(5, [0.5, 0.5], 0.2, 0.2, 0.9);
        let msg = pipeline().encode_event(&event, &Envelope::new("m-1")).unwrap();
        assert!(msg.series.metadata.escalate);
        assert!(msg.frame.header().flags.escalate);
    }

    #[test]
    fn test_command_bypasses_trees() {
        let p = pipeline();
        let env = Envelope::new("cli").at(42).priority(7);
        let msg = p.encode_command("  deploy  ", &env).unwrap();
        assert!(msg.intents.is_empty());
        assert_eq!(msg.units.len(), 1);
        assert_eq!(msg.units[0].tier, Tier::Prime);
        assert_eq!(msg.frame.header().message_type, MessageType::Command);
        let back = p.decode(msg.frame.as_bytes()).unwrap();
        assert_eq!(back.text.as_deref(), Some("deploy"));
        assert_eq!(back.header.timestamp_ms, 42);
        assert_eq!(back.metadata().priority, 7);
    }

    #[test]
    fn test_envelope_validation() {
        let p = pipeline();
        let bad = Envelope::new("x").priority(11);
        assert!(matches!(
            p.encode_command("go", &bad),
            Err(PipelineError::InvalidPriority(11))
        ));
        assert!(matches!(
            p.encode_command("   ", &Envelope::new("x")),
            Err(PipelineError::MalformedInput(_))
        ));
        assert!(p.encode_command("go", &Envelope::new("")).is_err());
    }

    #[test]
    fn test_decimate_caps_units() {
        let frames: Vec<FeatureFrame> = (0..20)
            .map(|i| FeatureFrame {
                offset_ms: i * 10,
                pointer: [0.5, 0.5],
                gaze: None,
                pressure: 0.5,
                velocity: 0.2,
            })
            .collect();
        let kept = decimate(&frames, 8);
        assert_eq!(kept.len(), 7);
        assert_eq!(kept[0].offset_ms, 0);
        assert_eq!(kept[1].offset_ms, 30);
        assert_eq!(decimate(&frames[..3], 8).len(), 3);
    }

    #[test]
    fn test_lossy_decode_marks_degraded() {
        let p = pipeline();
        let msg = p.encode_event(&scenario(), &Envelope::new("prime-01")).unwrap();
        let mut bytes = msg.frame.as_bytes().to_vec();
        // Corrupt 17 parity bytes of the last block: the data stays intact.
        let n = bytes.len();
        for i in 0..17 {
            bytes[n - 1 - i] ^= 0xff;
        }
        assert!(p.decode(&bytes).unwrap_err().is_ecc_uncorrectable());
        let lossy = p.decode_lossy(&bytes).unwrap();
        assert!(lossy.degraded);
        assert_eq!(lossy.intents, msg.intents);
    }
}
