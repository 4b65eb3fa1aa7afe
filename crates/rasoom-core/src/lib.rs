//! Rasoom encode/decode pipeline.
//!
//! Raw multi-channel input is normalized into one event, induced into intent
//! trees at three resolutions, mapped to phonotactic symbols, sequenced as
//! tones, restated as exact equations and number series, and finally framed
//! as bytes under a Reed–Solomon code. Decoding walks the chain backwards.
//!
//! Zero I/O: routing, persistence and transport live in other crates.

pub mod affect;
pub mod constants;
pub mod ecc;
pub mod equation;
pub mod error;
pub mod frame;
pub mod intent;
pub mod normalize;
pub mod pipeline;
pub mod ratio;
mod sections;
pub mod series;
pub mod symbol;
pub mod synth;
pub mod tier;
pub mod time;
pub mod tone;

pub use affect::AffectVector;
pub use constants::{BYPASS_PRIORITY, DEFAULT_PRIORITY, ESCALATION_THRESHOLD, FRAME_VERSION};
pub use ecc::{EccConfig, ReedSolomon};
pub use equation::{EquationConverter, EquationSystem};
pub use error::{CodecError, DegradedFrame, PipelineError};
pub use frame::{BinaryCodec, BinaryFrame, FrameFlags, FrameHeader, MessageType, PayloadSections};
pub use intent::{ContextFrame, IntentLeaf, IntentTree, IntentTreeBuilder, TreePath};
pub use normalize::{
    ChannelKind, CoordRange, FeatureNormalizer, FeatureVector, MultimodalEvent, RawChannel,
    RawInput, RawSample,
};
pub use pipeline::{DecodedMessage, EncodedMessage, Envelope, Pipeline, PipelineConfig};
pub use ratio::Ratio;
pub use series::{GodelCode, NumberSeries, RoutingMetadata, SeriesEncoder};
pub use symbol::{SymbolicUnit, SymbolicUnitMapper};
pub use tier::{Resolution, Tier};
pub use tone::{TierCheck, ToneSequence, ToneSequencer};
