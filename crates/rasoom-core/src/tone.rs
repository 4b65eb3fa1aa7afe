//! ToneSequencer: symbolic units → a 12-step tonal sequence with gamaka and tala.
//!
//! The sequence is a redundant intermediate form. Each tone is placed in the
//! register of its unit's tier, and banding the placed ratio recovers a tier
//! again. That recovered tier is only ever a consistency check: routing reads
//! the tier from `RoutingMetadata` and nothing else.

use serde::{Deserialize, Serialize};

use crate::constants::{
    BEAT_MS, DOMAIN_REGISTER_CEILING, MAX_GAP_BEATS, MICRO_REGISTER_CEILING, STEP_RATIOS,
    TONE_TABLE,
};
use crate::ratio::Ratio;
use crate::symbol::SymbolicUnit;
use crate::tier::Tier;

/// One of the 12 fixed tonal steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToneStep(u8);

impl ToneStep {
    pub const NAMES: [&'static str; 12] = [
        "sa", "ri1", "ri2", "ga1", "ga2", "ma1", "ma2", "pa", "da1", "da2", "ni1", "ni2",
    ];

    pub fn new(step: u8) -> Option<Self> {
        (step < 12).then_some(Self(step))
    }

    /// Table lookup keyed by `(base_symbol, length_class)`.
    pub fn lookup(base_symbol: u8, length_class: u8) -> Self {
        let row = TONE_TABLE[base_symbol as usize % TONE_TABLE.len()];
        let col = (length_class.clamp(1, 3) - 1) as usize;
        Self(row[col])
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn name(self) -> &'static str {
        Self::NAMES[self.0 as usize]
    }

    pub fn ratio(self) -> Ratio {
        let (n, d) = STEP_RATIOS[self.0 as usize];
        Ratio::new(n, d)
    }

    /// Sa and Pa are the fixed (achala) steps.
    pub fn is_stable(self) -> bool {
        self.0 == 0 || self.0 == 7
    }
}

/// Register (octave placement) associated with each tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Register {
    Mandra,
    Madhya,
    Tara,
}

impl Register {
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Micro => Register::Mandra,
            Tier::Domain => Register::Madhya,
            Tier::Prime => Register::Tara,
        }
    }

    pub fn tier(self) -> Tier {
        match self {
            Register::Mandra => Tier::Micro,
            Register::Madhya => Tier::Domain,
            Register::Tara => Tier::Prime,
        }
    }

    /// Exact placement of a step ratio in this register.
    pub fn place(self, r: Ratio) -> Ratio {
        match self {
            Register::Mandra => r.mul(Ratio::new(4, 5)),
            Register::Madhya => r.add(Ratio::integer(7)).mul(Ratio::new(1, 5)),
            Register::Tara => r.mul(Ratio::integer(2)),
        }
    }
}

/// Fixed 3-way banding of a placed frequency ratio.
pub fn band(ratio: f64) -> Tier {
    if ratio <= MICRO_REGISTER_CEILING {
        Tier::Micro
    } else if ratio <= DOMAIN_REGISTER_CEILING {
        Tier::Domain
    } else {
        Tier::Prime
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tone {
    pub step: ToneStep,
    pub register: Register,
    /// Oscillation amplitude in [0, 1].
    pub gamaka: f64,
}

impl Tone {
    pub fn ratio(&self) -> Ratio {
        self.register.place(self.step.ratio())
    }

    /// Recover step and register from a placed ratio.
    pub fn locate(ratio: Ratio) -> Option<(ToneStep, Register)> {
        [Register::Mandra, Register::Madhya, Register::Tara]
            .into_iter()
            .flat_map(|reg| (0..12u8).map(move |s| (ToneStep(s), reg)))
            .find(|(step, reg)| reg.place(step.ratio()) == ratio)
    }
}

/// The four rhythmic cycles, ordered by beat count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TalaPattern {
    Tisra,
    Chatusra,
    Khanda,
    Misra,
}

impl TalaPattern {
    pub const ALL: [TalaPattern; 4] = [
        TalaPattern::Tisra,
        TalaPattern::Chatusra,
        TalaPattern::Khanda,
        TalaPattern::Misra,
    ];

    pub fn weights(self) -> &'static [f64] {
        match self {
            TalaPattern::Tisra => &[1.0, 0.5, 0.5],
            TalaPattern::Chatusra => &[1.0, 0.5, 0.75, 0.5],
            TalaPattern::Khanda => &[1.0, 0.5, 0.75, 0.5, 0.5],
            TalaPattern::Misra => &[1.0, 0.5, 0.5, 0.75, 0.5, 0.75, 0.5],
        }
    }

    pub fn beats(self) -> usize {
        self.weights().len()
    }

    /// Pattern whose beat count is closest to `units`; ties favor the shorter.
    pub fn closest(units: usize) -> Self {
        let mut best = TalaPattern::Tisra;
        for pattern in Self::ALL {
            if pattern.beats().abs_diff(units) < best.beats().abs_diff(units) {
                best = pattern;
            }
        }
        best
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

/// Rhythmic cycle: a beat pattern plus quantized inter-unit gaps (in beats).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tala {
    pub pattern: TalaPattern,
    pub gaps: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToneSequence {
    tones: Vec<Tone>,
    tala: Tala,
}

impl ToneSequence {
    pub fn new(tones: Vec<Tone>, tala: Tala) -> Self {
        Self { tones, tala }
    }

    pub fn tones(&self) -> &[Tone] {
        &self.tones
    }

    pub fn steps(&self) -> impl Iterator<Item = ToneStep> + '_ {
        self.tones.iter().map(|t| t.step)
    }

    pub fn gamakas(&self) -> impl Iterator<Item = f64> + '_ {
        self.tones.iter().map(|t| t.gamaka)
    }

    pub fn tala(&self) -> &Tala {
        &self.tala
    }

    pub fn len(&self) -> usize {
        self.tones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tones.is_empty()
    }

    /// Octave-derived tier for each tone.
    pub fn octave_tiers(&self) -> Vec<Tier> {
        self.tones.iter().map(|t| band(t.ratio().as_f64())).collect()
    }

    /// Compare octave-derived tiers against the units' authoritative flags.
    pub fn tier_check(&self, units: &[SymbolicUnit]) -> TierCheck {
        let total = self.tones.len().max(units.len());
        let agree = self
            .octave_tiers()
            .iter()
            .zip(units.iter())
            .filter(|(octave, unit)| **octave == unit.tier)
            .count();
        if agree == total {
            TierCheck::Consistent
        } else {
            TierCheck::Divergent {
                mismatches: total - agree,
                total,
            }
        }
    }
}

/// Outcome of the redundant octave→tier check. Never authoritative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TierCheck {
    Consistent,
    Divergent { mismatches: usize, total: usize },
}

impl TierCheck {
    pub fn is_consistent(&self) -> bool {
        matches!(self, TierCheck::Consistent)
    }
}

pub struct ToneSequencer;

impl ToneSequencer {
    pub fn sequence(units: &[SymbolicUnit]) -> ToneSequence {
        let tones = units
            .iter()
            .map(|u| Tone {
                step: ToneStep::lookup(u.base_symbol, u.length_class),
                register: Register::for_tier(u.tier),
                gamaka: u.affect.gamaka_amplitude(),
            })
            .collect();
        let gaps = units
            .windows(2)
            .map(|w| quantize_gap(w[1].offset_ms.saturating_sub(w[0].offset_ms)))
            .collect();
        ToneSequence {
            tones,
            tala: Tala {
                pattern: TalaPattern::closest(units.len()),
                gaps,
            },
        }
    }
}

fn quantize_gap(ms: u32) -> u8 {
    let beats = (ms + BEAT_MS / 2) / BEAT_MS;
    beats.min(u32::from(MAX_GAP_BEATS)) as u8
}
