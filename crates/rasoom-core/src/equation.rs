use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, TAU};

use serde::{Deserialize, Serialize};

use crate::constants::{ACCENT_WEIGHT, BEAT_MS, FUNDAMENTAL, HARMONIC_COUNT};
use crate::error::CodecError;
use crate::ratio::Ratio;
use crate::tone::{Tala, TalaPattern, Tone, ToneSequence};

/// Oscillation archetypes, selected by amplitude band.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Archetype {
    /// Plain, held tone.
    Sthira,
    /// Slow swing.
    Andolita,
    /// Shake.
    Kampita,
    /// Sharp, fast flick.
    Sphurita,
}

impl Archetype {
    pub const ALL: [Archetype; 4] = [
        Archetype::Sthira,
        Archetype::Andolita,
        Archetype::Kampita,
        Archetype::Sphurita,
    ];

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    pub fn for_amplitude(amplitude: f64) -> Self {
        if amplitude < 0.1 {
            Archetype::Sthira
        } else if amplitude < 0.4 {
            Archetype::Andolita
        } else if amplitude < 0.7 {
            Archetype::Kampita
        } else {
            Archetype::Sphurita
        }
    }

    /// `(frequency, decay, phase)`
    fn parameters(self) -> (f64, f64, f64) {
        match self {
            Archetype::Sthira => (0.0, 0.0, 0.0),
            Archetype::Andolita => (2.0, 0.5, 0.0),
            Archetype::Kampita => (6.0, 0.25, FRAC_PI_4),
            Archetype::Sphurita => (10.0, 0.1, FRAC_PI_2),
        }
    }
}

/// `a · e^(−t/decay) · sin(2π·f·t + φ)`; `decay == 0` means no oscillation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DampedSinusoid {
    pub archetype: Archetype,
    pub amplitude: f64,
    pub frequency: f64,
    pub decay: f64,
    pub phase: f64,
}

impl DampedSinusoid {
    pub fn from_amplitude(amplitude: f64) -> Self {
        let archetype = Archetype::for_amplitude(amplitude);
        let (frequency, decay, phase) = archetype.parameters();
        Self {
            archetype,
            amplitude,
            frequency,
            decay,
            phase,
        }
    }

    pub fn evaluate(&self, t: f64) -> f64 {
        if self.decay <= 0.0 {
            return 0.0;
        }
        self.amplitude * (-t / self.decay).exp() * (TAU * self.frequency * t + self.phase).sin()
    }
}

/// Periodic indicator over a tala: beat weight at any time, cycling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeriodicIndicator {
    pub pattern: TalaPattern,
    pub gaps: Vec<u8>,
}

impl PeriodicIndicator {
    pub fn period_ms(&self) -> u32 {
        self.pattern.beats() as u32 * BEAT_MS
    }

    pub fn weights(&self) -> &'static [f64] {
        self.pattern.weights()
    }

    pub fn value_at(&self, t_ms: u32) -> f64 {
        let beat = (t_ms % self.period_ms()) / BEAT_MS;
        self.weights()[beat as usize]
    }

    /// Beat indices carrying an accent.
    pub fn accents(&self) -> Vec<usize> {
        self.weights()
            .iter()
            .enumerate()
            .filter(|(_, w)| **w >= ACCENT_WEIGHT)
            .map(|(i, _)| i)
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HarmonicSeries {
    pub fundamental: Ratio,
    pub multiples: Vec<Ratio>,
}

impl HarmonicSeries {
    pub fn from_ratio(first: Ratio) -> Self {
        let fundamental = first.mul(Ratio::integer(FUNDAMENTAL));
        let multiples = (1..=HARMONIC_COUNT)
            .map(|k| fundamental.mul(Ratio::integer(k)))
            .collect();
        Self {
            fundamental,
            multiples,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EquationSystem {
    pub ratios: Vec<Ratio>,
    pub oscillations: Vec<DampedSinusoid>,
    pub rhythm: PeriodicIndicator,
    pub harmonics: HarmonicSeries,
}

impl EquationSystem {
    /// Rebuild the tone sequence this system was derived from.
    pub fn to_tone_sequence(&self) -> Result<ToneSequence, CodecError> {
        if self.ratios.len() != self.oscillations.len() {
            return Err(CodecError::InvalidField {
                field: "oscillation count",
                value: self.oscillations.len() as u64,
            });
        }
        let tones = self
            .ratios
            .iter()
            .zip(self.oscillations.iter())
            .map(|(ratio, osc)| {
                let (step, register) = Tone::locate(*ratio).ok_or(CodecError::InvalidField {
                    field: "tone ratio",
                    value: ratio.num,
                })?;
                Ok(Tone {
                    step,
                    register,
                    gamaka: osc.amplitude,
                })
            })
            .collect::<Result<Vec<_>, CodecError>>()?;
        Ok(ToneSequence::new(
            tones,
            Tala {
                pattern: self.rhythm.pattern,
                gaps: self.rhythm.gaps.clone(),
            },
        ))
    }
}

/// Tone sequence → exact ratios, oscillators, rhythm and harmonics.
pub struct EquationConverter;

impl EquationConverter {
    pub fn convert(seq: &ToneSequence) -> EquationSystem {
        let ratios: Vec<Ratio> = seq.tones().iter().map(Tone::ratio).collect();
        let oscillations = seq.gamakas().map(DampedSinusoid::from_amplitude).collect();
        let first = ratios.first().copied().unwrap_or(Ratio::integer(1));
        EquationSystem {
            harmonics: HarmonicSeries::from_ratio(first),
            ratios,
            oscillations,
            rhythm: PeriodicIndicator {
                pattern: seq.tala().pattern,
                gaps: seq.tala().gaps.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tone::{Register, ToneStep};

    fn sequence() -> ToneSequence {
        let tones = vec![
            Tone {
                step: ToneStep::lookup(2, 1),
                register: Register::Tara,
                gamaka: 0.03,
            },
            Tone {
                step: ToneStep::lookup(4, 2),
                register: Register::Madhya,
                gamaka: 0.55,
            },
        ];
        ToneSequence::new(
            tones,
            Tala {
                pattern: TalaPattern::Tisra,
                gaps: vec![1],
            },
        )
    }

    #[test]
    fn test_archetype_bands() {
        assert_eq!(Archetype::for_amplitude(0.0), Archetype::Sthira);
        assert_eq!(Archetype::for_amplitude(0.1), Archetype::Andolita);
        assert_eq!(Archetype::for_amplitude(0.69), Archetype::Kampita);
        assert_eq!(Archetype::for_amplitude(1.0), Archetype::Sphurita);
    }

    #[test]
    fn test_still_tone_does_not_oscillate() {
        let osc = DampedSinusoid::from_amplitude(0.03);
        assert_eq!(osc.evaluate(0.25), 0.0);
    }

    #[test]
    fn test_harmonics_from_first_ratio() {
        let eq = EquationConverter::convert(&sequence());
        // Sa placed in the Tara register is 2/1.
        assert_eq!(eq.ratios[0], Ratio::integer(2));
        assert_eq!(eq.harmonics.fundamental, Ratio::integer(880));
        assert_eq!(eq.harmonics.multiples.len(), 10);
        assert_eq!(eq.harmonics.multiples[9], Ratio::integer(8800));
    }

    #[test]
    fn test_rebuilds_tone_sequence() {
        let seq = sequence();
        let eq = EquationConverter::convert(&seq);
        assert_eq!(eq.to_tone_sequence().unwrap(), seq);
    }

    #[test]
    fn test_unknown_ratio_rejected() {
        let mut eq = EquationConverter::convert(&sequence());
        eq.ratios[1] = Ratio::new(7, 3);
        assert!(eq.to_tone_sequence().is_err());
    }

    #[test]
    fn test_periodic_indicator_cycles() {
        let ind = PeriodicIndicator {
            pattern: TalaPattern::Chatusra,
            gaps: vec![],
        };
        assert_eq!(ind.period_ms(), 400);
        assert_eq!(ind.value_at(0), 1.0);
        assert_eq!(ind.value_at(250), 0.75);
        assert_eq!(ind.value_at(400), 1.0);
        assert_eq!(ind.accents(), vec![0, 2]);
    }
}
