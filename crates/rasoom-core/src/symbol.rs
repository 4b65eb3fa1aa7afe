use serde::{Deserialize, Serialize};

use crate::affect::AffectVector;
use crate::constants::{ALPHABET, INTENSITY_CLASSES, LENGTH_BANDS};
use crate::intent::TreePath;
use crate::normalize::FeatureVector;
use crate::tier::Tier;

/// A compact phonotactic symbol derived from one tree path.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymbolicUnit {
    /// Index into `ALPHABET`.
    pub base_symbol: u8,
    /// 1..=3
    pub length_class: u8,
    /// 1..=9
    pub intensity_class: u8,
    pub tier: Tier,
    pub affect: AffectVector,
    /// Milliseconds after the event timestamp.
    pub offset_ms: u32,
}

impl SymbolicUnit {
    pub fn syllable(&self) -> &'static str {
        ALPHABET[self.base_symbol as usize % ALPHABET.len()]
    }

    /// Human-readable form, e.g. `ga:1:1@prime`.
    pub fn notation(&self) -> String {
        format!(
            "{}:{}:{}@{}",
            self.syllable(),
            self.length_class,
            self.intensity_class,
            self.tier
        )
    }

    /// Reject field values that no mapping could have produced.
    pub fn is_well_formed(&self) -> bool {
        (self.base_symbol as usize) < ALPHABET.len()
            && (1..=3).contains(&self.length_class)
            && (1..=INTENSITY_CLASSES).contains(&self.intensity_class)
    }
}

/// Exact, table-free mapping so the unit can be re-derived.
pub struct SymbolicUnitMapper;

impl SymbolicUnitMapper {
    pub fn map(path: &TreePath) -> SymbolicUnit {
        let fv = &path.features;
        SymbolicUnit {
            base_symbol: base_symbol(fv.get(FeatureVector::POINTER_X)),
            length_class: length_class(fv.get(FeatureVector::VELOCITY)),
            intensity_class: intensity_class(fv.get(FeatureVector::PRESSURE)),
            tier: path.resolution.tier(),
            affect: path.leaf.affect,
            offset_ms: path.offset_ms,
        }
    }
}

pub fn base_symbol(primary: f64) -> u8 {
    let n = ALPHABET.len();
    ((primary.max(0.0) * n as f64).floor() as usize % n) as u8
}

pub fn length_class(velocity: f64) -> u8 {
    if velocity <= LENGTH_BANDS[0] {
        1
    } else if velocity <= LENGTH_BANDS[1] {
        2
    } else {
        3
    }
}

pub fn intensity_class(pressure: f64) -> u8 {
    let raw = (pressure * f64::from(INTENSITY_CLASSES)).floor() + 1.0;
    raw.clamp(1.0, f64::from(INTENSITY_CLASSES)) as u8
}
