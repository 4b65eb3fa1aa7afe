use serde::{Deserialize, Serialize};

use crate::constants::{AFFECT_COMPONENTS, AFFECT_ONSET, GAMAKA_WEIGHTS};
use crate::normalize::FeatureVector;

/// Five-component affect vector: `[calm, urgency, tension, doubt, focus]`,
/// each in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AffectVector(pub [f64; 5]);

impl AffectVector {
    pub const CALM: usize = 0;
    pub const URGENCY: usize = 1;
    pub const TENSION: usize = 2;
    pub const DOUBT: usize = 3;
    pub const FOCUS: usize = 4;

    /// Fully calm, no arousal components.
    pub fn neutral() -> Self {
        Self([1.0, 0.0, 0.0, 0.0, 0.0])
    }

    /// Derive affect from a feature vector.
    ///
    /// Urgency, tension and doubt ramp up once velocity, pressure and context
    /// pass `AFFECT_ONSET`; calm is whatever the strongest of those leaves;
    /// focus rewards central, unambiguous input.
    pub fn from_features(fv: &FeatureVector) -> Self {
        let urgency = ramp(fv.get(FeatureVector::VELOCITY));
        let tension = ramp(fv.get(FeatureVector::PRESSURE));
        let doubt = ramp(fv.get(FeatureVector::CONTEXT));
        let calm = 1.0 - urgency.max(tension).max(doubt);
        let off_center = (fv.get(FeatureVector::POINTER_X) - 0.5).abs()
            + (fv.get(FeatureVector::POINTER_Y) - 0.5).abs();
        let focus = ((1.0 - fv.get(FeatureVector::CONTEXT)) * (1.0 - off_center)).clamp(0.0, 1.0);
        Self([calm, urgency, tension, doubt, focus])
    }

    /// Weighted sum against the gamaka weight table, clamped to [0, 1].
    pub fn gamaka_amplitude(&self) -> f64 {
        self.0
            .iter()
            .zip(GAMAKA_WEIGHTS.iter())
            .map(|(a, w)| a * w)
            .sum::<f64>()
            .clamp(0.0, 1.0)
    }

    /// Name of the strongest component.
    pub fn dominant(&self) -> &'static str {
        let (idx, _) = self
            .0
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        AFFECT_COMPONENTS[idx]
    }
}

fn ramp(x: f64) -> f64 {
    ((x - AFFECT_ONSET) / (1.0 - AFFECT_ONSET)).clamp(0.0, 1.0)
}
