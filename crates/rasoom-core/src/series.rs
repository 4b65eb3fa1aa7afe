//! SeriesEncoder: equation system → number series plus routing metadata.
//!
//! Everything here is exact or bounded: ratios become prime factorizations,
//! oscillation and beat values become continued fractions, and each
//! resolution group of symbolic units gets an injective prime-power code.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::constants::{CF_EPSILON, CF_MAX_DEPTH, PRIMES};
use crate::equation::EquationSystem;
use crate::error::CodecError;
use crate::ratio::Ratio;
use crate::symbol::SymbolicUnit;
use crate::tier::{Resolution, Tier};

/// Where a message goes. The only authoritative source of its tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    pub tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    /// 1..=10
    pub priority: u8,
    pub timestamp_ms: u64,
    /// Set when input ambiguity crossed the escalation threshold.
    #[serde(default)]
    pub escalate: bool,
}

/// `base = ∏ p^e`; negative exponents come from the denominator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Factorization {
    pub base: Ratio,
    pub factors: Vec<(u64, i32)>,
}

impl Factorization {
    pub fn of(base: Ratio) -> Self {
        let (num_factors, num_rest) = trial_divide(base.num);
        let (den_factors, den_rest) = trial_divide(base.den);
        let mut factors: Vec<(u64, i32)> = PRIMES
            .iter()
            .zip(num_factors.iter().zip(den_factors.iter()))
            .filter_map(|(&p, (&n, &d))| {
                let e = n as i32 - d as i32;
                (e != 0).then_some((p, e))
            })
            .collect();
        if num_rest > 1 {
            factors.push((num_rest, 1));
        }
        if den_rest > 1 {
            factors.push((den_rest, -1));
        }
        Self { base, factors }
    }

    /// Multiply the factors back out.
    pub fn product(&self) -> Ratio {
        let (mut num, mut den) = (1u64, 1u64);
        for &(p, e) in &self.factors {
            let pow = p.pow(e.unsigned_abs());
            if e > 0 {
                num *= pow;
            } else {
                den *= pow;
            }
        }
        Ratio::new(num, den)
    }
}

/// Exponent of each table prime in `n`, plus the cofactor left over.
fn trial_divide(mut n: u64) -> ([u32; PRIMES.len()], u64) {
    let mut exps = [0u32; PRIMES.len()];
    if n == 0 {
        return (exps, 0);
    }
    for (i, &p) in PRIMES.iter().enumerate() {
        while n % p == 0 {
            n /= p;
            exps[i] += 1;
        }
    }
    (exps, n)
}

/// Continued-fraction expansion, at most `CF_MAX_DEPTH` terms.
pub fn continued_fraction(x: f64) -> Vec<i64> {
    let mut terms = Vec::with_capacity(CF_MAX_DEPTH);
    let mut v = x;
    for _ in 0..CF_MAX_DEPTH {
        if !v.is_finite() {
            break;
        }
        let a = v.floor();
        terms.push(a as i64);
        let frac = v - a;
        if frac.abs() < CF_EPSILON {
            break;
        }
        v = 1.0 / frac;
    }
    terms
}

/// Value of a continued fraction `[a0; a1, a2, …]`.
pub fn convergent(terms: &[i64]) -> f64 {
    let Some((&last, rest)) = terms.split_last() else {
        return 0.0;
    };
    rest.iter()
        .rev()
        .fold(last as f64, |acc, &a| a as f64 + 1.0 / acc)
}

/// Prime-power code for one resolution group of symbolic units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GodelCode {
    pub resolution: Resolution,
    pub code: BigUint,
}

impl GodelCode {
    pub fn exponent(unit: &SymbolicUnit) -> u32 {
        1 + u32::from(unit.base_symbol) + 12 * u32::from(unit.length_class.saturating_sub(1))
    }

    /// Longest group the prime table can encode.
    pub const MAX_UNITS: usize = PRIMES.len();

    /// `∏ p_i^{e_i}` over the units in order. `None` when the group has more
    /// than `MAX_UNITS` units.
    pub fn encode<'a>(units: impl IntoIterator<Item = &'a SymbolicUnit>) -> Option<BigUint> {
        let mut code = BigUint::from(1u32);
        let mut primes = PRIMES.iter();
        for unit in units {
            let &p = primes.next()?;
            code *= BigUint::from(p).pow(Self::exponent(unit));
        }
        Some(code)
    }

    /// Inverse of `encode`: `(base_symbol, length_class)` per position.
    pub fn decode(code: &BigUint) -> Vec<(u8, u8)> {
        let zero = BigUint::from(0u32);
        let mut rest = code.clone();
        let mut out = Vec::new();
        for &p in PRIMES.iter() {
            let prime = BigUint::from(p);
            let mut e = 0u32;
            while rest > zero && &rest % &prime == zero {
                rest /= &prime;
                e += 1;
            }
            if e == 0 {
                break;
            }
            let e = e - 1;
            out.push(((e % 12) as u8, (e / 12 + 1) as u8));
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NumberSeries {
    pub factorizations: Vec<Factorization>,
    /// Oscillation amplitudes first, then beat weights.
    pub continued_fractions: Vec<Vec<i64>>,
    pub godel_codes: Vec<GodelCode>,
    pub metadata: RoutingMetadata,
}

impl NumberSeries {
    /// Recompute the Gödel codes from `units` and compare.
    pub fn codes_match(&self, units: &[SymbolicUnit]) -> bool {
        godel_groups(units).is_ok_and(|codes| codes == self.godel_codes)
    }
}

fn godel_groups(units: &[SymbolicUnit]) -> Result<Vec<GodelCode>, CodecError> {
    Resolution::ALL
        .iter()
        .map(|&resolution| {
            let group = || units.iter().filter(|u| u.tier == resolution.tier());
            let code = GodelCode::encode(group()).ok_or_else(|| CodecError::TooLong {
                field: "godel group",
                len: group().count(),
            })?;
            Ok(GodelCode { resolution, code })
        })
        .collect()
}

pub struct SeriesEncoder;

impl SeriesEncoder {
    pub fn encode(
        equation: &EquationSystem,
        units: &[SymbolicUnit],
        metadata: RoutingMetadata,
    ) -> Result<NumberSeries, CodecError> {
        let factorizations = equation.ratios.iter().copied().map(Factorization::of).collect();
        let continued_fractions = equation
            .oscillations
            .iter()
            .map(|o| o.amplitude)
            .chain(equation.rhythm.weights().iter().copied())
            .map(continued_fraction)
            .collect();
        Ok(NumberSeries {
            factorizations,
            continued_fractions,
            godel_codes: godel_groups(units)?,
            metadata,
        })
    }
}
