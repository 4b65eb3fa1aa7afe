//! Byte layouts of the five payload sections.
//!
//! All integers are big-endian; every `f64` is stored as its exact IEEE-754
//! bits so decoded values match encoded ones bit for bit. Strings are
//! `u16` length + UTF-8. Writers refuse lengths and counts that overflow
//! their prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_bigint::BigUint;

use crate::affect::AffectVector;
use crate::equation::{Archetype, DampedSinusoid, EquationSystem, HarmonicSeries, PeriodicIndicator};
use crate::error::CodecError;
use crate::frame::{count, need};
use crate::intent::{ContextFrame, IntentLeaf, PathStep, Quadrant, Tempo, TreePath};
use crate::normalize::FeatureVector;
use crate::ratio::Ratio;
use crate::series::{Factorization, GodelCode, NumberSeries, RoutingMetadata};
use crate::symbol::SymbolicUnit;
use crate::tier::{Resolution, Tier};
use crate::tone::TalaPattern;

/// Everything the tree section carries.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct TreeSection {
    pub ambiguity: f64,
    pub text: Option<String>,
    /// Leaf affect is filled in from the affect section.
    pub paths: Vec<TreePath>,
}

struct Reader {
    buf: Bytes,
    section: &'static str,
}

impl Reader {
    fn new(buf: Bytes, section: &'static str) -> Self {
        Self { buf, section }
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        need(&self.buf, 1, self.section)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        need(&self.buf, 2, self.section)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        need(&self.buf, 4, self.section)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        need(&self.buf, 8, self.section)?;
        Ok(self.buf.get_u64())
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        need(&self.buf, 4, self.section)?;
        Ok(self.buf.get_i32())
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        need(&self.buf, 8, self.section)?;
        Ok(self.buf.get_i64())
    }

    fn f64(&mut self) -> Result<f64, CodecError> {
        need(&self.buf, 8, self.section)?;
        Ok(self.buf.get_f64())
    }

    fn bool(&mut self, field: &'static str) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(invalid(field, v)),
        }
    }

    fn raw(&mut self, len: usize) -> Result<Bytes, CodecError> {
        need(&self.buf, len, self.section)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let raw = self.raw(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
    }

    fn opt_string(&mut self, field: &'static str) -> Result<Option<String>, CodecError> {
        if self.bool(field)? {
            Ok(Some(self.string(field)?))
        } else {
            Ok(None)
        }
    }

    fn features(&mut self) -> Result<FeatureVector, CodecError> {
        let mut v = [0.0; 5];
        for slot in v.iter_mut() {
            *slot = self.f64()?;
        }
        Ok(FeatureVector(v))
    }

    fn affect(&mut self) -> Result<AffectVector, CodecError> {
        Ok(AffectVector(self.features()?.0))
    }

    fn ratio(&mut self) -> Result<Ratio, CodecError> {
        let num = self.u64()?;
        let den = self.u64()?;
        if den == 0 {
            return Err(invalid("ratio denominator", 0u64));
        }
        Ok(Ratio { num, den })
    }

    fn tier(&mut self) -> Result<Tier, CodecError> {
        let v = self.u8()?;
        Tier::from_wire(v).ok_or(invalid("tier", v))
    }

    fn resolution(&mut self) -> Result<Resolution, CodecError> {
        let v = self.u8()?;
        Resolution::from_wire(v).ok_or(invalid("resolution", v))
    }

    fn finish(self) -> Result<(), CodecError> {
        if self.buf.has_remaining() {
            return Err(CodecError::InvalidField {
                field: self.section,
                value: self.buf.remaining() as u64,
            });
        }
        Ok(())
    }
}

fn invalid(field: &'static str, value: impl Into<u64>) -> CodecError {
    CodecError::InvalidField {
        field,
        value: value.into(),
    }
}

fn put_str(buf: &mut BytesMut, s: &str, field: &'static str) -> Result<(), CodecError> {
    buf.put_u16(count(s.len(), field)?);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>, field: &'static str) -> Result<(), CodecError> {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s, field)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn put_f64s(buf: &mut BytesMut, values: &[f64]) {
    for &v in values {
        buf.put_f64(v);
    }
}

fn put_ratio(buf: &mut BytesMut, r: Ratio) {
    buf.put_u64(r.num);
    buf.put_u64(r.den);
}

// ---------------------------------------------------------------------------
// affect

pub(crate) fn write_affect(paths: &[TreePath]) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(1 + paths.len() * 40);
    buf.put_u8(count(paths.len(), "affect paths")?);
    for path in paths {
        put_f64s(&mut buf, &path.leaf.affect.0);
    }
    Ok(buf.freeze())
}

pub(crate) fn read_affect(bytes: Bytes) -> Result<Vec<AffectVector>, CodecError> {
    let mut r = Reader::new(bytes, "affect section");
    let n = r.u8()? as usize;
    let out = (0..n).map(|_| r.affect()).collect::<Result<Vec<_>, _>>()?;
    r.finish()?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// tree

pub(crate) fn write_tree(ambiguity: f64, text: Option<&str>, paths: &[TreePath]) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    buf.put_f64(ambiguity);
    put_opt_str(&mut buf, text, "utterance")?;
    buf.put_u8(count(paths.len(), "tree paths")?);
    for path in paths {
        buf.put_u8(path.resolution.to_wire());
        put_str(&mut buf, &path.leaf.label, "intent label")?;
        let ctx = &path.leaf.context;
        buf.put_u8(ctx.quadrant.to_wire());
        buf.put_u8(ctx.tempo.to_wire());
        buf.put_u8(ctx.depth);
        buf.put_u32(ctx.branch_bits);
        buf.put_f64(path.leaf.confidence);
        buf.put_u8(count(path.steps.len(), "path steps")?);
        for step in &path.steps {
            buf.put_u8(step.feature);
            buf.put_f64(step.threshold);
            buf.put_u8(u8::from(step.went_right));
        }
        put_f64s(&mut buf, &path.features.0);
        buf.put_u32(path.offset_ms);
    }
    Ok(buf.freeze())
}

pub(crate) fn read_tree(bytes: Bytes) -> Result<TreeSection, CodecError> {
    let mut r = Reader::new(bytes, "tree section");
    let ambiguity = r.f64()?;
    let text = r.opt_string("utterance")?;
    let n = r.u8()? as usize;
    let mut paths = Vec::with_capacity(n);
    for _ in 0..n {
        let resolution = r.resolution()?;
        let label = r.string("intent label")?;
        let q = r.u8()?;
        let quadrant = Quadrant::from_wire(q).ok_or(invalid("quadrant", q))?;
        let t = r.u8()?;
        let tempo = Tempo::from_wire(t).ok_or(invalid("tempo", t))?;
        let depth = r.u8()?;
        let branch_bits = r.u32()?;
        let confidence = r.f64()?;
        let step_count = r.u8()? as usize;
        if step_count != depth as usize {
            return Err(invalid("path depth", step_count as u64));
        }
        let mut steps = Vec::with_capacity(step_count);
        for _ in 0..step_count {
            let feature = r.u8()?;
            if feature as usize >= FeatureVector::NAMES.len() {
                return Err(invalid("split feature", feature));
            }
            let threshold = r.f64()?;
            let went_right = r.bool("branch")?;
            steps.push(PathStep {
                feature,
                threshold,
                went_right,
            });
        }
        let features = r.features()?;
        let offset_ms = r.u32()?;
        paths.push(TreePath {
            resolution,
            steps,
            features,
            offset_ms,
            leaf: IntentLeaf {
                label,
                context: ContextFrame {
                    quadrant,
                    tempo,
                    depth,
                    branch_bits,
                },
                affect: AffectVector::neutral(),
                confidence,
            },
        });
    }
    r.finish()?;
    Ok(TreeSection {
        ambiguity,
        text,
        paths,
    })
}

// ---------------------------------------------------------------------------
// symbolic

pub(crate) fn write_symbolic(units: &[SymbolicUnit]) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(2 + units.len() * 48);
    buf.put_u16(count(units.len(), "symbolic units")?);
    for u in units {
        buf.put_u8(u.base_symbol);
        buf.put_u8(u.length_class);
        buf.put_u8(u.intensity_class);
        buf.put_u8(u.tier.to_wire());
        buf.put_u32(u.offset_ms);
        put_f64s(&mut buf, &u.affect.0);
    }
    Ok(buf.freeze())
}

pub(crate) fn read_symbolic(bytes: Bytes) -> Result<Vec<SymbolicUnit>, CodecError> {
    let mut r = Reader::new(bytes, "symbolic section");
    let n = r.u16()? as usize;
    let mut units = Vec::with_capacity(n);
    for _ in 0..n {
        let unit = SymbolicUnit {
            base_symbol: r.u8()?,
            length_class: r.u8()?,
            intensity_class: r.u8()?,
            tier: r.tier()?,
            offset_ms: r.u32()?,
            affect: r.affect()?,
        };
        if !unit.is_well_formed() {
            return Err(invalid("symbolic unit", unit.base_symbol));
        }
        units.push(unit);
    }
    r.finish()?;
    Ok(units)
}

// ---------------------------------------------------------------------------
// equation

pub(crate) fn write_equation(eq: &EquationSystem) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    buf.put_u16(count(eq.ratios.len(), "ratios")?);
    for (ratio, osc) in eq.ratios.iter().zip(eq.oscillations.iter()) {
        put_ratio(&mut buf, *ratio);
        buf.put_u8(osc.archetype.to_wire());
        buf.put_f64(osc.amplitude);
    }
    buf.put_u8(eq.rhythm.pattern.to_wire());
    buf.put_u16(count(eq.rhythm.gaps.len(), "rhythm gaps")?);
    buf.put_slice(&eq.rhythm.gaps);
    put_ratio(&mut buf, eq.harmonics.fundamental);
    buf.put_u8(count(eq.harmonics.multiples.len(), "harmonic multiples")?);
    for &m in &eq.harmonics.multiples {
        put_ratio(&mut buf, m);
    }
    Ok(buf.freeze())
}

pub(crate) fn read_equation(bytes: Bytes) -> Result<EquationSystem, CodecError> {
    let mut r = Reader::new(bytes, "equation section");
    let n = r.u16()? as usize;
    let mut ratios = Vec::with_capacity(n);
    let mut oscillations = Vec::with_capacity(n);
    for _ in 0..n {
        ratios.push(r.ratio()?);
        let a = r.u8()?;
        let archetype = Archetype::from_wire(a).ok_or(invalid("archetype", a))?;
        let osc = DampedSinusoid::from_amplitude(r.f64()?);
        if osc.archetype != archetype {
            return Err(invalid("archetype", a));
        }
        oscillations.push(osc);
    }
    let p = r.u8()?;
    let pattern = TalaPattern::from_wire(p).ok_or(invalid("tala", p))?;
    let gap_count = r.u16()? as usize;
    let gaps = r.raw(gap_count)?.to_vec();
    let fundamental = r.ratio()?;
    let m = r.u8()? as usize;
    let multiples = (0..m).map(|_| r.ratio()).collect::<Result<Vec<_>, _>>()?;
    r.finish()?;
    Ok(EquationSystem {
        ratios,
        oscillations,
        rhythm: PeriodicIndicator { pattern, gaps },
        harmonics: HarmonicSeries {
            fundamental,
            multiples,
        },
    })
}

// ---------------------------------------------------------------------------
// series

pub(crate) fn write_series(series: &NumberSeries) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    buf.put_u16(count(series.factorizations.len(), "factorizations")?);
    for f in &series.factorizations {
        put_ratio(&mut buf, f.base);
        buf.put_u8(count(f.factors.len(), "prime factors")?);
        for &(p, e) in &f.factors {
            buf.put_u64(p);
            buf.put_i32(e);
        }
    }
    buf.put_u16(count(series.continued_fractions.len(), "continued fractions")?);
    for terms in &series.continued_fractions {
        buf.put_u8(count(terms.len(), "continued fraction terms")?);
        for &t in terms {
            buf.put_i64(t);
        }
    }
    buf.put_u8(count(series.godel_codes.len(), "godel codes")?);
    for g in &series.godel_codes {
        buf.put_u8(g.resolution.to_wire());
        let raw = g.code.to_bytes_be();
        buf.put_u16(count(raw.len(), "godel code")?);
        buf.put_slice(&raw);
    }
    let meta = &series.metadata;
    buf.put_u8(meta.tier.to_wire());
    buf.put_u8(meta.priority);
    buf.put_u64(meta.timestamp_ms);
    buf.put_u8(u8::from(meta.escalate));
    put_opt_str(&mut buf, meta.agent_id.as_deref(), "agent_id")?;
    put_opt_str(&mut buf, meta.cluster_id.as_deref(), "cluster_id")?;
    Ok(buf.freeze())
}

pub(crate) fn read_series(bytes: Bytes) -> Result<NumberSeries, CodecError> {
    let mut r = Reader::new(bytes, "series section");
    let n = r.u16()? as usize;
    let mut factorizations = Vec::with_capacity(n);
    for _ in 0..n {
        let base = r.ratio()?;
        let k = r.u8()? as usize;
        let factors = (0..k)
            .map(|_| Ok((r.u64()?, r.i32()?)))
            .collect::<Result<Vec<_>, CodecError>>()?;
        factorizations.push(Factorization { base, factors });
    }
    let n = r.u16()? as usize;
    let mut continued_fractions = Vec::with_capacity(n);
    for _ in 0..n {
        let k = r.u8()? as usize;
        continued_fractions.push((0..k).map(|_| r.i64()).collect::<Result<Vec<_>, _>>()?);
    }
    let n = r.u8()? as usize;
    let mut godel_codes = Vec::with_capacity(n);
    for _ in 0..n {
        let resolution = r.resolution()?;
        let len = r.u16()? as usize;
        let raw = r.raw(len)?;
        godel_codes.push(GodelCode {
            resolution,
            code: BigUint::from_bytes_be(&raw),
        });
    }
    let tier = r.tier()?;
    let priority = r.u8()?;
    if !(1..=10).contains(&priority) {
        return Err(invalid("metadata priority", priority));
    }
    let timestamp_ms = r.u64()?;
    let escalate = r.bool("escalate")?;
    let agent_id = r.opt_string("agent_id")?;
    let cluster_id = r.opt_string("cluster_id")?;
    r.finish()?;
    Ok(NumberSeries {
        factorizations,
        continued_fractions,
        godel_codes,
        metadata: RoutingMetadata {
            tier,
            agent_id,
            cluster_id,
            priority,
            timestamp_ms,
            escalate,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f64_bits_survive() {
        let units = vec![SymbolicUnit {
            base_symbol: 3,
            length_class: 2,
            intensity_class: 7,
            tier: Tier::Domain,
            affect: AffectVector([0.1 + 0.2, 1.0 / 3.0, 0.0, f64::MIN_POSITIVE, 1.0]),
            offset_ms: 42,
        }];
        let back = read_symbolic(write_symbolic(&units).unwrap()).unwrap();
        assert_eq!(back, units);
        assert_eq!(back[0].affect.0[0].to_bits(), (0.1f64 + 0.2).to_bits());
    }

    #[test]
    fn test_oversized_utterance_refused() {
        let text = "a".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            write_tree(0.0, Some(&text), &[]),
            Err(CodecError::TooLong { field: "utterance", .. })
        ));
        let fits = "a".repeat(u16::MAX as usize);
        let section = read_tree(write_tree(0.0, Some(&fits), &[]).unwrap()).unwrap();
        assert_eq!(section.text.as_deref(), Some(fits.as_str()));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut raw = BytesMut::from(&write_symbolic(&[]).unwrap()[..]);
        raw.put_u8(0);
        assert!(read_symbolic(raw.freeze()).is_err());
    }

    #[test]
    fn test_malformed_unit_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u16(1);
        raw.put_slice(&[12, 1, 1, 1]);
        raw.put_u32(0);
        put_f64s(&mut raw, &[0.0; 5]);
        assert!(matches!(
            read_symbolic(raw.freeze()),
            Err(CodecError::InvalidField { field: "symbolic unit", .. })
        ));
    }

    #[test]
    fn test_truncated_series() {
        let series = NumberSeries {
            factorizations: vec![Factorization::of(Ratio::new(9, 8))],
            continued_fractions: vec![vec![0, 2]],
            godel_codes: vec![],
            metadata: RoutingMetadata {
                tier: Tier::Prime,
                agent_id: Some("p1".into()),
                cluster_id: None,
                priority: 5,
                timestamp_ms: 9,
                escalate: false,
            },
        };
        let bytes = write_series(&series).unwrap();
        assert_eq!(read_series(bytes.clone()).unwrap(), series);
        let cut = bytes.slice(..bytes.len() - 1);
        assert!(matches!(read_series(cut), Err(CodecError::Truncated { .. })));
    }
}
