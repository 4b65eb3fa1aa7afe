//! IntentTreeBuilder: ID3-style induction of three decision trees per event.
//!
//! The training set is a fixed prototype grid over the feature space plus the
//! event's own frames, each labeled by a fixed oracle. Splits maximize
//! information gain; ties go to the lowest feature index, then the lowest
//! threshold, so induction is fully deterministic. The event's feature vector
//! is then walked down each tree to yield a leaf.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::affect::AffectVector;
use crate::constants::{FEATURE_COUNT, LENGTH_BANDS};
use crate::normalize::{FeatureVector, MultimodalEvent};
use crate::tier::Resolution;

/// Frames beyond this are decimated before joining the training set.
const MAX_TRAINING_FRAMES: usize = 64;

/// Gains closer than this are treated as tied.
const GAIN_EPSILON: f64 = 1e-12;

const PROTOTYPE_POSITIONS: [f64; 4] = [0.1, 0.35, 0.65, 0.9];
const PROTOTYPE_VELOCITIES: [f64; 3] = [0.1, 0.45, 0.8];
const PROTOTYPE_PRESSURES: [f64; 4] = [0.1, 0.4, 0.7, 0.95];
const PROTOTYPE_CONTEXTS: [f64; 2] = [0.1, 0.85];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Quadrant {
    NorthWest,
    NorthEast,
    SouthWest,
    SouthEast,
}

impl Quadrant {
    pub fn of(x: f64, y: f64) -> Self {
        match (x < 0.5, y < 0.5) {
            (true, true) => Quadrant::NorthWest,
            (false, true) => Quadrant::NorthEast,
            (true, false) => Quadrant::SouthWest,
            (false, false) => Quadrant::SouthEast,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Quadrant::NorthWest => "nw",
            Quadrant::NorthEast => "ne",
            Quadrant::SouthWest => "sw",
            Quadrant::SouthEast => "se",
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        [
            Quadrant::NorthWest,
            Quadrant::NorthEast,
            Quadrant::SouthWest,
            Quadrant::SouthEast,
        ]
        .get(v as usize)
        .copied()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tempo {
    Still,
    Moving,
    Rapid,
}

impl Tempo {
    pub fn of(velocity: f64) -> Self {
        if velocity <= LENGTH_BANDS[0] {
            Tempo::Still
        } else if velocity <= LENGTH_BANDS[1] {
            Tempo::Moving
        } else {
            Tempo::Rapid
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        [Tempo::Still, Tempo::Moving, Tempo::Rapid].get(v as usize).copied()
    }
}

/// Where and how the intent was expressed, plus the branch taken to reach it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFrame {
    pub quadrant: Quadrant,
    pub tempo: Tempo,
    pub depth: u8,
    /// Bit i set when the walk went right at depth i.
    pub branch_bits: u32,
}

/// What a tree walk yields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentLeaf {
    pub label: String,
    pub context: ContextFrame,
    pub affect: AffectVector,
    pub confidence: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathStep {
    pub feature: u8,
    pub threshold: f64,
    pub went_right: bool,
}

/// Root-to-leaf walk for one feature vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreePath {
    pub resolution: Resolution,
    pub steps: Vec<PathStep>,
    pub features: FeatureVector,
    pub offset_ms: u32,
    pub leaf: IntentLeaf,
}

#[derive(Clone, Debug)]
struct LeafStats {
    label: String,
    confidence: f64,
    centroid: FeatureVector,
}

#[derive(Clone, Debug)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        /// Fraction of training samples routed through this node.
        weight: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf(LeafStats),
}

/// A weighted binary decision tree keyed by `(feature, threshold)`.
#[derive(Clone, Debug)]
pub struct IntentTree {
    resolution: Resolution,
    root: Node,
}

impl IntentTree {
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn depth(&self) -> usize {
        fn walk(node: &Node) -> usize {
            match node {
                Node::Leaf(_) => 0,
                Node::Split { left, right, .. } => 1 + walk(left).max(walk(right)),
            }
        }
        walk(&self.root)
    }

    pub fn node_count(&self) -> usize {
        fn walk(node: &Node) -> usize {
            match node {
                Node::Leaf(_) => 1,
                Node::Split { left, right, .. } => 1 + walk(left) + walk(right),
            }
        }
        walk(&self.root)
    }

    /// Feature index and threshold at the root, if the tree split at all.
    pub fn root_split(&self) -> Option<(usize, f64)> {
        match &self.root {
            Node::Split { feature, threshold, .. } => Some((*feature, *threshold)),
            Node::Leaf(_) => None,
        }
    }

    /// Walk `features` from root to leaf.
    pub fn path(&self, features: &FeatureVector, offset_ms: u32) -> TreePath {
        let mut steps = Vec::new();
        let mut node = &self.root;
        let mut branch_bits = 0u32;
        loop {
            match node {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    let went_right = features.get(*feature) > *threshold;
                    if went_right {
                        branch_bits |= 1 << steps.len();
                    }
                    steps.push(PathStep {
                        feature: *feature as u8,
                        threshold: *threshold,
                        went_right,
                    });
                    node = if went_right { right } else { left };
                }
                Node::Leaf(stats) => {
                    let context = ContextFrame {
                        quadrant: Quadrant::of(
                            features.get(FeatureVector::POINTER_X),
                            features.get(FeatureVector::POINTER_Y),
                        ),
                        tempo: Tempo::of(features.get(FeatureVector::VELOCITY)),
                        depth: steps.len() as u8,
                        branch_bits,
                    };
                    let leaf = IntentLeaf {
                        label: stats.label.clone(),
                        context,
                        affect: AffectVector::from_features(&stats.centroid.midpoint(features)),
                        confidence: stats.confidence,
                    };
                    return TreePath {
                        resolution: self.resolution,
                        steps,
                        features: *features,
                        offset_ms,
                        leaf,
                    };
                }
            }
        }
    }

    pub fn classify(&self, features: &FeatureVector) -> IntentLeaf {
        self.path(features, 0).leaf
    }

    /// Weight of the root split (1.0 when the tree is non-trivial).
    pub fn root_weight(&self) -> f64 {
        match &self.root {
            Node::Split { weight, .. } => *weight,
            Node::Leaf(_) => 1.0,
        }
    }
}

struct Sample {
    features: FeatureVector,
    label: usize,
}

/// Deterministic given identical input.
pub struct IntentTreeBuilder;

impl IntentTreeBuilder {
    /// Build strategic, specialized and atomic trees, in that order.
    pub fn build(event: &MultimodalEvent) -> [IntentTree; 3] {
        Resolution::ALL.map(|r| Self::build_resolution(event, r))
    }

    pub fn build_resolution(event: &MultimodalEvent, resolution: Resolution) -> IntentTree {
        let mut vectors = prototype_grid();
        let frames = event.frames();
        let stride = frames.len().div_ceil(MAX_TRAINING_FRAMES).max(1);
        vectors.extend(frames.iter().step_by(stride).map(|f| event.frame_vector(f)));

        // Label ids are assigned in sorted label order so ids never depend on
        // sample order.
        let labels: Vec<String> = vectors.iter().map(|v| Self::label_for(resolution, v)).collect();
        let mut ids: BTreeMap<&str, usize> = BTreeMap::new();
        for label in &labels {
            ids.entry(label.as_str()).or_insert(0);
        }
        for (i, v) in ids.values_mut().enumerate() {
            *v = i;
        }
        let names: Vec<String> = ids.keys().map(|s| s.to_string()).collect();
        let samples: Vec<Sample> = vectors
            .iter()
            .zip(labels.iter())
            .map(|(v, l)| Sample {
                features: *v,
                label: ids[l.as_str()],
            })
            .collect();

        let ctx = Induction {
            samples: &samples,
            names: &names,
            max_depth: resolution.max_depth(),
        };
        let all: Vec<usize> = (0..samples.len()).collect();
        IntentTree {
            resolution,
            root: ctx.grow(&all, 0),
        }
    }

    /// The fixed labeling oracle.
    pub fn label_for(resolution: Resolution, fv: &FeatureVector) -> String {
        let strategic = strategic_label(fv);
        if resolution == Resolution::Strategic {
            return strategic.to_string();
        }
        let quadrant = Quadrant::of(
            fv.get(FeatureVector::POINTER_X),
            fv.get(FeatureVector::POINTER_Y),
        );
        let specialized = format!("{strategic}.{}", quadrant.code());
        if resolution == Resolution::Specialized {
            return specialized;
        }
        let pressure = fv.get(FeatureVector::PRESSURE);
        let band = if pressure < 1.0 / 3.0 {
            "soft"
        } else if pressure < 2.0 / 3.0 {
            "firm"
        } else {
            "hard"
        };
        format!("{specialized}.{band}")
    }
}

fn strategic_label(fv: &FeatureVector) -> &'static str {
    let context = fv.get(FeatureVector::CONTEXT);
    let velocity = fv.get(FeatureVector::VELOCITY);
    let pressure = fv.get(FeatureVector::PRESSURE);
    if context > 0.7 {
        "clarify"
    } else if velocity <= 0.3 && pressure <= 0.5 {
        "confirm"
    } else if pressure > 0.5 {
        "commit"
    } else {
        "explore"
    }
}

fn prototype_grid() -> Vec<FeatureVector> {
    let mut grid = Vec::with_capacity(
        PROTOTYPE_POSITIONS.len().pow(2)
            * PROTOTYPE_VELOCITIES.len()
            * PROTOTYPE_PRESSURES.len()
            * PROTOTYPE_CONTEXTS.len(),
    );
    for &x in &PROTOTYPE_POSITIONS {
        for &y in &PROTOTYPE_POSITIONS {
            for &v in &PROTOTYPE_VELOCITIES {
                for &p in &PROTOTYPE_PRESSURES {
                    for &c in &PROTOTYPE_CONTEXTS {
                        grid.push(FeatureVector([x, y, v, p, c]));
                    }
                }
            }
        }
    }
    grid
}

struct Induction<'a> {
    samples: &'a [Sample],
    names: &'a [String],
    max_depth: usize,
}

impl Induction<'_> {
    fn grow(&self, idx: &[usize], depth: usize) -> Node {
        let counts = self.counts(idx);
        let distinct = counts.iter().filter(|&&c| c > 0).count();
        if depth >= self.max_depth || distinct <= 1 || idx.len() < 2 {
            return self.leaf(idx, &counts);
        }

        let parent_entropy = entropy(&counts, idx.len());
        let mut best: Option<(usize, f64, f64)> = None;
        for feature in 0..FEATURE_COUNT {
            if let Some((threshold, gain)) = self.best_threshold(idx, feature, parent_entropy) {
                let better = match best {
                    None => true,
                    Some((_, _, g)) => gain > g + GAIN_EPSILON,
                };
                if better {
                    best = Some((feature, threshold, gain));
                }
            }
        }

        match best {
            Some((feature, threshold, gain)) if gain > GAIN_EPSILON => {
                let (left, right): (Vec<usize>, Vec<usize>) = idx
                    .iter()
                    .partition(|&&i| self.samples[i].features.get(feature) <= threshold);
                Node::Split {
                    feature,
                    threshold,
                    weight: idx.len() as f64 / self.samples.len() as f64,
                    left: Box::new(self.grow(&left, depth + 1)),
                    right: Box::new(self.grow(&right, depth + 1)),
                }
            }
            _ => self.leaf(idx, &counts),
        }
    }

    /// Sweep sorted values once; candidate thresholds are midpoints between
    /// consecutive distinct values. Returns the lowest threshold among ties.
    fn best_threshold(&self, idx: &[usize], feature: usize, parent_entropy: f64) -> Option<(f64, f64)> {
        let mut order: Vec<usize> = idx.to_vec();
        order.sort_by(|&a, &b| {
            self.samples[a]
                .features
                .get(feature)
                .total_cmp(&self.samples[b].features.get(feature))
        });

        let n = order.len();
        let mut left = vec![0usize; self.names.len()];
        let mut right = self.counts(idx);
        let mut best: Option<(f64, f64)> = None;

        for k in 0..n - 1 {
            let label = self.samples[order[k]].label;
            left[label] += 1;
            right[label] -= 1;
            let v = self.samples[order[k]].features.get(feature);
            let next = self.samples[order[k + 1]].features.get(feature);
            if next - v <= f64::EPSILON {
                continue;
            }
            let nl = k + 1;
            let nr = n - nl;
            let child = (nl as f64 * entropy(&left, nl) + nr as f64 * entropy(&right, nr)) / n as f64;
            let gain = parent_entropy - child;
            let better = match best {
                None => true,
                Some((_, g)) => gain > g + GAIN_EPSILON,
            };
            if better {
                best = Some(((v + next) / 2.0, gain));
            }
        }
        best
    }

    fn counts(&self, idx: &[usize]) -> Vec<usize> {
        let mut counts = vec![0usize; self.names.len()];
        for &i in idx {
            counts[self.samples[i].label] += 1;
        }
        counts
    }

    fn leaf(&self, idx: &[usize], counts: &[usize]) -> Node {
        // Majority label; the lowest label id wins ties.
        let (label, _) = counts
            .iter()
            .enumerate()
            .fold((0, 0), |best, (i, &c)| if c > best.1 { (i, c) } else { best });

        let classes = self.names.len();
        let confidence = if classes <= 1 || idx.is_empty() {
            1.0
        } else {
            1.0 - entropy(counts, idx.len()) / (classes as f64).log2()
        };

        let mut centroid = [0.0; FEATURE_COUNT];
        for &i in idx {
            for (c, v) in centroid.iter_mut().zip(self.samples[i].features.0.iter()) {
                *c += v;
            }
        }
        let n = idx.len().max(1) as f64;
        for c in centroid.iter_mut() {
            *c /= n;
        }

        Node::Leaf(LeafStats {
            label: self.names[label].clone(),
            confidence: confidence.clamp(0.0, 1.0),
            centroid: FeatureVector(centroid),
        })
    }
}

/// Shannon entropy (bits) of a label histogram.
fn entropy(counts: &[usize], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let t = total as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / t;
            -p * p.log2()
        })
        .sum()
}
