/// Wire format version written into every frame header.
pub const FRAME_VERSION: u8 = 1;

/// Numerical epsilon for near-zero comparisons.
pub const EPSILON: f64 = 1e-10;

/// Number of normalized features fed to tree induction.
pub const FEATURE_COUNT: usize = 5;

/// Phonotactic base syllables. Index is the `base_symbol`.
pub const ALPHABET: [&str; 12] = [
    "sa", "ri", "ga", "ma", "pa", "da", "ni", "ka", "ta", "va", "la", "ya",
];

/// Velocity banding for `length_class`: ≤0.3 → 1, ≤0.6 → 2, else 3.
pub const LENGTH_BANDS: [f64; 2] = [0.3, 0.6];

/// Discrete intensity classes (1..=9).
pub const INTENSITY_CLASSES: u8 = 9;

/// Velocity (normalized units per second) that maps to velocity = 1.0.
pub const VELOCITY_SCALE: f64 = 4.0;

/// Ambiguity at or above which an event requests escalation.
pub const ESCALATION_THRESHOLD: f64 = 0.7;

/// Cap on symbolic units produced per resolution (frames are decimated).
pub const MAX_UNITS_PER_RESOLUTION: usize = 8;

/// Affect components, in vector order.
pub const AFFECT_COMPONENTS: [&str; 5] = ["calm", "urgency", "tension", "doubt", "focus"];

/// Per-emotion gamaka weights (same order as `AFFECT_COMPONENTS`). Sum ≤ 1.
pub const GAMAKA_WEIGHTS: [f64; 5] = [0.0, 0.35, 0.35, 0.20, 0.05];

/// Ramp onset for urgency / tension / doubt.
pub const AFFECT_ONSET: f64 = 0.3;

/// Just-intonation ratio for each of the 12 tonal steps, as (numerator, denominator).
pub const STEP_RATIOS: [(u64, u64); 12] = [
    (1, 1),
    (16, 15),
    (9, 8),
    (6, 5),
    (5, 4),
    (4, 3),
    (45, 32),
    (3, 2),
    (8, 5),
    (5, 3),
    (9, 5),
    (15, 8),
];

/// Tone step lookup keyed by `[base_symbol][length_class - 1]`.
///
/// Rows walk the circle of fifths starting from base symbol 2 on step 0;
/// each length class adds a major third.
pub const TONE_TABLE: [[u8; 3]; 12] = [
    [10, 2, 6],
    [5, 9, 1],
    [0, 4, 8],
    [7, 11, 3],
    [2, 6, 10],
    [9, 1, 5],
    [4, 8, 0],
    [11, 3, 7],
    [6, 10, 2],
    [1, 5, 9],
    [8, 0, 4],
    [3, 7, 11],
];

/// Register banding: placed ratio ≤ this → Micro.
pub const MICRO_REGISTER_CEILING: f64 = 1.5;

/// Register banding: placed ratio ≤ this (and above Micro) → Domain.
pub const DOMAIN_REGISTER_CEILING: f64 = 1.8;

/// Fundamental frequency (arbitrary units) for the harmonic series.
pub const FUNDAMENTAL: u64 = 440;

/// Number of harmonics generated from the first tone.
pub const HARMONIC_COUNT: u64 = 10;

/// Inter-unit gap quantum for rhythmic cycles (milliseconds per beat).
pub const BEAT_MS: u32 = 100;

/// Maximum quantized gap (beats).
pub const MAX_GAP_BEATS: u8 = 15;

/// Beat weight at or above which a beat is accented in the periodic indicator.
pub const ACCENT_WEIGHT: f64 = 0.75;

/// Prime table used for trial-division factorization and Gödel codes.
pub const PRIMES: [u64; 16] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53];

/// Continued-fraction depth cap.
pub const CF_MAX_DEPTH: usize = 10;

/// Remainder below which continued-fraction expansion terminates.
pub const CF_EPSILON: f64 = 1e-9;

/// Reed–Solomon: symbols per codeword (GF(2^8)).
pub const RS_BLOCK_SYMBOLS: usize = 255;

/// Reed–Solomon: default parity symbols per block (corrects 16 symbol errors).
pub const RS_DEFAULT_PARITY: usize = 32;

/// Default routing priority (1..=10).
pub const DEFAULT_PRIORITY: u8 = 5;

/// Priority at or above which emergency bypass is allowed.
pub const BYPASS_PRIORITY: u8 = 9;
