//! Systematic Reed–Solomon over GF(2^8).
//!
//! Field polynomial 0x11d, generator α = 2, first consecutive root α^0.
//! Data is cut into blocks of `255 − parity` bytes (the last block is
//! shortened); parity for every block is appended after all data, so the
//! protected payload is `data || parity_0 || parity_1 || …`.
//!
//! Decoding: syndromes → Berlekamp–Massey → Chien search → Forney. A block is
//! only accepted when its syndromes are all zero after correction.

use serde::{Deserialize, Serialize};

use crate::constants::{RS_BLOCK_SYMBOLS, RS_DEFAULT_PARITY};
use crate::error::CodecError;

const FIELD_POLY: u16 = 0x11d;

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

const fn build_tables() -> Tables {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= FIELD_POLY;
        }
        i += 1;
    }
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    Tables { exp, log }
}

static GF: Tables = build_tables();

fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    GF.exp[GF.log[a as usize] as usize + GF.log[b as usize] as usize]
}

/// `a / b`; callers guarantee `b != 0`.
fn div(a: u8, b: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    GF.exp[(GF.log[a as usize] as usize + 255 - GF.log[b as usize] as usize) % 255]
}

fn alpha_pow(e: usize) -> u8 {
    GF.exp[e % 255]
}

/// Evaluate a low-degree-first polynomial at `x`.
fn eval_low(poly: &[u8], x: u8) -> u8 {
    poly.iter().rev().fold(0, |acc, &c| mul(acc, x) ^ c)
}

/// ECC parameters. Only 8-bit symbols are supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EccConfig {
    pub symbol_bits: u8,
    pub parity_symbols: usize,
}

impl Default for EccConfig {
    fn default() -> Self {
        Self {
            symbol_bits: 8,
            parity_symbols: RS_DEFAULT_PARITY,
        }
    }
}

impl EccConfig {
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.symbol_bits != 8 {
            return Err(CodecError::EccParameters(format!(
                "symbol size {} bits (only 8 is supported)",
                self.symbol_bits
            )));
        }
        if self.parity_symbols < 2
            || self.parity_symbols % 2 != 0
            || self.parity_symbols >= RS_BLOCK_SYMBOLS - 1
        {
            return Err(CodecError::EccParameters(format!(
                "parity count {} (must be even, 2..=252)",
                self.parity_symbols
            )));
        }
        Ok(())
    }

    /// Symbol errors correctable per block.
    pub fn capacity(&self) -> usize {
        self.parity_symbols / 2
    }
}

/// Data recovered from a protected payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub data: Vec<u8>,
    pub corrected: usize,
}

/// Correction failed in `block`; `data` is the uncorrected input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EccFailure {
    pub block: usize,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReedSolomon {
    parity: usize,
    /// High-degree-first, monic.
    generator: Vec<u8>,
}

impl ReedSolomon {
    pub fn new(config: &EccConfig) -> Result<Self, CodecError> {
        config.validate()?;
        let parity = config.parity_symbols;
        let mut generator = vec![1u8];
        for i in 0..parity {
            // g(x) ← g(x)·(x + α^i)
            let root = alpha_pow(i);
            let mut next = vec![0u8; generator.len() + 1];
            for (j, &c) in generator.iter().enumerate() {
                next[j] ^= c;
                next[j + 1] ^= mul(c, root);
            }
            generator = next;
        }
        Ok(Self { parity, generator })
    }

    pub fn parity(&self) -> usize {
        self.parity
    }

    pub fn data_per_block(&self) -> usize {
        RS_BLOCK_SYMBOLS - self.parity
    }

    /// Number of blocks needed for `data_len` bytes.
    pub fn block_count(&self, data_len: usize) -> usize {
        data_len.div_ceil(self.data_per_block()).max(1)
    }

    pub fn protected_len(&self, data_len: usize) -> usize {
        data_len + self.parity * self.block_count(data_len)
    }

    /// Inverse of `protected_len`.
    pub fn data_len(&self, protected_len: usize) -> Option<usize> {
        let blocks = protected_len.div_ceil(RS_BLOCK_SYMBOLS).max(1);
        protected_len
            .checked_sub(self.parity * blocks)
            .filter(|&d| self.protected_len(d) == protected_len)
    }

    /// Parity symbols for one block of at most `data_per_block` bytes.
    pub fn encode_block(&self, data: &[u8]) -> Vec<u8> {
        let mut work = vec![0u8; data.len() + self.parity];
        work[..data.len()].copy_from_slice(data);
        for i in 0..data.len() {
            let coef = work[i];
            if coef != 0 {
                for (j, &g) in self.generator.iter().enumerate().skip(1) {
                    work[i + j] ^= mul(g, coef);
                }
            }
        }
        work.split_off(data.len())
    }

    /// `data || parity` for all blocks.
    pub fn protect(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.protected_len(data.len()));
        out.extend_from_slice(data);
        if data.is_empty() {
            out.extend(self.encode_block(&[]));
        }
        for chunk in data.chunks(self.data_per_block()) {
            out.extend(self.encode_block(chunk));
        }
        out
    }

    /// Correct and strip parity.
    pub fn recover(&self, payload: &[u8]) -> Result<Recovered, EccFailure> {
        let Some(data_len) = self.data_len(payload.len()) else {
            return Err(EccFailure {
                block: 0,
                data: payload.to_vec(),
            });
        };
        let (data, parity) = payload.split_at(data_len);
        let k = self.data_per_block();
        let mut out = Vec::with_capacity(data_len);
        let mut corrected = 0;

        let blocks = self.block_count(data_len);
        for block in 0..blocks {
            let start = block * k;
            let end = (start + k).min(data_len);
            let mut codeword = Vec::with_capacity(end - start + self.parity);
            codeword.extend_from_slice(&data[start..end]);
            codeword.extend_from_slice(&parity[block * self.parity..(block + 1) * self.parity]);
            match self.correct(&mut codeword) {
                Some(n) => corrected += n,
                None => {
                    return Err(EccFailure {
                        block,
                        data: data.to_vec(),
                    });
                }
            }
            out.extend_from_slice(&codeword[..end - start]);
        }
        Ok(Recovered {
            data: out,
            corrected,
        })
    }

    /// Syndromes `S_j = c(α^j)`, `j = 0..parity`.
    fn syndromes(&self, codeword: &[u8]) -> Vec<u8> {
        (0..self.parity)
            .map(|j| {
                let x = alpha_pow(j);
                codeword.iter().fold(0, |acc, &c| mul(acc, x) ^ c)
            })
            .collect()
    }

    /// Correct one (possibly shortened) codeword in place. Returns the
    /// number of corrected symbols, or `None` past capacity.
    pub fn correct(&self, codeword: &mut [u8]) -> Option<usize> {
        let synd = self.syndromes(codeword);
        if synd.iter().all(|&s| s == 0) {
            return Some(0);
        }

        let (locator, errors) = berlekamp_massey(&synd);
        if errors > self.parity / 2 || locator.len() != errors + 1 {
            return None;
        }

        // Chien search over the positions that exist in this codeword.
        let n = codeword.len();
        let positions: Vec<usize> = (0..n)
            .filter(|&i| {
                let e = n - 1 - i;
                eval_low(&locator, alpha_pow(255 - e % 255)) == 0
            })
            .collect();
        if positions.len() != errors {
            return None;
        }

        // Forney: Y = X·Ω(X⁻¹) / Λ'(X⁻¹), Ω = S·Λ mod x^parity.
        let mut omega = vec![0u8; self.parity];
        for (i, &s) in synd.iter().enumerate() {
            for (j, &l) in locator.iter().enumerate() {
                if i + j < self.parity {
                    omega[i + j] ^= mul(s, l);
                }
            }
        }
        let derivative: Vec<u8> = locator
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, &c)| if i % 2 == 1 { c } else { 0 })
            .collect();

        for &i in &positions {
            let e = n - 1 - i;
            let x = alpha_pow(e);
            let x_inv = alpha_pow(255 - e % 255);
            let denom = eval_low(&derivative, x_inv);
            if denom == 0 {
                return None;
            }
            let magnitude = mul(x, div(eval_low(&omega, x_inv), denom));
            codeword[i] ^= magnitude;
        }

        if self.syndromes(codeword).iter().any(|&s| s != 0) {
            return None;
        }
        Some(errors)
    }
}

/// Error-locator polynomial (low-degree-first, trimmed) and its degree.
fn berlekamp_massey(synd: &[u8]) -> (Vec<u8>, usize) {
    let mut locator = vec![1u8];
    let mut prev = vec![1u8];
    let mut l = 0usize;
    let mut shift = 1usize;
    let mut prev_disc = 1u8;

    for n in 0..synd.len() {
        let mut d = synd[n];
        for i in 1..=l.min(locator.len() - 1) {
            d ^= mul(locator[i], synd[n - i]);
        }
        if d == 0 {
            shift += 1;
            continue;
        }
        let coef = div(d, prev_disc);
        let snapshot = locator.clone();
        if locator.len() < prev.len() + shift {
            locator.resize(prev.len() + shift, 0);
        }
        for (i, &p) in prev.iter().enumerate() {
            locator[i + shift] ^= mul(coef, p);
        }
        if 2 * l <= n {
            l = n + 1 - l;
            prev = snapshot;
            prev_disc = d;
            shift = 1;
        } else {
            shift += 1;
        }
    }

    while locator.len() > 1 && locator.last() == Some(&0) {
        locator.pop();
    }
    (locator, l)
}
