//! Audit-mode output parsing and projection.
//!
//! In audit mode the engine answers each input line with a breakdown of the
//! features that contributed to the score. The wire grammar, per feature:
//!
//! ```text
//! elem[*elem...]:hash_index:value:weight[@ss_grad]
//! ```
//!
//! where features are separated by horizontal tabs and each `elem` is
//! `namespace^name` (or a bare name for namespace-less features). Quadratic
//! and higher interactions carry several `*`-joined elements but share a
//! single hash/value/weight triple.
//!
//! Fields are split from the right so feature names may themselves contain
//! `:`. The original numeric spellings are retained on every contribution,
//! which makes [`AuditRecord::to_wire`] reproduce the input byte-for-byte —
//! the round-trip property the parser's tests pin down.
//!
//! For a linear model the per-line score equals the sum of `value * weight`
//! across contributions (within floating tolerance); [`AuditRecord::
//! predicted_score`] computes that sum so callers can cross-check the
//! engine's raw score line.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

use crate::errors::{AuditParseError, DriverError};

/// One feature's contribution to a score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureContribution {
    /// Feature identity exactly as the engine printed it, interactions
    /// joined by `*`.
    pub feature: String,
    /// Parsed `(namespace, name)` pairs, one per interaction element.
    /// The namespace is empty for namespace-less features.
    pub names: Vec<(String, String)>,
    /// The engine's internal hash of the feature identity.
    pub hash_index: u64,
    /// Feature value in the input line.
    pub value: f64,
    /// Model weight for this feature.
    pub weight: f64,
    /// Optional sum-of-squared-gradients diagnostic.
    pub ss_grad: Option<f64>,

    // Wire spellings, kept so re-serialization is byte-equal ("1" must not
    // come back as "1.0").
    hash_repr: String,
    value_repr: String,
    weight_repr: String,
    grad_repr: Option<String>,
}

impl FeatureContribution {
    /// `value * weight`: this feature's share of a linear score.
    #[inline]
    pub fn potential(&self) -> f64 {
        self.value * self.weight
    }

    /// Re-serializes the contribution in the engine's wire spelling.
    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(
            self.feature.len() + self.hash_repr.len() + self.value_repr.len()
                + self.weight_repr.len() + 8,
        );
        out.push_str(&self.feature);
        out.push(':');
        out.push_str(&self.hash_repr);
        out.push(':');
        out.push_str(&self.value_repr);
        out.push(':');
        out.push_str(&self.weight_repr);
        if let Some(grad) = &self.grad_repr {
            out.push('@');
            out.push_str(grad);
        }
        out
    }
}

/// Parsed form of one audit output line.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Contributions in the engine's emission order.
    pub contributions: Vec<FeatureContribution>,
}

impl AuditRecord {
    /// Parses one audit line.
    ///
    /// Errors carry the byte column of the first offending field so
    /// malformed engine output can be pinpointed.
    pub fn parse(line: &str) -> Result<Self, AuditParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut contributions = Vec::new();
        let mut base = 0usize;

        for field in line.split('\t') {
            contributions.push(parse_feature(line, field, base)?);
            base += field.len() + 1;
        }

        Ok(Self { contributions })
    }

    /// Sum of `value * weight` across contributions: the linear-model score
    /// for this line.
    pub fn predicted_score(&self) -> f64 {
        self.contributions.iter().map(|c| c.potential()).sum()
    }

    /// Re-serializes the record; byte-equal to the parsed input.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        for (i, c) in self.contributions.iter().enumerate() {
            if i > 0 {
                out.push('\t');
            }
            out.push_str(&c.to_wire());
        }
        out
    }

    /// Human-readable projection with the default `namespace^name` element
    /// split.
    pub fn summarize(&self) -> Vec<ExplainedFeature> {
        self.summarize_with(|element| match element.split_once('^') {
            Some((ns, name)) => (ns.to_string(), name.to_string()),
            None => (String::new(), element.to_string()),
        })
    }

    /// Human-readable projection with a caller-provided element translator
    /// (e.g. mapping hashed identifiers to display labels).
    ///
    /// Contributions with identical feature identity are summed, then
    /// sorted by `|value * weight|` descending. `relative_potential` is
    /// each feature's share of the total absolute potential (1.0 total
    /// unless every feature is unknown, in which case all shares are 0).
    pub fn summarize_with(
        &self,
        translate: impl Fn(&str) -> (String, String),
    ) -> Vec<ExplainedFeature> {
        let mut merged: Vec<ExplainedFeature> = Vec::new();

        for c in &self.contributions {
            if let Some(existing) = merged.iter_mut().find(|e| e.feature == c.feature) {
                existing.potential += c.potential();
                continue;
            }
            merged.push(ExplainedFeature {
                names: c.feature.split('*').map(&translate).collect(),
                feature: c.feature.clone(),
                potential: c.potential(),
                relative_potential: 0.0,
            });
        }

        let total: f64 = merged.iter().map(|e| e.potential.abs()).sum();
        if total > 0.0 {
            for e in &mut merged {
                e.relative_potential = e.potential.abs() / total;
            }
        }

        merged.sort_by(|a, b| {
            b.potential
                .abs()
                .partial_cmp(&a.potential.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        merged
    }
}

/// One row of the human-readable projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExplainedFeature {
    /// Feature identity as the engine printed it.
    pub feature: String,
    /// Translated `(namespace, name)` pairs, one per interaction element.
    pub names: Vec<(String, String)>,
    /// Summed `value * weight` across merged contributions.
    pub potential: f64,
    /// `|potential|` as a share of the total absolute potential.
    pub relative_potential: f64,
}

/// Result of one audit-mode exchange: the engine's raw score line plus the
/// parsed audit line.
#[derive(Clone, Debug, PartialEq)]
pub struct Explanation {
    /// Raw score before any link function.
    pub score: f64,
    /// Parsed per-feature breakdown.
    pub record: AuditRecord,
    /// The audit line verbatim.
    pub raw: String,
}

fn parse_feature(
    line: &str,
    field: &str,
    base: usize,
) -> Result<FeatureContribution, AuditParseError> {
    let err = |column: usize, detail: &'static str| AuditParseError {
        line: line.to_string(),
        column,
        detail,
    };

    // Split from the right: the name may contain ':' but the trailing three
    // fields never do.
    let mut parts = field.rsplitn(4, ':');
    let weight_field = parts.next().unwrap_or("");
    let value_repr = parts.next().ok_or_else(|| err(base, "expected ':'-separated fields"))?;
    let hash_repr = parts
        .next()
        .ok_or_else(|| err(base, "expected hash_index:value:weight after feature name"))?;
    let feature = parts
        .next()
        .ok_or_else(|| err(base, "expected feature name before hash_index"))?;

    if feature.is_empty() {
        return Err(err(base, "empty feature name"));
    }

    let hash_col = base + feature.len() + 1;
    let value_col = hash_col + hash_repr.len() + 1;
    let weight_col = value_col + value_repr.len() + 1;

    let hash_index: u64 = hash_repr
        .parse()
        .map_err(|_| err(hash_col, "expected integer hash index"))?;
    let value: f64 = value_repr
        .parse()
        .map_err(|_| err(value_col, "expected numeric value"))?;

    let (weight_repr, grad_repr) = match weight_field.split_once('@') {
        Some((w, g)) => (w, Some(g)),
        None => (weight_field, None),
    };
    let weight: f64 = weight_repr
        .parse()
        .map_err(|_| err(weight_col, "expected numeric weight"))?;
    let ss_grad = match grad_repr {
        Some(g) => Some(g.parse().map_err(|_| {
            err(weight_col + weight_repr.len() + 1, "expected numeric ss_grad")
        })?),
        None => None,
    };

    let names = feature
        .split('*')
        .map(|element| match element.split_once('^') {
            Some((ns, name)) => (ns.to_string(), name.to_string()),
            None => (String::new(), element.to_string()),
        })
        .collect();

    Ok(FeatureContribution {
        feature: feature.to_string(),
        names,
        hash_index,
        value,
        weight,
        ss_grad,
        hash_repr: hash_repr.to_string(),
        value_repr: value_repr.to_string(),
        weight_repr: weight_repr.to_string(),
        grad_repr: grad_repr.map(str::to_string),
    })
}

/// Writes one sanitized line to the engine and reads back the audit
/// response: a raw score line, the audit line, and (with a link function) a
/// third line that is discarded.
///
/// Shared by both drivers; only valid on a handle opened in audit mode,
/// whose pipes stay in blocking mode.
pub(crate) fn exchange<W: Write, R: BufRead>(
    writer: &mut W,
    reader: &mut R,
    line: &str,
    link_function: bool,
) -> Result<Explanation, DriverError> {
    // Embedded newlines would desynchronize the two-line response protocol.
    let clean: String = line.chars().filter(|&c| c != '\n' && c != '\r').collect();
    let clean = clean.trim();
    if clean.is_empty() {
        return Err(DriverError::bad_input("empty line for explain"));
    }

    writer
        .write_all(clean.as_bytes())
        .and_then(|_| writer.write_all(b"\n"))
        .and_then(|_| writer.flush())
        .map_err(DriverError::from_pipe_io)?;

    let score_line = read_response_line(reader)?;
    let score: f64 = score_line
        .split_whitespace()
        .next()
        .and_then(|tok| tok.parse().ok())
        .ok_or_else(|| {
            DriverError::engine_gone(format!("expected score line, got {score_line:?}"))
        })?;

    let raw = read_response_line(reader)?;
    if link_function {
        // The linked score is redundant with `score`; consume and drop it.
        let _ = read_response_line(reader)?;
    }

    let record = AuditRecord::parse(&raw)?;
    Ok(Explanation { score, record, raw })
}

fn read_response_line<R: BufRead>(reader: &mut R) -> Result<String, DriverError> {
    let mut buf = String::new();
    let n = reader.read_line(&mut buf).map_err(DriverError::from_pipe_io)?;
    if n == 0 {
        return Err(DriverError::engine_gone("EOF while awaiting audit response"));
    }
    Ok(buf.trim_end_matches(['\r', '\n']).to_string())
}
