//! Site patterns: per-taxon observations compressed into weighted columns.

use std::collections::HashMap;

use ndarray::ArrayView2;

use crate::error::{LikelihoodError, Result};

/// Observation data for one taxon.
#[derive(Clone, Debug, PartialEq)]
pub enum TipData {
    /// One state code per pattern; a code ≥ `state_count` is ambiguous/missing.
    States(Vec<u32>),
    /// Per-pattern probability vectors, `pattern_count × state_count`, pattern-major.
    Partials(Vec<f64>),
}

/// How the data were filtered at collection time.
///
/// The named patterns usually carry weight 0: they are evaluated on the tree
/// but only enter the likelihood through the correction.
#[derive(Clone, Debug, PartialEq)]
pub enum Ascertainment {
    /// Only sites matching one of these patterns could have been observed.
    Include(Vec<usize>),
    /// Sites matching these patterns were never recorded.
    Exclude(Vec<usize>),
}

/// Aligned data for a set of taxa, in unique-pattern form.
#[derive(Clone, Debug)]
pub struct PatternSet {
    taxa: Vec<String>,
    tips: Vec<TipData>,
    weights: Vec<f64>,
    state_count: usize,
    site_patterns: Vec<usize>,
    ascertainment: Option<Ascertainment>,
}

impl PatternSet {
    /// Build from already-compressed patterns.
    pub fn new(
        taxa: Vec<String>,
        tips: Vec<TipData>,
        weights: Vec<f64>,
        state_count: usize,
    ) -> Result<Self> {
        if taxa.len() != tips.len() {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "{} taxa but {} tip data rows",
                taxa.len(),
                tips.len()
            )));
        }
        if state_count < 2 {
            return Err(LikelihoodError::InvalidParameter(
                "at least two states are required".to_string(),
            ));
        }
        let pattern_count = weights.len();
        for (name, tip) in taxa.iter().zip(&tips) {
            let len = match tip {
                TipData::States(states) => states.len(),
                TipData::Partials(partials) => {
                    if partials.len() % state_count != 0 {
                        return Err(LikelihoodError::DimensionMismatch(format!(
                            "tip partials for {} are not a multiple of {} states",
                            name, state_count
                        )));
                    }
                    partials.len() / state_count
                }
            };
            if len != pattern_count {
                return Err(LikelihoodError::DimensionMismatch(format!(
                    "taxon {} has {} patterns, expected {}",
                    name, len, pattern_count
                )));
            }
        }
        if weights.iter().any(|&w| !w.is_finite() || w < 0.0) {
            return Err(LikelihoodError::InvalidParameter(
                "pattern weights must be non-negative".to_string(),
            ));
        }

        Ok(Self {
            taxa,
            tips,
            site_patterns: (0..pattern_count).collect(),
            weights,
            state_count,
            ascertainment: None,
        })
    }

    /// Compress an alignment (taxa × sites) into unique weighted patterns.
    ///
    /// Patterns keep the order of their first occurrence. All ambiguous
    /// codes are folded to `state_count` so that differently coded gaps
    /// share a pattern.
    pub fn from_alignment(
        taxa: Vec<String>,
        alignment: ArrayView2<u32>,
        state_count: usize,
    ) -> Result<Self> {
        if alignment.nrows() != taxa.len() {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "{} taxa but alignment has {} rows",
                taxa.len(),
                alignment.nrows()
            )));
        }
        let ambiguous = state_count as u32;

        let mut pattern_index: HashMap<Vec<u32>, usize> = HashMap::new();
        let mut columns: Vec<Vec<u32>> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        let mut site_patterns = Vec::with_capacity(alignment.ncols());

        for column in alignment.columns() {
            let key: Vec<u32> = column.iter().map(|&s| s.min(ambiguous)).collect();
            let next = columns.len();
            let pattern = *pattern_index.entry(key.clone()).or_insert(next);
            if pattern == next {
                columns.push(key);
                weights.push(0.0);
            }
            weights[pattern] += 1.0;
            site_patterns.push(pattern);
        }

        let tips = (0..taxa.len())
            .map(|taxon| TipData::States(columns.iter().map(|col| col[taxon]).collect()))
            .collect();

        let mut set = Self::new(taxa, tips, weights, state_count)?;
        set.site_patterns = site_patterns;
        Ok(set)
    }

    /// Compress DNA sequences, one string per taxon.
    pub fn from_dna(taxa: Vec<String>, sequences: &[&str]) -> Result<Self> {
        let site_count = sequences.first().map_or(0, |s| s.len());
        if sequences.iter().any(|s| s.len() != site_count) {
            return Err(LikelihoodError::DimensionMismatch(
                "sequences have different lengths".to_string(),
            ));
        }
        let mut flat = Vec::with_capacity(sequences.len() * site_count);
        for seq in sequences {
            flat.extend(encode_dna(seq));
        }
        let alignment = ndarray::Array2::from_shape_vec((sequences.len(), site_count), flat)
            .map_err(|e| LikelihoodError::DimensionMismatch(e.to_string()))?;
        Self::from_alignment(taxa, alignment.view(), 4)
    }

    /// Condition the likelihood on how sites were ascertained.
    pub fn with_ascertainment(mut self, ascertainment: Ascertainment) -> Result<Self> {
        let (Ascertainment::Include(patterns) | Ascertainment::Exclude(patterns)) = &ascertainment;
        if patterns.is_empty() {
            return Err(LikelihoodError::InvalidParameter(
                "ascertainment needs at least one pattern".to_string(),
            ));
        }
        if let Some(&bad) = patterns.iter().find(|&&p| p >= self.pattern_count()) {
            return Err(LikelihoodError::InvalidParameter(format!(
                "ascertainment names pattern {} of {}",
                bad,
                self.pattern_count()
            )));
        }
        self.ascertainment = Some(ascertainment);
        Ok(self)
    }

    /// Append one weight-0 constant pattern per state and exclude them.
    ///
    /// For data where invariant sites were dropped before analysis, such as
    /// SNP panels.
    pub fn exclude_constant_patterns(mut self) -> Result<Self> {
        let first = self.pattern_count();
        let n = self.state_count;
        for tip in &mut self.tips {
            match tip {
                TipData::States(states) => states.extend(0..n as u32),
                TipData::Partials(partials) => {
                    let codes: Vec<u32> = (0..n as u32).collect();
                    partials.extend(states_to_partials(&codes, n));
                }
            }
        }
        self.weights.extend(std::iter::repeat(0.0).take(n));
        self.with_ascertainment(Ascertainment::Exclude((first..first + n).collect()))
    }

    pub fn ascertainment(&self) -> Option<&Ascertainment> {
        self.ascertainment.as_ref()
    }

    /// Log probability that a site is observable at all, given the
    /// per-pattern log-likelihoods. Zero without ascertainment.
    pub fn ascertainment_correction(&self, pattern_log_likelihoods: &[f64]) -> f64 {
        let total = |patterns: &[usize]| -> f64 {
            patterns.iter().map(|&p| pattern_log_likelihoods[p].exp()).sum()
        };
        match &self.ascertainment {
            None => 0.0,
            Some(Ascertainment::Include(patterns)) => total(patterns).ln(),
            Some(Ascertainment::Exclude(patterns)) => (-total(patterns)).ln_1p(),
        }
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn taxon_count(&self) -> usize {
        self.taxa.len()
    }

    pub fn taxon_index(&self, name: &str) -> Option<usize> {
        self.taxa.iter().position(|t| t == name)
    }

    pub fn tip(&self, taxon: usize) -> &TipData {
        &self.tips[taxon]
    }

    pub fn pattern_count(&self) -> usize {
        self.weights.len()
    }

    pub fn state_count(&self) -> usize {
        self.state_count
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Number of original alignment sites.
    pub fn site_count(&self) -> usize {
        self.site_patterns.len()
    }

    /// Pattern index for each original site.
    pub fn site_patterns(&self) -> &[usize] {
        &self.site_patterns
    }
}

/// Encode a DNA string to state codes (A=0, C=1, G=2, T/U=3, else=4).
pub fn encode_dna(seq: &str) -> Vec<u32> {
    seq.bytes()
        .map(|b| match b.to_ascii_uppercase() {
            b'A' => 0,
            b'C' => 1,
            b'G' => 2,
            b'T' | b'U' => 3,
            _ => 4,
        })
        .collect()
}

/// Expand state codes into tip partials (`pattern_count × state_count`).
///
/// Observed states become indicator vectors; ambiguous codes become all ones.
pub fn states_to_partials(states: &[u32], state_count: usize) -> Vec<f64> {
    let mut partials = vec![0.0; states.len() * state_count];
    for (row, &state) in partials.chunks_exact_mut(state_count).zip(states) {
        if (state as usize) < state_count {
            row[state as usize] = 1.0;
        } else {
            row.fill(1.0);
        }
    }
    partials
}
