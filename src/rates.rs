//! Discrete rate categories for among-site rate variation.

use crate::error::{LikelihoodError, Result};

/// How sites are assigned to rate categories.
#[derive(Clone, Debug, PartialEq)]
pub enum CategoryAssignment {
    /// Every pattern is integrated over all categories with these weights.
    Integrated { proportions: Vec<f64> },
    /// Each pattern uses exactly one category (the engine's matrix map).
    PerPattern { categories: Vec<usize> },
}

/// Relative rates for each category plus how patterns use them.
#[derive(Clone, Debug, PartialEq)]
pub struct RateCategories {
    rates: Vec<f64>,
    assignment: CategoryAssignment,
}

impl RateCategories {
    /// A single category with rate 1.
    pub fn single() -> Self {
        Self {
            rates: vec![1.0],
            assignment: CategoryAssignment::Integrated {
                proportions: vec![1.0],
            },
        }
    }

    /// Mixture of categories integrated at the root.
    pub fn new(rates: Vec<f64>, proportions: Vec<f64>) -> Result<Self> {
        validate_rates(&rates)?;
        if proportions.len() != rates.len() {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "{} proportions for {} rate categories",
                proportions.len(),
                rates.len()
            )));
        }
        if proportions.iter().any(|&p| !p.is_finite() || p < 0.0) {
            return Err(LikelihoodError::InvalidParameter(
                "category proportions must be non-negative".to_string(),
            ));
        }
        let total: f64 = proportions.iter().sum();
        if (total - 1.0).abs() > 1e-8 {
            return Err(LikelihoodError::InvalidParameter(format!(
                "category proportions sum to {}, not 1",
                total
            )));
        }
        Ok(Self {
            rates,
            assignment: CategoryAssignment::Integrated { proportions },
        })
    }

    /// Equally weighted categories.
    pub fn equal(rates: Vec<f64>) -> Result<Self> {
        let n = rates.len().max(1);
        Self::new(rates, vec![1.0 / n as f64; n])
    }

    /// Each pattern pinned to one category.
    pub fn per_pattern(rates: Vec<f64>, categories: Vec<usize>) -> Result<Self> {
        validate_rates(&rates)?;
        if let Some(&bad) = categories.iter().find(|&&c| c >= rates.len()) {
            return Err(LikelihoodError::InvalidParameter(format!(
                "pattern category {} but only {} rate categories",
                bad,
                rates.len()
            )));
        }
        Ok(Self {
            rates,
            assignment: CategoryAssignment::PerPattern { categories },
        })
    }

    pub fn category_count(&self) -> usize {
        self.rates.len()
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    /// Rate of one category, `None` past the last category.
    pub fn rate(&self, category: usize) -> Option<f64> {
        self.rates.get(category).copied()
    }

    pub fn assignment(&self) -> &CategoryAssignment {
        &self.assignment
    }

    pub fn integrates_categories(&self) -> bool {
        matches!(self.assignment, CategoryAssignment::Integrated { .. })
    }

    /// Mixing proportions, if categories are integrated.
    pub fn proportions(&self) -> Option<&[f64]> {
        match &self.assignment {
            CategoryAssignment::Integrated { proportions } => Some(proportions),
            CategoryAssignment::PerPattern { .. } => None,
        }
    }

    /// Per-pattern category map, if categories are assigned per pattern.
    pub fn pattern_categories(&self) -> Option<&[usize]> {
        match &self.assignment {
            CategoryAssignment::PerPattern { categories } => Some(categories),
            CategoryAssignment::Integrated { .. } => None,
        }
    }
}

impl Default for RateCategories {
    fn default() -> Self {
        Self::single()
    }
}

fn validate_rates(rates: &[f64]) -> Result<()> {
    if rates.is_empty() {
        return Err(LikelihoodError::InvalidParameter(
            "at least one rate category is required".to_string(),
        ));
    }
    for (category, &rate) in rates.iter().enumerate() {
        if !rate.is_finite() || rate < 0.0 {
            return Err(LikelihoodError::InvalidRate { category, rate });
        }
    }
    Ok(())
}
