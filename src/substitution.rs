//! Substitution processes that fill transition probability matrices.
//!
//! The likelihood engine only consumes filled matrices; it does not care
//! which implementation produced them. Matrices are row-stochastic and laid
//! out row-major, `out[i * S + j] = P(j | i, t)` with `i` the parent state.

use crate::error::{LikelihoodError, Result};

/// A continuous-time Markov substitution process.
pub trait SubstitutionModel {
    /// Number of states (4 for nucleotides, 2 for presence/absence, ...).
    fn state_count(&self) -> usize;

    /// Equilibrium state frequencies, used at the root.
    fn frequencies(&self) -> &[f64];

    /// Fill `out` (length `state_count²`) with `P(t)` for
    /// `t = branch_length * rate`. `category` identifies the rate category
    /// for processes that vary by category; simple processes ignore it.
    fn fill_transition_matrix(&self, branch_length: f64, rate: f64, category: usize, out: &mut [f64]);
}

/// Felsenstein (1981) model: equal exchangeabilities, arbitrary frequencies.
///
/// `P(j | i, t) = e^{-βt} δ_ij + (1 - e^{-βt}) π_j` with
/// `β = 1 / (1 - Σ π_k²)`, so the expected substitution rate is 1.
#[derive(Clone, Debug)]
pub struct F81 {
    frequencies: Vec<f64>,
    beta: f64,
}

impl F81 {
    pub fn new(frequencies: Vec<f64>) -> Result<Self> {
        if frequencies.len() < 2 {
            return Err(LikelihoodError::InvalidParameter(
                "F81 needs at least two states".to_string(),
            ));
        }
        if frequencies.iter().any(|&f| !f.is_finite() || f <= 0.0) {
            return Err(LikelihoodError::InvalidParameter(
                "state frequencies must be positive".to_string(),
            ));
        }
        let total: f64 = frequencies.iter().sum();
        if (total - 1.0).abs() > 1e-8 {
            return Err(LikelihoodError::InvalidParameter(format!(
                "state frequencies sum to {}, not 1",
                total
            )));
        }

        let sum_sq: f64 = frequencies.iter().map(|f| f * f).sum();
        Ok(Self {
            beta: 1.0 / (1.0 - sum_sq),
            frequencies,
        })
    }

    /// Jukes-Cantor: uniform frequencies over `state_count` states.
    pub fn jukes_cantor(state_count: usize) -> Result<Self> {
        if state_count < 2 {
            return Err(LikelihoodError::InvalidParameter(
                "Jukes-Cantor needs at least two states".to_string(),
            ));
        }
        Self::new(vec![1.0 / state_count as f64; state_count])
    }
}

impl SubstitutionModel for F81 {
    fn state_count(&self) -> usize {
        self.frequencies.len()
    }

    fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    fn fill_transition_matrix(&self, branch_length: f64, rate: f64, _category: usize, out: &mut [f64]) {
        let n = self.frequencies.len();
        let decay = (-self.beta * branch_length * rate).exp();

        for (i, row) in out.chunks_exact_mut(n).enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                let stay = if i == j { decay } else { 0.0 };
                *cell = stay + (1.0 - decay) * self.frequencies[j];
            }
        }
    }
}

/// Binary gain/loss process.
///
/// Q = [[-λ, λ], [μ, -μ]] with analytic P(t) = exp(Qt).
#[derive(Clone, Debug)]
pub struct BinaryGainLoss {
    gain_rate: f64,
    loss_rate: f64,
    frequencies: [f64; 2],
}

impl BinaryGainLoss {
    /// # Arguments
    /// * `gain_rate` - Rate of 0→1 transitions (λ)
    /// * `loss_rate` - Rate of 1→0 transitions (μ)
    pub fn new(gain_rate: f64, loss_rate: f64) -> Result<Self> {
        if !(gain_rate >= 0.0 && loss_rate >= 0.0) || !gain_rate.is_finite() || !loss_rate.is_finite() {
            return Err(LikelihoodError::InvalidParameter(format!(
                "gain/loss rates must be finite and non-negative (got {}, {})",
                gain_rate, loss_rate
            )));
        }
        Ok(Self {
            gain_rate,
            loss_rate,
            frequencies: equilibrium_frequencies(gain_rate, loss_rate),
        })
    }

    pub fn gain_rate(&self) -> f64 {
        self.gain_rate
    }

    pub fn loss_rate(&self) -> f64 {
        self.loss_rate
    }
}

impl SubstitutionModel for BinaryGainLoss {
    fn state_count(&self) -> usize {
        2
    }

    fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    fn fill_transition_matrix(&self, branch_length: f64, rate: f64, _category: usize, out: &mut [f64]) {
        let p = transition_matrix(self.gain_rate, self.loss_rate, branch_length * rate);
        out[0] = p[0][0];
        out[1] = p[0][1];
        out[2] = p[1][0];
        out[3] = p[1][1];
    }
}

/// Compute transition probability matrix for binary evolution.
///
/// # Returns
/// 2×2 transition probability matrix [[P00, P01], [P10, P11]]
fn transition_matrix(gain_rate: f64, loss_rate: f64, t: f64) -> [[f64; 2]; 2] {
    let total = gain_rate + loss_rate;

    if total < 1e-10 {
        // No evolution - identity matrix
        return [[1.0, 0.0], [0.0, 1.0]];
    }

    let exp_term = (-total * t).exp();

    let p00 = (loss_rate + gain_rate * exp_term) / total;
    let p01 = (gain_rate - gain_rate * exp_term) / total;
    let p10 = (loss_rate - loss_rate * exp_term) / total;
    let p11 = (gain_rate + loss_rate * exp_term) / total;

    [[p00, p01], [p10, p11]]
}

/// Equilibrium frequencies for binary evolution.
///
/// At equilibrium: π₀ · λ = π₁ · μ and π₀ + π₁ = 1.
fn equilibrium_frequencies(gain_rate: f64, loss_rate: f64) -> [f64; 2] {
    let total = gain_rate + loss_rate;

    if total < 1e-10 {
        return [0.5, 0.5];
    }

    [loss_rate / total, gain_rate / total]
}
