//! Batch-size prediction from observed batch timings.
//!
//! Until enough batches have been observed the optimizer answers with the
//! memory formula `budget * 0.8 / per_item`. After that it fits a ridge
//! regression of throughput on batch shape and picks the candidate size with
//! the best predicted throughput that still fits the budget.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::memory::{budget_bytes, estimate_item_bytes};

/// One completed sub-batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchObservation {
    /// Mean text length in chars.
    pub text_length: f64,
    pub batch_size: usize,
    #[serde(with = "resilience::serde_millis")]
    pub actual_time: Duration,
    /// Estimated bytes in flight.
    pub memory_used: usize,
}

impl BatchObservation {
    /// Items per second.
    pub fn throughput(&self) -> f64 {
        self.batch_size as f64 / self.actual_time.as_secs_f64().max(1e-6)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    pub history_capacity: usize,
    /// Observations needed before the model is trusted.
    pub min_samples: usize,
    pub retrain_every: usize,
    /// Batch sizes the model chooses between.
    pub candidates: Vec<usize>,
    pub ridge_lambda: f64,
    pub min_batch: usize,
    pub max_batch: usize,
    /// Observations in the rolling efficiency mean/variance.
    pub efficiency_window: usize,
    /// Share of the budget the formula plans for.
    pub budget_fraction: f64,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            min_samples: 50,
            retrain_every: 100,
            candidates: vec![8, 16, 32, 64, 128, 256],
            ridge_lambda: 1e-3,
            min_batch: 8,
            max_batch: 256,
            efficiency_window: 20,
            budget_fraction: 0.8,
        }
    }
}

impl PredictiveConfig {
    pub fn with_min_samples(mut self, samples: usize) -> Self {
        self.min_samples = samples;
        self
    }

    pub fn with_retrain_every(mut self, observations: usize) -> Self {
        self.retrain_every = observations.max(1);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerStats {
    pub samples: usize,
    pub model_trained: bool,
    pub trainings: u64,
}

#[derive(Debug, Error, PartialEq)]
enum ModelError {
    #[error("need at least {needed} samples, have {have}")]
    TooFewSamples { needed: usize, have: usize },
    #[error("normal equations are singular")]
    Singular,
}

/// Features per observation, excluding the intercept.
const FEATURES: usize = 7;

#[derive(Debug, Clone, Copy)]
struct Sample {
    observation: BatchObservation,
    efficiency_mean: f64,
    efficiency_var: f64,
}

fn feature_row(
    text_length: f64,
    memory_used: usize,
    batch_size: usize,
    efficiency_mean: f64,
    efficiency_var: f64,
) -> [f64; FEATURES] {
    let memory_mb = memory_used as f64 / (1024.0 * 1024.0);
    [
        text_length,
        text_length.ln_1p(),
        memory_mb,
        memory_mb.ln_1p(),
        batch_size as f64,
        efficiency_mean,
        efficiency_var,
    ]
}

impl Sample {
    fn features(&self) -> [f64; FEATURES] {
        feature_row(
            self.observation.text_length,
            self.observation.memory_used,
            self.observation.batch_size,
            self.efficiency_mean,
            self.efficiency_var,
        )
    }
}

/// Standardized ridge regression with an unpenalized intercept.
#[derive(Debug, Clone)]
struct RidgeModel {
    weights: Array1<f64>,
    means: Array1<f64>,
    stds: Array1<f64>,
}

impl RidgeModel {
    fn fit(rows: &[[f64; FEATURES]], targets: &[f64], lambda: f64) -> Result<Self, ModelError> {
        let n = rows.len();
        if n <= FEATURES {
            return Err(ModelError::TooFewSamples {
                needed: FEATURES + 1,
                have: n,
            });
        }

        let mut means = Array1::<f64>::zeros(FEATURES);
        let mut stds = Array1::<f64>::ones(FEATURES);
        for j in 0..FEATURES {
            let mean = rows.iter().map(|row| row[j]).sum::<f64>() / n as f64;
            let var = rows.iter().map(|row| (row[j] - mean).powi(2)).sum::<f64>() / n as f64;
            means[j] = mean;
            if var > 1e-12 {
                stds[j] = var.sqrt();
            }
        }

        let mut x = Array2::<f64>::zeros((n, FEATURES + 1));
        for (i, row) in rows.iter().enumerate() {
            x[[i, 0]] = 1.0;
            for j in 0..FEATURES {
                x[[i, j + 1]] = (row[j] - means[j]) / stds[j];
            }
        }
        let y = Array1::from(targets.to_vec());

        let xt = x.t();
        let mut gram = xt.dot(&x);
        for j in 1..=FEATURES {
            gram[[j, j]] += lambda * n as f64;
        }
        let rhs = xt.dot(&y);

        let weights = solve(gram, rhs).ok_or(ModelError::Singular)?;
        Ok(Self {
            weights,
            means,
            stds,
        })
    }

    fn predict(&self, row: &[f64; FEATURES]) -> f64 {
        let mut value = self.weights[0];
        for j in 0..FEATURES {
            value += self.weights[j + 1] * (row[j] - self.means[j]) / self.stds[j];
        }
        value
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            a[[i, col]]
                .abs()
                .partial_cmp(&a[[j, col]].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[[pivot, col]].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                a.swap([col, k], [pivot, k]);
            }
            b.swap(col, pivot);
        }
        for row in (col + 1)..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                let delta = factor * a[[col, k]];
                a[[row, k]] -= delta;
            }
            let delta = factor * b[col];
            b[row] -= delta;
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let mut sum = b[row];
        for k in (row + 1)..n {
            sum -= a[[row, k]] * x[k];
        }
        x[row] = sum / a[[row, row]];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

struct State {
    history: VecDeque<Sample>,
    since_train: usize,
    model: Option<RidgeModel>,
    trainings: u64,
}

/// Learns a batch size from history; shared by every request of an engine.
pub struct PredictiveBatchOptimizer {
    config: PredictiveConfig,
    budget_bytes: usize,
    dimension: usize,
    state: Mutex<State>,
}

impl std::fmt::Debug for PredictiveBatchOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictiveBatchOptimizer")
            .field("config", &self.config)
            .field("budget_bytes", &self.budget_bytes)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

impl PredictiveBatchOptimizer {
    pub fn new(config: PredictiveConfig, memory_budget_mb: f64, dimension: usize) -> Self {
        Self {
            config,
            budget_bytes: budget_bytes(memory_budget_mb),
            dimension,
            state: Mutex::new(State {
                history: VecDeque::new(),
                since_train: 0,
                model: None,
                trainings: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &PredictiveConfig {
        &self.config
    }

    /// `budget * fraction / per_item`, clamped to `[min_batch, max_batch]`.
    pub fn formula_batch_size(&self, mean_text_length: f64) -> usize {
        let per_item = self.per_item(mean_text_length) as f64;
        let raw = (self.budget_bytes as f64 * self.config.budget_fraction / per_item).floor();
        let raw = if raw.is_finite() { raw as usize } else { 0 };
        raw.clamp(self.config.min_batch, self.config.max_batch.max(self.config.min_batch))
    }

    fn per_item(&self, mean_text_length: f64) -> usize {
        estimate_item_bytes(mean_text_length.max(0.0).round() as usize, self.dimension)
    }

    pub fn optimal_batch_size(&self, mean_text_length: f64) -> usize {
        let formula = self.formula_batch_size(mean_text_length);
        let state = self.lock();
        if state.history.len() < self.config.min_samples {
            return formula;
        }
        let Some(model) = state.model.as_ref() else {
            return formula;
        };

        let per_item = self.per_item(mean_text_length);
        let (efficiency_mean, efficiency_var) =
            efficiency_stats(&state.history, self.config.efficiency_window);

        let mut best: Option<(usize, f64)> = None;
        for &candidate in &self.config.candidates {
            let memory = candidate.saturating_mul(per_item);
            if memory > self.budget_bytes {
                continue;
            }
            let row = feature_row(mean_text_length, memory, candidate, efficiency_mean, efficiency_var);
            let predicted = model.predict(&row);
            if !predicted.is_finite() {
                tracing::debug!(candidate, "throughput prediction not finite, using formula");
                return formula;
            }
            if best.is_none_or(|(_, score)| predicted > score) {
                best = Some((candidate, predicted));
            }
        }

        best.map(|(candidate, _)| candidate).unwrap_or(formula)
    }

    /// Record a completed batch; retrains when due.
    pub fn observe(&self, observation: BatchObservation) {
        if observation.batch_size == 0 {
            return;
        }
        let mut state = self.lock();
        let (efficiency_mean, efficiency_var) =
            efficiency_stats(&state.history, self.config.efficiency_window);
        state.history.push_back(Sample {
            observation,
            efficiency_mean,
            efficiency_var,
        });
        while state.history.len() > self.config.history_capacity {
            state.history.pop_front();
        }
        state.since_train += 1;

        let enough = state.history.len() >= self.config.min_samples;
        let due = state.model.is_none() || state.since_train >= self.config.retrain_every;
        if enough && due {
            self.retrain(&mut state);
        }
    }

    fn retrain(&self, state: &mut State) {
        let rows: Vec<[f64; FEATURES]> = state.history.iter().map(Sample::features).collect();
        let targets: Vec<f64> = state
            .history
            .iter()
            .map(|sample| sample.observation.throughput())
            .collect();

        state.since_train = 0;
        match RidgeModel::fit(&rows, &targets, self.config.ridge_lambda) {
            Ok(model) => {
                state.model = Some(model);
                state.trainings += 1;
                tracing::debug!(samples = rows.len(), "batch-size model retrained");
            }
            Err(error) => {
                state.model = None;
                tracing::debug!(%error, "batch-size model training failed, using formula");
            }
        }
    }

    pub fn stats(&self) -> OptimizerStats {
        let state = self.lock();
        OptimizerStats {
            samples: state.history.len(),
            model_trained: state.model.is_some(),
            trainings: state.trainings,
        }
    }
}

/// Mean and population variance of throughput over the last `window` samples.
fn efficiency_stats(history: &VecDeque<Sample>, window: usize) -> (f64, f64) {
    let recent: Vec<f64> = history
        .iter()
        .rev()
        .take(window.max(1))
        .map(|sample| sample.observation.throughput())
        .collect();
    if recent.is_empty() {
        return (0.0, 0.0);
    }
    let n = recent.len() as f64;
    let mean = recent.iter().sum::<f64>() / n;
    let var = recent.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(batch_size: usize, seconds: f64) -> BatchObservation {
        BatchObservation {
            text_length: 100.0,
            batch_size,
            actual_time: Duration::from_secs_f64(seconds),
            memory_used: batch_size * estimate_item_bytes(100, 384),
        }
    }

    #[test]
    fn formula_below_min_samples() {
        let optimizer = PredictiveBatchOptimizer::new(PredictiveConfig::default(), 1.0, 384);
        // 1 MiB * 0.8 / 1992 bytes per item = 421, clamped to 256.
        assert_eq!(optimizer.optimal_batch_size(100.0), 256);

        let tight = PredictiveBatchOptimizer::new(PredictiveConfig::default(), 0.01, 384);
        assert_eq!(tight.optimal_batch_size(100.0), 8);
        assert!(!optimizer.stats().model_trained);
    }

    #[test]
    fn model_prefers_faster_batch_sizes() {
        let optimizer = PredictiveBatchOptimizer::new(PredictiveConfig::default(), 1.0, 384);
        let sizes = [8usize, 16, 32, 64, 128, 256];
        // Per-item cost grows with batch size, so small batches win.
        for round in 0..20 {
            for &size in &sizes {
                let jitter = 1.0 + (round % 3) as f64 * 0.01;
                let seconds = (0.001 * size as f64 + 0.0001 * (size * size) as f64) * jitter;
                optimizer.observe(observation(size, seconds));
            }
        }

        let stats = optimizer.stats();
        assert!(stats.model_trained);
        assert_eq!(stats.samples, 120);
        assert_eq!(optimizer.optimal_batch_size(100.0), 8);
        assert_eq!(optimizer.formula_batch_size(100.0), 256);
    }

    #[test]
    fn history_is_bounded() {
        let config = PredictiveConfig {
            history_capacity: 60,
            ..PredictiveConfig::default()
        };
        let optimizer = PredictiveBatchOptimizer::new(config, 1.0, 384);
        for i in 0..200 {
            optimizer.observe(observation(8 + i % 5, 0.01));
        }
        assert_eq!(optimizer.stats().samples, 60);
    }

    #[test]
    fn solve_recovers_linear_system() {
        let a = Array2::from_shape_vec((2, 2), vec![2.0, 1.0, 1.0, 3.0]).unwrap();
        let b = Array1::from(vec![3.0, 5.0]);
        let x = solve(a, b).unwrap();
        assert!((x[0] - 0.8).abs() < 1e-9);
        assert!((x[1] - 1.4).abs() < 1e-9);

        let singular = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 2.0, 4.0]).unwrap();
        assert!(solve(singular, Array1::from(vec![1.0, 2.0])).is_none());
    }

    #[test]
    fn too_few_rows_is_a_training_error() {
        let rows = vec![[1.0; FEATURES]; 3];
        let err = RidgeModel::fit(&rows, &[1.0, 2.0, 3.0], 1e-3).unwrap_err();
        assert_eq!(err, ModelError::TooFewSamples { needed: FEATURES + 1, have: 3 });
    }
}
