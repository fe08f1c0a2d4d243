//! Lossy f32 ↔ int conversion with a calibrated, swappable profile.
//!
//! Each stored entry carries its own scale, so a profile swap never changes how
//! an already-written entry decodes. The profile only decides the scale of the
//! next vectors written.
//!
//! Amplitude selection:
//!
//! - uncalibrated: `maxAbs(v)`, the tightest scale that never clips;
//! - calibrated: the 99.9th percentile of recent component magnitudes, clamped
//!   into `[maxAbs(v), 2 * maxAbs(v)]`. The lower clamp prevents clipping, the
//!   upper one keeps the round-trip error within `maxAbs(v) / levels`.

use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::entry::{Dtype, Payload};
use crate::error::CacheError;

/// Quantization settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuantizationConfig {
    /// When false every entry is stored as raw `f32`.
    pub enabled: bool,
    pub dtype: Dtype,
    /// Recalibrate after this many observed vectors.
    pub recalibrate_every: usize,
    /// ... or after this much time, whichever comes first (milliseconds).
    #[serde(with = "resilience::serde_millis")]
    pub recalibrate_interval: Duration,
    /// Component magnitudes kept for the percentile estimate.
    pub sample_capacity: usize,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dtype: Dtype::I8,
            recalibrate_every: 1000,
            recalibrate_interval: Duration::from_secs(300),
            sample_capacity: 65_536,
        }
    }
}

impl QuantizationConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_dtype(mut self, dtype: Dtype) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_recalibrate_every(mut self, vectors: usize) -> Self {
        self.recalibrate_every = vectors.max(1);
        self
    }

    pub fn with_recalibrate_interval(mut self, interval: Duration) -> Self {
        self.recalibrate_interval = interval;
        self
    }

    pub fn with_sample_capacity(mut self, capacity: usize) -> Self {
        self.sample_capacity = capacity.max(1);
        self
    }

    /// Storage type actually used for new entries.
    pub fn effective_dtype(&self) -> Dtype {
        if self.enabled {
            self.dtype
        } else {
            Dtype::F32
        }
    }
}

/// Active profile for one dtype.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationProfile {
    pub dtype: Dtype,
    /// Shared scale (`amplitude / levels`) once calibrated, 0 before.
    pub scale: f32,
    pub calibrated: bool,
}

/// Output of [`QuantizationCodec::quantize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Quantized {
    pub payload: Payload,
    pub scale: f32,
}

#[derive(Debug)]
struct Sampler {
    magnitudes: VecDeque<f32>,
    vectors_since_calibration: usize,
    last_calibration: Instant,
}

/// Quantizer with a rolling calibration sample.
#[derive(Debug)]
pub struct QuantizationCodec {
    config: QuantizationConfig,
    profile: RwLock<Arc<QuantizationProfile>>,
    sampler: Mutex<Sampler>,
}

impl QuantizationCodec {
    pub fn new(config: QuantizationConfig) -> Self {
        let profile = QuantizationProfile {
            dtype: config.effective_dtype(),
            scale: 0.0,
            calibrated: false,
        };
        Self {
            profile: RwLock::new(Arc::new(profile)),
            sampler: Mutex::new(Sampler {
                magnitudes: VecDeque::with_capacity(config.sample_capacity.min(65_536)),
                vectors_since_calibration: 0,
                last_calibration: Instant::now(),
            }),
            config,
        }
    }

    pub fn config(&self) -> &QuantizationConfig {
        &self.config
    }

    pub fn dtype(&self) -> Dtype {
        self.config.effective_dtype()
    }

    /// Snapshot of the active profile. Callers holding it keep a consistent
    /// view across a concurrent recalibration.
    pub fn profile(&self) -> Arc<QuantizationProfile> {
        self.profile
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn quantize(&self, vector: &[f32]) -> Result<Quantized, CacheError> {
        let profile = self.profile();
        quantize_with(&profile, vector)
    }

    pub fn dequantize(&self, payload: &Payload, scale: f32) -> Result<Vec<f32>, CacheError> {
        dequantize(payload, scale)
    }

    /// Feed completed vectors into the calibration sample. Recalibrates when
    /// the count or time trigger fires; returns whether it did.
    ///
    /// Call this after a batch has been fully written so the profile never
    /// changes underneath a batch in progress.
    pub fn observe(&self, vectors: &[Vec<f32>]) -> bool {
        let Some(levels) = self.dtype().levels() else {
            return false;
        };

        let mut sampler = self.sampler.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for vector in vectors {
            for &x in vector.iter().filter(|x| x.is_finite()) {
                if sampler.magnitudes.len() >= self.config.sample_capacity {
                    sampler.magnitudes.pop_front();
                }
                sampler.magnitudes.push_back(x.abs());
            }
        }
        sampler.vectors_since_calibration += vectors.len();

        let due = sampler.vectors_since_calibration >= self.config.recalibrate_every
            || (sampler.vectors_since_calibration > 0
                && sampler.last_calibration.elapsed() >= self.config.recalibrate_interval);
        if !due || sampler.magnitudes.is_empty() {
            return false;
        }

        let samples: Vec<f64> = sampler.magnitudes.iter().map(|&m| m as f64).collect();
        let sample_size = samples.len();
        sampler.vectors_since_calibration = 0;
        sampler.last_calibration = Instant::now();
        drop(sampler);

        let p999 = Data::new(samples).quantile(0.999) as f32;
        if !p999.is_finite() || p999 <= 0.0 {
            return false;
        }

        let profile = QuantizationProfile {
            dtype: self.dtype(),
            scale: p999 / levels,
            calibrated: true,
        };
        *self
            .profile
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(profile);
        tracing::info!(
            dtype = %profile.dtype,
            amplitude = p999,
            sample_size,
            "quantization profile recalibrated"
        );
        true
    }
}

/// Quantize one vector under `profile`.
pub fn quantize_with(profile: &QuantizationProfile, vector: &[f32]) -> Result<Quantized, CacheError> {
    if let Some(idx) = vector.iter().position(|x| !x.is_finite()) {
        return Err(CacheError::Quantization(format!(
            "non-finite component at index {idx}"
        )));
    }

    let Some(levels) = profile.dtype.levels() else {
        return Ok(Quantized {
            payload: Payload::F32(vector.to_vec()),
            scale: 1.0,
        });
    };

    let max_abs = vector.iter().fold(0.0f32, |acc, x| acc.max(x.abs()));
    if max_abs == 0.0 {
        let payload = match profile.dtype {
            Dtype::I8 => Payload::I8(vec![0; vector.len()]),
            _ => Payload::I16(vec![0; vector.len()]),
        };
        return Ok(Quantized { payload, scale: 1.0 });
    }

    let amplitude = if profile.calibrated {
        (profile.scale * levels).clamp(max_abs, 2.0 * max_abs)
    } else {
        max_abs
    };
    let scale = amplitude / levels;
    let step = |x: f32| (x / scale).round().clamp(-levels, levels);

    let payload = match profile.dtype {
        Dtype::I8 => Payload::I8(vector.iter().map(|&x| step(x) as i8).collect()),
        _ => Payload::I16(vector.iter().map(|&x| step(x) as i16).collect()),
    };
    Ok(Quantized { payload, scale })
}

/// Restore floats. A non-positive or non-finite scale means the stored entry
/// is corrupt.
pub fn dequantize(payload: &Payload, scale: f32) -> Result<Vec<f32>, CacheError> {
    let out: Vec<f32> = match payload {
        Payload::F32(values) => values.clone(),
        Payload::I8(values) => {
            check_scale(scale)?;
            values.iter().map(|&q| q as f32 * scale).collect()
        }
        Payload::I16(values) => {
            check_scale(scale)?;
            values.iter().map(|&q| q as f32 * scale).collect()
        }
    };

    if out.iter().any(|x| !x.is_finite()) {
        return Err(CacheError::Quantization("stored vector has non-finite values".into()));
    }
    Ok(out)
}

fn check_scale(scale: f32) -> Result<(), CacheError> {
    if scale.is_finite() && scale > 0.0 {
        Ok(())
    } else {
        Err(CacheError::Quantization(format!("invalid scale {scale}")))
    }
}
