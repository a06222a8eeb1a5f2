//! Stage-by-stage forward pass readback for numerical triage.
//!
//! Not on the production path: `BitNet::generate` never touches this module.
//! Intended for test tooling chasing down NaN/Inf drift across layers.

use crate::error::Result;
use crate::nn::model::BitNetModel;

/// Summary statistics for one probed tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub stage: &'static str,
    pub len: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub rms: f32,
    pub nan_count: usize,
    pub inf_count: usize,
    pub zero_count: usize,
    pub first_8: Vec<f32>,
}

impl ProbeReport {
    fn from_values(stage: &'static str, values: &[f32]) -> Self {
        let len = values.len();
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut nan_count = 0;
        let mut inf_count = 0;
        let mut zero_count = 0;

        for &v in values {
            if v.is_nan() {
                nan_count += 1;
                continue;
            }
            if v.is_infinite() {
                inf_count += 1;
                continue;
            }
            if v == 0.0 {
                zero_count += 1;
            }
            min = min.min(v);
            max = max.max(v);
            sum += v as f64;
            sum_sq += (v as f64) * (v as f64);
        }

        let finite_count = len - nan_count - inf_count;
        let mean = if finite_count > 0 {
            (sum / finite_count as f64) as f32
        } else {
            0.0
        };
        let rms = if finite_count > 0 {
            (sum_sq / finite_count as f64).sqrt() as f32
        } else {
            0.0
        };
        if finite_count == 0 {
            min = 0.0;
            max = 0.0;
        }

        Self {
            stage,
            len,
            min,
            max,
            mean,
            rms,
            nan_count,
            inf_count,
            zero_count,
            first_8: values.iter().take(8).copied().collect(),
        }
    }
}

/// Run a forward pass, reading back after each stage and reporting
/// statistics: embedding, first layer, second layer, last layer, final norm,
/// pre-head slice, first 100 logits.
pub async fn run_probe(model: &mut BitNetModel, token_ids: &[u32]) -> Result<Vec<ProbeReport>> {
    let stages = model.forward_probed(token_ids).await?;
    Ok(stages
        .into_iter()
        .map(|(name, values)| ProbeReport::from_values(name, &values))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts_nan_inf_zero() {
        let values = vec![0.0, 1.0, -1.0, f32::NAN, f32::INFINITY, f32::NEG_INFINITY, 2.0];
        let report = ProbeReport::from_values("stage", &values);
        assert_eq!(report.len, 7);
        assert_eq!(report.nan_count, 1);
        assert_eq!(report.inf_count, 2);
        assert_eq!(report.zero_count, 1);
        assert_eq!(report.min, -1.0);
        assert_eq!(report.max, 2.0);
    }

    #[test]
    fn report_mean_and_rms_over_finite_values() {
        let values = vec![1.0, -1.0, 2.0, -2.0];
        let report = ProbeReport::from_values("stage", &values);
        assert!((report.mean - 0.0).abs() < 1e-6);
        let expected_rms = ((1.0f32 + 1.0 + 4.0 + 4.0) / 4.0).sqrt();
        assert!((report.rms - expected_rms).abs() < 1e-6);
    }

    #[test]
    fn first_8_truncates_long_slices() {
        let values: Vec<f32> = (0..20).map(|i| i as f32).collect();
        let report = ProbeReport::from_values("stage", &values);
        assert_eq!(report.first_8.len(), 8);
        assert_eq!(report.first_8, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn all_nan_yields_zeroed_summary() {
        let values = vec![f32::NAN, f32::NAN];
        let report = ProbeReport::from_values("stage", &values);
        assert_eq!(report.min, 0.0);
        assert_eq!(report.max, 0.0);
        assert_eq!(report.mean, 0.0);
        assert_eq!(report.rms, 0.0);
    }
}
