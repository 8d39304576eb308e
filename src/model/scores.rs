//! Reconciles classifier outputs (softmax vectors, boosted-tree probabilities,
//! transformer logits) into one decision.

use crate::error::ServiceError;

/// How a classifier's raw output should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreKind {
    Probabilities,
    Logits,
}

const PROBABILITY_SLACK: f32 = 1e-4;
/// Accumulated f32 rounding over a few dozen classes stays well below this.
const SUM_TOLERANCE: f32 = 1e-4;

pub fn ensure_finite(values: &[f32], source: &str) -> Result<(), ServiceError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(ServiceError::NumericAnomaly(source.to_string()))
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest value; ties go to the lowest index.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in values.iter().enumerate() {
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Turns a raw output into a probability vector, rejecting non-finite values,
/// probabilities outside [0, 1] and vectors that do not sum to 1.
pub fn to_probabilities(
    raw: Vec<f32>,
    kind: ScoreKind,
    source: &str,
) -> Result<Vec<f32>, ServiceError> {
    ensure_finite(&raw, source)?;
    let probabilities = match kind {
        ScoreKind::Probabilities => raw,
        ScoreKind::Logits => softmax(&raw),
    };
    ensure_finite(&probabilities, source)?;
    if probabilities
        .iter()
        .any(|&p| !(-PROBABILITY_SLACK..=1.0 + PROBABILITY_SLACK).contains(&p))
    {
        return Err(ServiceError::NumericAnomaly(format!(
            "{source} (probability outside [0, 1])"
        )));
    }
    let sum: f32 = probabilities.iter().sum();
    if (sum - 1.0).abs() > SUM_TOLERANCE {
        return Err(ServiceError::NumericAnomaly(format!(
            "{source} (probabilities sum to {sum})"
        )));
    }
    Ok(probabilities)
}

/// Arg-max class and its confidence as a percentage in [0, 100].
pub fn decide(probabilities: &[f32], source: &str) -> Result<(usize, f32), ServiceError> {
    let index = argmax(probabilities)
        .ok_or_else(|| ServiceError::Inference(format!("{source} produced an empty output")))?;
    let confidence = (probabilities[index] * 100.0).clamp(0.0, 100.0);
    Ok((index, confidence))
}
