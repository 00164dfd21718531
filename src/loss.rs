//! Losses over attention distributions.
//!
//! [`AttentionLoss`] is the negative log-likelihood of the provided alignment under
//! the attention weights of each decoder step:
//! \[
//! \ell_s = -\frac{1}{|B_s|}\sum_{b \in B_s} \log \max(a_{b,s,y_{b,s}}, \varepsilon),
//! \qquad B_s = \{ b : y_{b,s} \ne \text{ignore} \},
//! \]
//! with \(\varepsilon = 10^{-20}\). Step losses are summed into a
//! [`LossAccumulator`] and averaged over the number of steps evaluated.
//!
//! A loss object is single-owner state: reset it between epochs and evaluation
//! passes, and give every worker its own instance.

use ndarray::{ArrayView1, ArrayView2, ArrayView3, Axis};

use crate::field::DEFAULT_IGNORE_INDEX;

/// Probability floor applied before taking the logarithm.
pub const PROB_FLOOR: f64 = 1e-20;

/// Errors for loss evaluation.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Outputs and targets disagree on a dimension.
    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Which dimension disagrees.
        what: &'static str,
        /// Required size.
        expected: usize,
        /// Size that was provided.
        got: usize,
    },
    /// Target index does not name an output position.
    #[error("target {target} for batch element {batch} outside 0..{len}")]
    TargetOutOfRange {
        /// Batch element.
        batch: usize,
        /// The offending target.
        target: i64,
        /// Number of output positions.
        len: usize,
    },
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

/// Running sum of step losses and the number of steps summed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossAccumulator {
    sum: f64,
    norm: usize,
}

impl LossAccumulator {
    /// Add one step loss.
    pub fn accumulate(&mut self, step_loss: f64) {
        self.sum += step_loss;
        self.norm += 1;
    }

    /// Back to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Sum of accumulated losses.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Number of accumulated steps.
    pub fn norm(&self) -> usize {
        self.norm
    }

    /// Mean step loss, `0.0` when nothing was accumulated.
    pub fn value(&self) -> f64 {
        if self.norm == 0 {
            0.0
        } else {
            self.sum / self.norm as f64
        }
    }
}

/// Loss plugged into the training loop.
pub trait Loss {
    /// Human-readable name.
    fn name(&self) -> &'static str;

    /// Short name used in logs.
    fn short_name(&self) -> &'static str;

    /// Key of the model output this loss reads.
    fn inputs(&self) -> &'static str;

    /// Key of the target this loss reads.
    fn targets(&self) -> &'static str;

    /// Clear accumulated state.
    fn reset(&mut self);

    /// Check one step without touching accumulated state.
    fn validate_step(
        &self,
        step_outputs: ArrayView2<'_, f64>,
        step_target: ArrayView1<'_, i64>,
    ) -> Result<()> {
        let _ = (step_outputs, step_target);
        Ok(())
    }

    /// Score one decoder step: `step_outputs` is `(batch, len)`, `step_target` is `(batch,)`.
    ///
    /// Returns the step loss, which is also accumulated.
    fn eval_step(&mut self, step_outputs: ArrayView2<'_, f64>, step_target: ArrayView1<'_, i64>)
        -> Result<f64>;

    /// Score every step of `outputs` (`(batch, steps, len)`).
    ///
    /// Column 0 of `targets` belongs to the start-of-sequence step, so step `s` is
    /// scored against column `s + 1`. Every step is validated before any is
    /// accumulated, so a failing batch leaves the accumulator untouched.
    fn eval_batch(&mut self, outputs: ArrayView3<'_, f64>, targets: ArrayView2<'_, i64>) -> Result<()> {
        let (batch, steps, _) = outputs.dim();
        let (t_batch, t_len) = targets.dim();
        if t_batch != batch {
            return Err(Error::ShapeMismatch {
                what: "target batch",
                expected: batch,
                got: t_batch,
            });
        }
        if t_len < steps + 1 {
            return Err(Error::ShapeMismatch {
                what: "target steps",
                expected: steps + 1,
                got: t_len,
            });
        }
        for (s, step_outputs) in outputs.axis_iter(Axis(1)).enumerate() {
            self.validate_step(step_outputs, targets.column(s + 1))?;
        }
        for (s, step_outputs) in outputs.axis_iter(Axis(1)).enumerate() {
            self.eval_step(step_outputs, targets.column(s + 1))?;
        }
        Ok(())
    }

    /// Loss averaged over evaluated steps.
    fn get_loss(&self) -> f64;
}

/// Cross entropy between attention weights and provided alignments.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionLoss {
    ignore_index: i64,
    acc: LossAccumulator,
}

impl Default for AttentionLoss {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORE_INDEX)
    }
}

impl AttentionLoss {
    /// Display name.
    pub const NAME: &'static str = "Attention Loss";
    /// Log name.
    pub const SHORT_NAME: &'static str = "attn_loss";
    /// Model output key.
    pub const INPUTS: &'static str = "attention_score";
    /// Target key.
    pub const TARGETS: &'static str = "attention_target";

    /// Loss that skips targets equal to `ignore_index`.
    pub fn new(ignore_index: i64) -> Self {
        Self {
            ignore_index,
            acc: LossAccumulator::default(),
        }
    }

    /// Target value excluded from the loss.
    pub fn ignore_index(&self) -> i64 {
        self.ignore_index
    }

    /// Accumulated state.
    pub fn accumulator(&self) -> &LossAccumulator {
        &self.acc
    }
}

impl Loss for AttentionLoss {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn short_name(&self) -> &'static str {
        Self::SHORT_NAME
    }

    fn inputs(&self) -> &'static str {
        Self::INPUTS
    }

    fn targets(&self) -> &'static str {
        Self::TARGETS
    }

    fn reset(&mut self) {
        self.acc.reset();
    }

    fn validate_step(
        &self,
        step_outputs: ArrayView2<'_, f64>,
        step_target: ArrayView1<'_, i64>,
    ) -> Result<()> {
        let (batch, len) = step_outputs.dim();
        if step_target.len() != batch {
            return Err(Error::ShapeMismatch {
                what: "step target batch",
                expected: batch,
                got: step_target.len(),
            });
        }
        for (b, &target) in step_target.iter().enumerate() {
            if target != self.ignore_index && (target < 0 || target as usize >= len) {
                return Err(Error::TargetOutOfRange { batch: b, target, len });
            }
        }
        Ok(())
    }

    fn eval_step(
        &mut self,
        step_outputs: ArrayView2<'_, f64>,
        step_target: ArrayView1<'_, i64>,
    ) -> Result<f64> {
        self.validate_step(step_outputs, step_target)?;

        let mut nll = 0.0;
        let mut counted = 0usize;
        for (b, &target) in step_target.iter().enumerate() {
            if target == self.ignore_index {
                continue;
            }
            let p = step_outputs[[b, target as usize]].max(PROB_FLOOR);
            nll -= p.ln();
            counted += 1;
        }
        // All-ignored steps still count towards the normalization.
        let step_loss = if counted == 0 { 0.0 } else { nll / counted as f64 };
        self.acc.accumulate(step_loss);
        Ok(step_loss)
    }

    fn get_loss(&self) -> f64 {
        self.acc.value()
    }
}
