//! Hard attentive guidance: attention scores dictated by provided alignments.
//!
//! Given alignment indices `a[b, t]` (one encoder position per decoder step), the
//! pre-softmax score tensor is
//! \[
//! S_{b,t,j} = \begin{cases} 1 & j = a_{b,t} \\ -\infty & \text{otherwise} \end{cases}
//! \]
//! so that `softmax(S[b, t, :])` puts all mass on `a[b, t]`.
//!
//! Padding indices ([`PAD_ALIGNMENT`] by default, or the field's `ignore_index`
//! via [`HardGuidance::with_pad`]) are routed to encoder position 0. Every row
//! therefore has exactly one finite entry and the softmax never sees an all
//! `-inf` row.
//!
//! Two step-selection modes are supported:
//! - [`Step::All`]: rolled decoding, one score row per decoder state;
//! - [`Step::At`]: incremental decoding, a single decoder state scored against
//!   column `s` of the alignment tensor.

use ndarray::{Array3, ArrayView2, ArrayView3};

/// Default alignment value for padded decoder positions.
pub const PAD_ALIGNMENT: i64 = -1;

/// The finite score placed at the aligned position.
pub const ALIGNED_SCORE: f64 = 1.0;

/// Errors for the hard-guidance scorer.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Two inputs disagree on a dimension.
    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Which dimension disagrees.
        what: &'static str,
        /// Required size.
        expected: usize,
        /// Size that was provided.
        got: usize,
    },
    /// Provided alignment does not cover all decoder steps.
    #[error("alignment has {got} steps, need at least {needed}")]
    AlignmentTooShort {
        /// Number of decoder rows to score.
        needed: usize,
        /// Number of alignment columns.
        got: usize,
    },
    /// Selected step is past the end of the provided alignment.
    #[error("step {step} out of range for alignment with {len} steps")]
    StepOutOfRange {
        /// Requested step.
        step: usize,
        /// Number of alignment columns.
        len: usize,
    },
    /// Alignment index does not name an encoder position.
    #[error("alignment index {index} at (batch {batch}, step {step}) outside 0..{enc_len}")]
    IndexOutOfRange {
        /// Batch element.
        batch: usize,
        /// Decoder row.
        step: usize,
        /// The offending index.
        index: i64,
        /// Number of encoder positions.
        enc_len: usize,
    },
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

/// Which decoder steps to score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Step {
    /// Score every decoder state at once.
    #[default]
    All,
    /// Score a single decoder state against alignment column `s`.
    At(usize),
}

/// Scoring strategy that ignores state values and reads alignments instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardGuidance {
    pad: i64,
}

impl Default for HardGuidance {
    fn default() -> Self {
        Self::with_pad(PAD_ALIGNMENT)
    }
}

impl HardGuidance {
    /// Scorer treating `pad` as padding.
    ///
    /// Pass the alignment field's `ignore_index` so that its sentinel and pad
    /// cells attend to encoder position 0.
    pub const fn with_pad(pad: i64) -> Self {
        Self { pad }
    }

    /// Alignment value routed to encoder position 0.
    pub fn pad(&self) -> i64 {
        self.pad
    }

    /// Build the `(batch, dec_len, enc_len)` score tensor.
    ///
    /// Only the shapes of `decoder_states` and `encoder_states` are read.
    /// `provided` has shape `(batch, alignment_len)`.
    pub fn scores(
        &self,
        decoder_states: ArrayView3<'_, f64>,
        encoder_states: ArrayView3<'_, f64>,
        step: Step,
        provided: ArrayView2<'_, i64>,
    ) -> Result<Array3<f64>> {
        let (batch, dec_len, _) = decoder_states.dim();
        let (enc_batch, enc_len, _) = encoder_states.dim();
        if enc_batch != batch {
            return Err(Error::ShapeMismatch {
                what: "encoder batch",
                expected: batch,
                got: enc_batch,
            });
        }
        self.scores_for_shape(batch, dec_len, enc_len, step, provided)
    }

    /// Shape-only form of [`Self::scores`].
    pub fn scores_for_shape(
        &self,
        batch: usize,
        dec_len: usize,
        enc_len: usize,
        step: Step,
        provided: ArrayView2<'_, i64>,
    ) -> Result<Array3<f64>> {
        let (p_batch, p_len) = provided.dim();
        if p_batch != batch {
            return Err(Error::ShapeMismatch {
                what: "alignment batch",
                expected: batch,
                got: p_batch,
            });
        }

        match step {
            Step::All if p_len < dec_len => {
                return Err(Error::AlignmentTooShort {
                    needed: dec_len,
                    got: p_len,
                });
            }
            Step::At(_) if dec_len != 1 => {
                return Err(Error::ShapeMismatch {
                    what: "decoder steps in single-step mode",
                    expected: 1,
                    got: dec_len,
                });
            }
            Step::At(s) if s >= p_len => {
                return Err(Error::StepOutOfRange { step: s, len: p_len });
            }
            _ => {}
        }
        // Column of `provided` feeding decoder row `t`.
        let column = |t: usize| match step {
            Step::All => t,
            Step::At(s) => s,
        };

        let mut scores = Array3::from_elem((batch, dec_len, enc_len), f64::NEG_INFINITY);
        for b in 0..batch {
            for t in 0..dec_len {
                let raw = provided[[b, column(t)]];
                let index = if raw == self.pad { 0 } else { raw };
                if index < 0 || index as usize >= enc_len {
                    return Err(Error::IndexOutOfRange {
                        batch: b,
                        step: t,
                        index: raw,
                        enc_len,
                    });
                }
                scores[[b, t, index as usize]] = ALIGNED_SCORE;
            }
        }
        Ok(scores)
    }
}
