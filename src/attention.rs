//! Attention over encoder states with a pluggable scoring method.
//!
//! For decoder states \(d_{b,t}\) and encoder states \(e_{b,j}\), a [`Method`] produces
//! scores \(S_{b,t,j}\). [`Attention::forward`] masks them, normalizes every row with
//! a softmax and returns
//! \[
//! a_{b,t,\cdot} = \operatorname{softmax}(S_{b,t,\cdot}),\qquad
//! c_{b,t} = \sum_j a_{b,t,j}\, e_{b,j}.
//! \]
//!
//! Methods:
//! - `dot`: \(S_{b,t,j} = d_{b,t}\cdot e_{b,j}\);
//! - `mlp`: \(S_{b,t,j} = w_2^\top \operatorname{relu}(W_1 [d_{b,t}; e_{b,j}] + b_1) + b_2\);
//! - `hard`: scores dictated by provided alignments (see [`crate::hard_guidance`]).

use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::hard_guidance::{self, HardGuidance, Step};

/// Errors for attention construction and forward passes.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Method name is not one of `dot`, `mlp`, `hard`.
    #[error("unknown attention method `{0}`")]
    UnknownMethod(String),
    /// The `mlp` method needs a positive feature dimension.
    #[error("invalid dimension {0} for method `mlp`")]
    InvalidDim(usize),
    /// Inputs (or weights) disagree on a dimension.
    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Which dimension disagrees.
        what: &'static str,
        /// Required size.
        expected: usize,
        /// Size that was provided.
        got: usize,
    },
    /// The `hard` method was called without provided alignments.
    #[error("method `hard` requires provided attention")]
    MissingGuidance,
    /// Hard-guidance scoring failed.
    #[error(transparent)]
    Guidance(#[from] hard_guidance::Error),
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

fn check(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::ShapeMismatch {
            what,
            expected,
            got,
        });
    }
    Ok(())
}

/// Configuration for [`Attention::from_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Feature dimension of decoder and encoder states.
    #[serde(default)]
    pub dim: usize,
    /// Method name: `dot`, `mlp` or `hard`.
    pub method: String,
    /// Alignment value `hard` treats as padding; match the field's `ignore_index`.
    #[serde(default = "default_pad")]
    pub ignore_index: i64,
}

fn default_pad() -> i64 {
    hard_guidance::PAD_ALIGNMENT
}

/// Provided alignment for one forward pass.
#[derive(Debug, Clone, Copy)]
pub struct Guidance<'a> {
    /// Decoder steps being scored.
    pub step: Step,
    /// Alignment indices, `(batch, alignment_len)`.
    pub provided: ArrayView2<'a, i64>,
}

/// Dot-product scoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dot;

impl Dot {
    /// `(batch, dec_len, enc_len)` dot-product scores.
    pub fn scores(
        &self,
        decoder_states: ArrayView3<'_, f64>,
        encoder_states: ArrayView3<'_, f64>,
    ) -> Result<Array3<f64>> {
        let (batch, dec_len, hidden) = decoder_states.dim();
        let (enc_batch, enc_len, enc_hidden) = encoder_states.dim();
        check("encoder batch", batch, enc_batch)?;
        check("encoder hidden size", hidden, enc_hidden)?;

        let mut scores = Array3::zeros((batch, dec_len, enc_len));
        for b in 0..batch {
            let d = decoder_states.index_axis(Axis(0), b);
            let e = encoder_states.index_axis(Axis(0), b);
            scores.slice_mut(s![b, .., ..]).assign(&d.dot(&e.t()));
        }
        Ok(scores)
    }
}

/// Two-layer perceptron scoring over concatenated decoder/encoder states.
#[derive(Debug, Clone, PartialEq)]
pub struct Mlp {
    dim: usize,
    /// `(dim, 2 * dim)`; the first `dim` columns act on the decoder state.
    w1: Array2<f64>,
    b1: Array1<f64>,
    w2: Array1<f64>,
    b2: f64,
}

impl Mlp {
    /// Zero-initialized layers (uniform attention until weights are set).
    pub fn new(dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(Error::InvalidDim(dim));
        }
        Ok(Self {
            dim,
            w1: Array2::zeros((dim, 2 * dim)),
            b1: Array1::zeros(dim),
            w2: Array1::zeros(dim),
            b2: 0.0,
        })
    }

    /// Build from explicit weights: `w1` is `(dim, 2 * dim)`, `b1` and `w2` are `(dim,)`.
    pub fn from_weights(w1: Array2<f64>, b1: Array1<f64>, w2: Array1<f64>, b2: f64) -> Result<Self> {
        let (dim, inputs) = w1.dim();
        if dim == 0 {
            return Err(Error::InvalidDim(dim));
        }
        check("mlp input width", 2 * dim, inputs)?;
        check("mlp hidden bias", dim, b1.len())?;
        check("mlp output weights", dim, w2.len())?;
        Ok(Self { dim, w1, b1, w2, b2 })
    }

    /// Feature dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `(batch, dec_len, enc_len)` perceptron scores.
    pub fn scores(
        &self,
        decoder_states: ArrayView3<'_, f64>,
        encoder_states: ArrayView3<'_, f64>,
    ) -> Result<Array3<f64>> {
        let (batch, dec_len, hidden) = decoder_states.dim();
        let (enc_batch, enc_len, enc_hidden) = encoder_states.dim();
        check("encoder batch", batch, enc_batch)?;
        check("decoder hidden size", self.dim, hidden)?;
        check("encoder hidden size", self.dim, enc_hidden)?;

        let w_dec = self.w1.slice(s![.., ..self.dim]);
        let w_enc = self.w1.slice(s![.., self.dim..]);
        let mut scores = Array3::zeros((batch, dec_len, enc_len));
        let mut h = Array1::zeros(self.dim);
        for b in 0..batch {
            // The first layer is linear, so each half is projected once.
            let pd = decoder_states.index_axis(Axis(0), b).dot(&w_dec.t());
            let pe = encoder_states.index_axis(Axis(0), b).dot(&w_enc.t());
            for t in 0..dec_len {
                for j in 0..enc_len {
                    h.assign(&pd.row(t));
                    h += &pe.row(j);
                    h += &self.b1;
                    h.mapv_inplace(|x| x.max(0.0));
                    scores[[b, t, j]] = self.w2.dot(&h) + self.b2;
                }
            }
        }
        Ok(scores)
    }
}

/// Scoring method, selected by name.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    /// Dot product.
    Dot(Dot),
    /// Two-layer perceptron.
    Mlp(Mlp),
    /// Hard attentive guidance.
    Hard(HardGuidance),
}

impl Method {
    /// Look up a method by name. `hard` and `dot` ignore `dim`.
    pub fn from_name(name: &str, dim: usize) -> Result<Self> {
        match name {
            "dot" => Ok(Self::Dot(Dot)),
            "mlp" => Ok(Self::Mlp(Mlp::new(dim)?)),
            "hard" => Ok(Self::Hard(HardGuidance::default())),
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }

    /// Name accepted by [`Self::from_name`].
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dot(_) => "dot",
            Self::Mlp(_) => "mlp",
            Self::Hard(_) => "hard",
        }
    }

    /// Raw (pre-mask, pre-softmax) scores.
    ///
    /// `guidance` is required by `hard` and ignored by the other methods.
    pub fn scores(
        &self,
        decoder_states: ArrayView3<'_, f64>,
        encoder_states: ArrayView3<'_, f64>,
        guidance: Option<Guidance<'_>>,
    ) -> Result<Array3<f64>> {
        match self {
            Self::Dot(m) => m.scores(decoder_states, encoder_states),
            Self::Mlp(m) => m.scores(decoder_states, encoder_states),
            Self::Hard(m) => {
                let g = guidance.ok_or(Error::MissingGuidance)?;
                Ok(m.scores(decoder_states, encoder_states, g.step, g.provided)?)
            }
        }
    }
}

/// Softmax over the last axis, in place.
///
/// A row whose maximum is `-inf` (or NaN) becomes all zeros. A row containing
/// `+inf` splits the mass evenly over its `+inf` entries.
pub fn softmax_last_axis(scores: &mut Array3<f64>) {
    for mut row in scores.lanes_mut(Axis(2)) {
        let m = row.fold(f64::NEG_INFINITY, |acc, &x| acc.max(x));
        if m == f64::INFINITY {
            let count = row.iter().filter(|&&x| x == f64::INFINITY).count() as f64;
            row.mapv_inplace(|x| if x == f64::INFINITY { 1.0 / count } else { 0.0 });
            continue;
        }
        if !m.is_finite() {
            row.fill(0.0);
            continue;
        }
        row.mapv_inplace(|x| (x - m).exp());
        let z = row.sum();
        row /= z;
    }
}

/// Attention layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Attention {
    method: Method,
    /// `(batch, enc_len)`; `true` marks encoder positions that cannot be attended.
    mask: Option<Array2<bool>>,
}

impl Attention {
    /// Build with the method named `method`.
    ///
    /// Fails with [`Error::UnknownMethod`] for names other than `dot`, `mlp`, `hard`.
    pub fn new(dim: usize, method: &str) -> Result<Self> {
        Ok(Self::with_method(Method::from_name(method, dim)?))
    }

    /// Build from a configuration block.
    pub fn from_config(config: &AttentionConfig) -> Result<Self> {
        let method = match Method::from_name(&config.method, config.dim)? {
            Method::Hard(_) => Method::Hard(HardGuidance::with_pad(config.ignore_index)),
            other => other,
        };
        Ok(Self::with_method(method))
    }

    /// Build around an already constructed method.
    pub fn with_method(method: Method) -> Self {
        Self { method, mask: None }
    }

    /// The scoring method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Set the encoder padding mask.
    pub fn set_mask(&mut self, mask: Array2<bool>) {
        self.mask = Some(mask);
    }

    /// Remove the mask.
    pub fn clear_mask(&mut self) {
        self.mask = None;
    }

    /// Current mask.
    pub fn mask(&self) -> Option<&Array2<bool>> {
        self.mask.as_ref()
    }

    /// Attend decoder states over encoder states.
    ///
    /// Returns `(context, attn)`: `context` is `(batch, dec_len, hidden)` and
    /// `attn` is `(batch, dec_len, enc_len)`.
    pub fn forward(
        &self,
        decoder_states: ArrayView3<'_, f64>,
        encoder_states: ArrayView3<'_, f64>,
        guidance: Option<Guidance<'_>>,
    ) -> Result<(Array3<f64>, Array3<f64>)> {
        let mut attn = self.method.scores(decoder_states, encoder_states, guidance)?;
        let (batch, dec_len, enc_len) = attn.dim();

        if let Some(mask) = &self.mask {
            check("mask batch", batch, mask.nrows())?;
            check("mask encoder length", enc_len, mask.ncols())?;
            for b in 0..batch {
                for j in 0..enc_len {
                    if mask[[b, j]] {
                        attn.slice_mut(s![b, .., j]).fill(f64::NEG_INFINITY);
                    }
                }
            }
        }

        softmax_last_axis(&mut attn);

        let hidden = encoder_states.len_of(Axis(2));
        let mut context = Array3::zeros((batch, dec_len, hidden));
        for b in 0..batch {
            let a = attn.index_axis(Axis(0), b);
            let e = encoder_states.index_axis(Axis(0), b);
            context.slice_mut(s![b, .., ..]).assign(&a.dot(&e));
        }
        Ok((context, attn))
    }
}
