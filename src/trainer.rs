//! Supervised training with attentive-guidance targets.
//!
//! A [`Batch`] holds the dataset fields of one minibatch by name. The trainer
//! unpacks it into the source sequence, its lengths and a keyed
//! [`TargetVariables`] bundle; the attention target is included only when the
//! batch carries the attention field. The model itself is external and plugs in
//! through [`Seq2Seq`].

use std::collections::{BTreeMap, HashMap};

use ndarray::{Array2, Array3, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::attention;
use crate::loss::{self, AttentionLoss, Loss};

/// Target key for the decoder output sequence.
pub const DECODER_OUTPUT: &str = "decoder_output";
/// Target key for the encoder input sequence.
pub const ENCODER_INPUT: &str = "encoder_input";
/// Target key for provided attention.
pub const ATTENTION_TARGET: &str = AttentionLoss::TARGETS;

/// Errors for the training loop.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A required dataset field is absent from the batch.
    #[error("batch has no field `{0}`")]
    MissingField(String),
    /// The source field carries no lengths.
    #[error("batch field `{0}` has no lengths")]
    MissingLengths(String),
    /// The model did not produce an output a loss reads.
    #[error("model produced no output `{0}`")]
    MissingOutput(String),
    /// Model forward pass failed.
    #[error(transparent)]
    Model(#[from] attention::Error),
    /// Loss evaluation failed.
    #[error(transparent)]
    Loss(#[from] loss::Error),
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

/// Trainer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Batches between progress logs; `0` disables them.
    pub print_every: usize,
    /// Dataset field holding the source sequence.
    pub src_field_name: String,
    /// Dataset field holding the target sequence.
    pub tgt_field_name: String,
    /// Dataset field holding provided attention.
    pub attn_field_name: String,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            print_every: 100,
            src_field_name: "src".to_string(),
            tgt_field_name: "tgt".to_string(),
            attn_field_name: "attn".to_string(),
        }
    }
}

/// One minibatch of numericalized dataset fields, batch-first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    fields: HashMap<String, Array2<i64>>,
    lengths: HashMap<String, Vec<usize>>,
}

impl Batch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field.
    pub fn with_field(mut self, name: impl Into<String>, values: Array2<i64>) -> Self {
        self.fields.insert(name.into(), values);
        self
    }

    /// Add a field together with per-example lengths.
    pub fn with_lengths(
        mut self,
        name: impl Into<String>,
        values: Array2<i64>,
        lengths: Vec<usize>,
    ) -> Self {
        let name = name.into();
        self.lengths.insert(name.clone(), lengths);
        self.fields.insert(name, values);
        self
    }

    /// Field by name.
    pub fn get(&self, name: &str) -> Option<&Array2<i64>> {
        self.fields.get(name)
    }

    /// Lengths of a field, if it has them.
    pub fn lengths(&self, name: &str) -> Option<&[usize]> {
        self.lengths.get(name).map(Vec::as_slice)
    }

    /// Whether the batch carries `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

/// Targets of one batch, keyed by the name losses and metrics look them up by.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetVariables(BTreeMap<String, Array2<i64>>);

impl TargetVariables {
    /// Insert or replace a target.
    pub fn insert(&mut self, key: impl Into<String>, values: Array2<i64>) {
        self.0.insert(key.into(), values);
    }

    /// Target by key.
    pub fn get(&self, key: &str) -> Option<&Array2<i64>> {
        self.0.get(key)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Everything a training step reads from a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchData {
    /// Source sequence, `(batch, src_len)`.
    pub inputs: Array2<i64>,
    /// Unpadded source lengths.
    pub input_lengths: Vec<usize>,
    /// Keyed targets.
    pub targets: TargetVariables,
}

/// Unpacks a [`Batch`] for a training step.
pub trait GetBatchData {
    /// Split `batch` into inputs, input lengths and targets.
    fn get_batch_data(&self, batch: &Batch) -> Result<BatchData>;
}

/// Named model outputs of one forward pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOutput(BTreeMap<String, Array3<f64>>);

impl ModelOutput {
    /// Insert or replace an output.
    pub fn insert(&mut self, key: impl Into<String>, values: Array3<f64>) {
        self.0.insert(key.into(), values);
    }

    /// Output by key.
    pub fn get(&self, key: &str) -> Option<&Array3<f64>> {
        self.0.get(key)
    }
}

/// Sequence-to-sequence model driven by the trainer.
pub trait Seq2Seq {
    /// Run one forward pass. Per-step attention weights go under
    /// [`AttentionLoss::INPUTS`] as `(batch, steps, src_len)`.
    fn forward(
        &mut self,
        inputs: ArrayView2<'_, i64>,
        input_lengths: &[usize],
        targets: &TargetVariables,
    ) -> attention::Result<ModelOutput>;
}

/// Trainer that threads provided attention from the batch to its losses.
pub struct AttentionTrainer {
    config: TrainerConfig,
    losses: Vec<Box<dyn Loss>>,
    steps: usize,
}

impl std::fmt::Debug for AttentionTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.losses.iter().map(|l| l.short_name()).collect();
        f.debug_struct("AttentionTrainer")
            .field("config", &self.config)
            .field("losses", &names)
            .field("steps", &self.steps)
            .finish()
    }
}

impl Default for AttentionTrainer {
    fn default() -> Self {
        let losses: Vec<Box<dyn Loss>> = vec![Box::new(AttentionLoss::default())];
        Self::new(TrainerConfig::default(), losses)
    }
}

impl AttentionTrainer {
    /// Trainer evaluating `losses` on every batch.
    pub fn new(config: TrainerConfig, losses: Vec<Box<dyn Loss>>) -> Self {
        Self {
            config,
            losses,
            steps: 0,
        }
    }

    /// Batches trained so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    fn progress_due(&self) -> bool {
        self.config.print_every > 0 && self.steps % self.config.print_every == 0
    }

    /// Configuration.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Losses evaluated per batch.
    pub fn losses(&self) -> &[Box<dyn Loss>] {
        &self.losses
    }

    /// Run `model` on `batch` and evaluate every loss.
    ///
    /// Losses are reset first. A loss whose target is absent from the batch is
    /// skipped. Returns `(short_name, loss)` for each loss evaluated.
    pub fn train_batch<M: Seq2Seq + ?Sized>(
        &mut self,
        model: &mut M,
        batch: &Batch,
    ) -> Result<Vec<(&'static str, f64)>> {
        let data = self.get_batch_data(batch)?;
        let output = model.forward(data.inputs.view(), &data.input_lengths, &data.targets)?;

        let mut values = Vec::with_capacity(self.losses.len());
        for loss in &mut self.losses {
            loss.reset();
            let Some(targets) = data.targets.get(loss.targets()) else {
                tracing::debug!(loss = loss.short_name(), "no `{}` in batch, skipping", loss.targets());
                continue;
            };
            let outputs = output
                .get(loss.inputs())
                .ok_or_else(|| Error::MissingOutput(loss.inputs().to_string()))?;
            loss.eval_batch(outputs.view(), targets.view())?;
            let value = loss.get_loss();
            tracing::debug!(loss = loss.short_name(), value, "batch loss");
            values.push((loss.short_name(), value));
        }

        self.steps += 1;
        if self.progress_due() {
            let summary: Vec<String> = values.iter().map(|(name, v)| format!("{name} {v:.4}")).collect();
            tracing::info!(step = self.steps, "progress: {}", summary.join(", "));
        }
        Ok(values)
    }
}

impl GetBatchData for AttentionTrainer {
    fn get_batch_data(&self, batch: &Batch) -> Result<BatchData> {
        let src = &self.config.src_field_name;
        let tgt = &self.config.tgt_field_name;
        let attn = &self.config.attn_field_name;

        let inputs = batch
            .get(src)
            .ok_or_else(|| Error::MissingField(src.clone()))?;
        let input_lengths = batch
            .lengths(src)
            .ok_or_else(|| Error::MissingLengths(src.clone()))?;
        let decoder_output = batch
            .get(tgt)
            .ok_or_else(|| Error::MissingField(tgt.clone()))?;

        let mut targets = TargetVariables::default();
        targets.insert(DECODER_OUTPUT, decoder_output.clone());
        // Metrics over the input (e.g. k-grammar) read it from the targets.
        targets.insert(ENCODER_INPUT, inputs.clone());
        if let Some(attention_target) = batch.get(attn) {
            targets.insert(ATTENTION_TARGET, attention_target.clone());
        }

        Ok(BatchData {
            inputs: inputs.clone(),
            input_lengths: input_lengths.to_vec(),
            targets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::{Attention, Guidance};
    use crate::hard_guidance::Step;
    use ndarray::{array, s, Array3};

    /// Encoder states are one-hot per source position; attention follows
    /// provided alignments when present and dot products otherwise.
    struct OneHotModel {
        attention: Attention,
        guided: Attention,
    }

    impl OneHotModel {
        fn new() -> Self {
            Self {
                attention: Attention::new(0, "dot").unwrap(),
                guided: Attention::new(0, "hard").unwrap(),
            }
        }
    }

    impl Seq2Seq for OneHotModel {
        fn forward(
            &mut self,
            inputs: ArrayView2<'_, i64>,
            _input_lengths: &[usize],
            targets: &TargetVariables,
        ) -> attention::Result<ModelOutput> {
            let (batch, src_len) = inputs.dim();
            let steps = targets.get(DECODER_OUTPUT).map_or(0, |t| t.ncols() - 1);
            let enc = Array3::from_shape_fn((batch, src_len, src_len), |(_, i, j)| {
                if i == j {
                    1.0
                } else {
                    0.0
                }
            });
            let dec = Array3::zeros((batch, steps, src_len));
            let (_, attn) = match targets.get(ATTENTION_TARGET) {
                Some(provided) => {
                    // Decoder step `s` predicts target `s + 1`.
                    let guidance = Guidance {
                        step: Step::All,
                        provided: provided.slice(s![.., 1..]),
                    };
                    self.guided.forward(dec.view(), enc.view(), Some(guidance))?
                }
                None => self.attention.forward(dec.view(), enc.view(), None)?,
            };
            let mut out = ModelOutput::default();
            out.insert(AttentionLoss::INPUTS, attn);
            Ok(out)
        }
    }

    fn batch(with_attention: bool) -> Batch {
        let b = Batch::new()
            .with_lengths("src", array![[4i64, 5, 6], [7, 8, 0]], vec![3, 2])
            .with_field("tgt", array![[1i64, 9, 9, 2], [1, 9, 2, 0]]);
        if with_attention {
            b.with_field("attn", array![[-1i64, 0, 2, 1], [-1, 1, 0, -1]])
        } else {
            b
        }
    }

    #[test]
    fn batch_data_includes_attention_target_when_present() {
        let trainer = AttentionTrainer::default();
        let data = trainer.get_batch_data(&batch(true)).unwrap();
        assert_eq!(data.input_lengths, vec![3, 2]);
        assert_eq!(
            data.targets.keys().collect::<Vec<_>>(),
            vec![ATTENTION_TARGET, DECODER_OUTPUT, ENCODER_INPUT]
        );
        assert_eq!(data.targets.get(ENCODER_INPUT), Some(&data.inputs));
    }

    #[test]
    fn missing_attention_field_is_tolerated() {
        let trainer = AttentionTrainer::default();
        let data = trainer.get_batch_data(&batch(false)).unwrap();
        assert!(!data.targets.contains(ATTENTION_TARGET));
        assert!(data.targets.contains(DECODER_OUTPUT));
    }

    #[test]
    fn missing_source_or_lengths_is_an_error() {
        let trainer = AttentionTrainer::default();
        let no_src = Batch::new().with_field("tgt", array![[1i64]]);
        assert_eq!(
            trainer.get_batch_data(&no_src),
            Err(Error::MissingField("src".into()))
        );
        let no_lengths = Batch::new()
            .with_field("src", array![[1i64]])
            .with_field("tgt", array![[1i64]]);
        assert_eq!(
            trainer.get_batch_data(&no_lengths),
            Err(Error::MissingLengths("src".into()))
        );
    }

    #[test]
    fn custom_field_names_are_honored() {
        let config: TrainerConfig =
            serde_json::from_str(r#"{"src_field_name": "query", "attn_field_name": "align"}"#).unwrap();
        assert_eq!(config.tgt_field_name, "tgt");
        assert_eq!(config.print_every, 100);
        let trainer = AttentionTrainer::new(config, Vec::new());
        let b = Batch::new()
            .with_lengths("query", array![[3i64]], vec![1])
            .with_field("tgt", array![[1i64, 2]])
            .with_field("align", array![[-1i64, 0]]);
        let data = trainer.get_batch_data(&b).unwrap();
        assert_eq!(data.targets.get(ATTENTION_TARGET), Some(&array![[-1i64, 0]]));
    }

    #[test]
    fn guided_model_has_near_zero_attention_loss() {
        let mut trainer = AttentionTrainer::default();
        let mut model = OneHotModel::new();
        let values = trainer.train_batch(&mut model, &batch(true)).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].0, "attn_loss");
        assert!(values[0].1.abs() < 1e-12, "loss={}", values[0].1);
    }

    #[test]
    fn losses_without_targets_are_skipped() {
        let mut trainer = AttentionTrainer::default();
        let mut model = OneHotModel::new();
        let values = trainer.train_batch(&mut model, &batch(false)).unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn progress_is_logged_every_print_every_batches() {
        let config = TrainerConfig {
            print_every: 2,
            ..TrainerConfig::default()
        };
        let losses: Vec<Box<dyn Loss>> = vec![Box::new(AttentionLoss::default())];
        let mut trainer = AttentionTrainer::new(config, losses);
        let mut model = OneHotModel::new();
        let mut due = Vec::new();
        for _ in 0..4 {
            trainer.train_batch(&mut model, &batch(true)).unwrap();
            due.push(trainer.progress_due());
        }
        assert_eq!(trainer.steps(), 4);
        assert_eq!(due, vec![false, true, false, true]);

        let config = TrainerConfig {
            print_every: 0,
            ..TrainerConfig::default()
        };
        let mut quiet = AttentionTrainer::new(config, Vec::new());
        quiet.train_batch(&mut model, &batch(true)).unwrap();
        assert!(!quiet.progress_due());
    }

    #[test]
    fn failed_batches_are_not_counted() {
        let mut trainer = AttentionTrainer::default();
        let mut model = OneHotModel::new();
        assert!(trainer.train_batch(&mut model, &Batch::new()).is_err());
        assert_eq!(trainer.steps(), 0);
    }

    #[test]
    fn losses_are_reset_per_batch() {
        let mut trainer = AttentionTrainer::default();
        let mut model = OneHotModel::new();
        trainer.train_batch(&mut model, &batch(true)).unwrap();
        trainer.train_batch(&mut model, &batch(true)).unwrap();
        assert!(trainer.losses()[0].get_loss().abs() < 1e-12);
        assert!(format!("{trainer:?}").contains("attn_loss"));
    }
}
