//! Attention with optional hard guidance for sequence-to-sequence training.
//!
//! Four pieces, leaves first:
//! - [`field`]: parses alignment annotations into index tensors;
//! - [`hard_guidance`]: turns alignment indices into pre-softmax attention scores;
//! - [`attention`]: attention layer dispatching to `dot`, `mlp` or `hard` scoring;
//! - [`loss`] and [`trainer`]: attention loss and a trainer that threads alignment
//!   targets from the batch to the losses.
//!
//! Public invariants (must not change):
//! - Tensors are batch-first `ndarray` arrays (`f64` states, `i64` indices).
//! - Numeric code is deterministic (no RNG in core ops).
//! - Every hard-guidance score row has exactly one finite entry; padding
//!   alignments (`-1` unless configured) attend to encoder position 0.
//! - Malformed alignment tokens never fail parsing; they become `ignore_index`.

pub mod attention;
pub mod field;
pub mod hard_guidance;
pub mod loss;
pub mod trainer;

pub use attention::{Attention, AttentionConfig, Guidance, Method};
pub use field::{AlignmentField, FieldOptions, FieldWarning, DEFAULT_IGNORE_INDEX};
pub use hard_guidance::{HardGuidance, Step};
pub use loss::{AttentionLoss, Loss, LossAccumulator};
pub use trainer::{
    AttentionTrainer, Batch, BatchData, GetBatchData, ModelOutput, Seq2Seq, TargetVariables,
    TrainerConfig,
};
