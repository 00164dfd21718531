//! Dataset field for attentive-guidance annotations.
//!
//! Each example carries one alignment token per target token: the 0-based
//! position of the encoder state the decoder should attend to at that step.
//! The values are already integers, so no vocabulary is involved:
//!
//! - preprocessing prepends `ignore_index` for the implicit start-of-sequence step;
//! - padding fills short examples with the pad token;
//! - numericalization casts every token to `i64`, substituting `ignore_index`
//!   for anything that is not a base-10 integer literal (the pad token included).
//!
//! The layout is fixed (batch-first, no vocabulary). Options that ask for
//! something else are corrected at construction and reported as [`FieldWarning`]s.

use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Index that marks "no supervision signal" for a position.
pub const DEFAULT_IGNORE_INDEX: i64 = -1;

/// Token used to pad examples shorter than the batch maximum.
pub const DEFAULT_PAD_TOKEN: &str = "<pad>";

/// User-facing options for [`AlignmentField`].
///
/// `batch_first` and `use_vocab` are accepted only so that misconfiguration can
/// be reported; the field always runs batch-first without a vocabulary. Custom
/// processing steps are named (they cannot be honored) and are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldOptions {
    /// Requested batch-first layout. `Some(false)` is overridden.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_first: Option<bool>,
    /// Requested vocabulary lookup. `Some(true)` is overridden.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_vocab: Option<bool>,
    /// Name of a custom preprocessing step. Never applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preprocessing: Option<String>,
    /// Name of a custom postprocessing step. Never applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postprocessing: Option<String>,
    /// Padding token.
    pub pad_token: String,
    /// Pad (and truncate) every example to this length instead of the batch maximum.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_length: Option<usize>,
}

impl Default for FieldOptions {
    fn default() -> Self {
        Self {
            batch_first: None,
            use_vocab: None,
            preprocessing: None,
            postprocessing: None,
            pad_token: DEFAULT_PAD_TOKEN.to_string(),
            fix_length: None,
        }
    }
}

/// An option that was corrected while building an [`AlignmentField`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldWarning {
    /// `batch_first = false` was requested; forced to `true`.
    BatchFirstForced,
    /// `use_vocab = true` was requested; forced to `false`.
    UseVocabForced,
    /// A custom preprocessing step was supplied and ignored.
    PreprocessingIgnored(String),
    /// A custom postprocessing step was supplied and ignored.
    PostprocessingIgnored(String),
}

impl fmt::Display for FieldWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BatchFirstForced => {
                write!(f, "option batch_first has to be set for the attention field; changed to true")
            }
            Self::UseVocabForced => {
                write!(f, "option use_vocab has to be unset for the attention field; changed to false")
            }
            Self::PreprocessingIgnored(name) => {
                write!(f, "no pre-processing allowed for the attention field (ignored `{name}`)")
            }
            Self::PostprocessingIgnored(name) => {
                write!(f, "no post-processing allowed for the attention field (ignored `{name}`)")
            }
        }
    }
}

/// Parser for alignment annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentField {
    ignore_index: i64,
    pad_token: String,
    fix_length: Option<usize>,
    warnings: Vec<FieldWarning>,
}

impl Default for AlignmentField {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORE_INDEX, FieldOptions::default())
    }
}

impl AlignmentField {
    /// Build a field, correcting incompatible options.
    ///
    /// Never fails. Every correction is logged and kept in [`Self::warnings`].
    pub fn new(ignore_index: i64, options: FieldOptions) -> Self {
        let mut warnings = Vec::new();

        if options.batch_first == Some(false) {
            let w = FieldWarning::BatchFirstForced;
            tracing::warn!("{w}");
            warnings.push(w);
        }
        if options.use_vocab == Some(true) {
            let w = FieldWarning::UseVocabForced;
            tracing::warn!("{w}");
            warnings.push(w);
        }
        if let Some(name) = options.preprocessing {
            let w = FieldWarning::PreprocessingIgnored(name);
            tracing::error!("{w}");
            warnings.push(w);
        }
        if let Some(name) = options.postprocessing {
            let w = FieldWarning::PostprocessingIgnored(name);
            tracing::error!("{w}");
            warnings.push(w);
        }

        Self {
            ignore_index,
            pad_token: options.pad_token,
            fix_length: options.fix_length,
            warnings,
        }
    }

    /// Value substituted for the start-of-sequence step, pads and unparseable tokens.
    pub fn ignore_index(&self) -> i64 {
        self.ignore_index
    }

    /// Padding token.
    pub fn pad_token(&self) -> &str {
        &self.pad_token
    }

    /// Always `true`.
    pub fn batch_first(&self) -> bool {
        true
    }

    /// Always `false`.
    pub fn use_vocab(&self) -> bool {
        false
    }

    /// Options corrected at construction.
    pub fn warnings(&self) -> &[FieldWarning] {
        &self.warnings
    }

    /// Split an annotation line on whitespace.
    pub fn tokenize(&self, line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    /// Prepend the start-of-sequence sentinel.
    pub fn preprocess<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<String> {
        let mut out = Vec::with_capacity(tokens.len() + 1);
        out.push(self.ignore_index.to_string());
        out.extend(tokens.iter().map(|t| t.as_ref().to_string()));
        out
    }

    /// Tokenize and preprocess one annotation line.
    pub fn parse_line(&self, line: &str) -> Vec<String> {
        self.preprocess(&self.tokenize(line))
    }

    /// Cast one token, substituting `ignore_index` for absent or non-integer input.
    pub fn cast_token(&self, token: Option<&str>) -> i64 {
        token
            .and_then(|t| t.trim().parse::<i64>().ok())
            .unwrap_or(self.ignore_index)
    }

    /// Parse a raw example into its index sequence, sentinel included.
    ///
    /// The result always has `tokens.len() + 1` entries.
    pub fn parse<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<i64> {
        let mut out = Vec::with_capacity(tokens.len() + 1);
        out.push(self.ignore_index);
        out.extend(tokens.iter().map(|t| self.cast_token(Some(t.as_ref()))));
        out
    }

    /// Length every example of `batch` is padded to.
    fn padded_len<S: AsRef<str>>(&self, batch: &[Vec<S>]) -> usize {
        self.fix_length
            .unwrap_or_else(|| batch.iter().map(Vec::len).max().unwrap_or(0))
    }

    /// Pad preprocessed examples to a common length with the pad token.
    ///
    /// With `fix_length` set, longer examples are truncated.
    pub fn pad<S: AsRef<str>>(&self, batch: &[Vec<S>]) -> Vec<Vec<String>> {
        let len = self.padded_len(batch);
        batch
            .iter()
            .map(|ex| {
                let mut row: Vec<String> =
                    ex.iter().take(len).map(|t| t.as_ref().to_string()).collect();
                row.resize(len, self.pad_token.clone());
                row
            })
            .collect()
    }

    /// Cast a padded batch into a `(batch, len)` index tensor.
    ///
    /// Ragged rows are tolerated: missing cells become `ignore_index`.
    pub fn numericalize<S: AsRef<str>>(&self, padded: &[Vec<S>]) -> Array2<i64> {
        let len = self.padded_len(padded);
        Array2::from_shape_fn((padded.len(), len), |(i, j)| {
            self.cast_token(padded[i].get(j).map(|t| t.as_ref()))
        })
    }

    /// Pad and numericalize a batch of preprocessed examples.
    pub fn process<S: AsRef<str>>(&self, batch: &[Vec<S>]) -> Array2<i64> {
        let padded = self.pad(batch);
        self.numericalize(&padded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_field_has_no_warnings() {
        let field = AlignmentField::default();
        assert!(field.warnings().is_empty());
        assert_eq!(field.ignore_index(), -1);
        assert!(field.batch_first());
        assert!(!field.use_vocab());
    }

    #[test]
    fn incompatible_options_are_corrected_not_rejected() {
        let options = FieldOptions {
            batch_first: Some(false),
            use_vocab: Some(true),
            preprocessing: Some("lowercase".into()),
            postprocessing: Some("reverse".into()),
            ..FieldOptions::default()
        };
        let field = AlignmentField::new(-1, options);
        assert_eq!(
            field.warnings(),
            &[
                FieldWarning::BatchFirstForced,
                FieldWarning::UseVocabForced,
                FieldWarning::PreprocessingIgnored("lowercase".into()),
                FieldWarning::PostprocessingIgnored("reverse".into()),
            ]
        );
        assert!(field.batch_first());
        assert!(!field.use_vocab());
        // Own processing still applies.
        assert_eq!(field.parse(&["3"]), vec![-1, 3]);
    }

    #[test]
    fn compatible_explicit_options_do_not_warn() {
        let options = FieldOptions {
            batch_first: Some(true),
            use_vocab: Some(false),
            ..FieldOptions::default()
        };
        assert!(AlignmentField::new(-1, options).warnings().is_empty());
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: FieldOptions =
            serde_json::from_str(r#"{"batch_first": false, "fix_length": 5}"#).unwrap();
        assert_eq!(options.batch_first, Some(false));
        assert_eq!(options.fix_length, Some(5));
        assert_eq!(options.pad_token, DEFAULT_PAD_TOKEN);
        assert_eq!(options.use_vocab, None);
    }

    #[test]
    fn non_numeric_tokens_become_ignore_index() {
        let field = AlignmentField::new(-7, FieldOptions::default());
        assert_eq!(
            field.parse(&["0", "unknown", "12", "", "1.5", "<pad>", " 4 "]),
            vec![-7, 0, -7, 12, -7, -7, -7, 4]
        );
        assert_eq!(field.cast_token(None), -7);
    }

    #[test]
    fn parse_line_keeps_sentinel_as_string() {
        let field = AlignmentField::default();
        assert_eq!(field.parse_line("0  1\t2"), vec!["-1", "0", "1", "2"]);
    }

    #[test]
    fn process_pads_with_ignore_index() {
        let field = AlignmentField::default();
        let batch = vec![field.parse_line("0 2"), field.parse_line("1")];
        let t = field.process(&batch);
        assert_eq!(t.dim(), (2, 3));
        assert_eq!(t.row(0).to_vec(), vec![-1, 0, 2]);
        assert_eq!(t.row(1).to_vec(), vec![-1, 1, -1]);
    }

    #[test]
    fn fix_length_truncates_and_pads() {
        let options = FieldOptions {
            fix_length: Some(3),
            ..FieldOptions::default()
        };
        let field = AlignmentField::new(-1, options);
        let batch = vec![field.parse_line("0 1 2 3"), field.parse_line("")];
        let t = field.process(&batch);
        assert_eq!(t.dim(), (2, 3));
        assert_eq!(t.row(0).to_vec(), vec![-1, 0, 1]);
        assert_eq!(t.row(1).to_vec(), vec![-1, -1, -1]);
    }

    #[test]
    fn empty_batch_is_empty_tensor() {
        let field = AlignmentField::default();
        let batch: Vec<Vec<String>> = Vec::new();
        assert_eq!(field.process(&batch).dim(), (0, 0));
    }

    proptest! {
        #[test]
        fn parsed_length_is_input_plus_sentinel(
            tokens in prop::collection::vec("[a-z0-9<>-]{0,4}", 0..20),
            ignore in -5i64..0
        ) {
            let field = AlignmentField::new(ignore, FieldOptions::default());
            let parsed = field.parse(&tokens);
            prop_assert_eq!(parsed.len(), tokens.len() + 1);
            prop_assert_eq!(parsed[0], ignore);
        }

        #[test]
        fn numeric_tokens_parse_exactly(values in prop::collection::vec(0i64..10_000, 0..20)) {
            let field = AlignmentField::default();
            let tokens: Vec<String> = values.iter().map(i64::to_string).collect();
            let parsed = field.parse(&tokens);
            prop_assert_eq!(&parsed[1..], &values[..]);
        }

        #[test]
        fn alphabetic_tokens_parse_to_ignore_index(
            tokens in prop::collection::vec("[a-z]{1,6}", 1..10)
        ) {
            let field = AlignmentField::new(-3, FieldOptions::default());
            prop_assert!(field.parse(&tokens).iter().all(|&v| v == -3));
        }
    }
}
