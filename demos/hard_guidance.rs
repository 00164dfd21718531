//! End-to-end example: provided alignments drive attention.
//!
//! Alignment annotations are parsed by the field, turned into hard-guidance
//! scores and normalized by the attention layer. The attention loss then scores
//! the resulting weights against the same annotations (zero by construction),
//! and against dot-product attention for comparison.

use guidedattn::loss::Loss;
use guidedattn::{AlignmentField, Attention, AttentionLoss, Guidance, Step};
use ndarray::{s, Array3};

fn main() {
    let field = AlignmentField::default();
    let lines = ["0 1 1 3", "2 0 unknown"];
    let examples: Vec<Vec<String>> = lines.iter().map(|l| field.parse_line(l)).collect();
    let provided = field.process(&examples);
    println!("provided attention (sentinel first):\n{provided}");

    let (batch, len) = provided.dim();
    let src_len = 4;
    let hidden = 3;
    let steps = len - 1;
    let encoder = Array3::from_shape_fn((batch, src_len, hidden), |(b, j, k)| {
        (b + 1) as f64 * ((j * hidden + k) as f64).sin()
    });
    let decoder = Array3::from_shape_fn((batch, steps, hidden), |(b, t, k)| {
        ((b + t + k) as f64).cos()
    });

    let hard = Attention::new(hidden, "hard").expect("`hard` is a known method");
    let guidance = Guidance {
        step: Step::All,
        provided: provided.slice(s![.., 1..]),
    };
    let (_, guided) = hard
        .forward(decoder.view(), encoder.view(), Some(guidance))
        .expect("alignments are in range");
    println!("hard-guidance weights:\n{guided}");

    // Incremental decoding scores one column at a time.
    let step0 = hard
        .forward(
            decoder.slice(s![.., 0..1, ..]),
            encoder.view(),
            Some(Guidance {
                step: Step::At(0),
                provided: provided.slice(s![.., 1..]),
            }),
        )
        .expect("alignments are in range")
        .1;
    println!("step 0 only:\n{step0}");

    let dot = Attention::new(hidden, "dot").expect("`dot` is a known method");
    let (_, learned) = dot
        .forward(decoder.view(), encoder.view(), None)
        .expect("shapes agree");

    for (label, weights) in [("hard", &guided), ("dot", &learned)] {
        let mut loss = AttentionLoss::default();
        loss.eval_batch(weights.view(), provided.view())
            .expect("one target column per step");
        println!("{} {label} = {:.6}", loss.short_name(), loss.get_loss());
    }
}
