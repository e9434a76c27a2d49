use super::sequence::Token;

/// Convert raw logits into a probability distribution.
///
/// The maximum is subtracted before exponentiating so large logits do not
/// overflow. Accumulation happens in `f64`.
pub fn softmax(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }

    let max = values
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max) as f64;

    let exps: Vec<f64> = values.iter().map(|&v| (v as f64 - max).exp()).collect();
    let sum: f64 = exps.iter().sum();

    exps.into_iter().map(|e| (e / sum) as f32).collect()
}

/// Return the `k` most probable entries, highest first.
///
/// Each entry carries its original index as the token id. Equal scores keep
/// their original index order.
pub fn top_k(probabilities: &[f32], k: usize) -> Vec<Token> {
    let mut ranked: Vec<Token> = probabilities
        .iter()
        .enumerate()
        .map(|(id, &score)| Token {
            id: id as u32,
            score,
        })
        .collect();

    // sort_by is stable, ties stay in index order
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(k);
    ranked
}
