//! Near-duplicate collapse over a set of feature vectors.
//!
//! The rule is asymmetric by design: only an *earlier* vector can mark a
//! *later* one as a duplicate, so earlier entries always win and are never
//! discarded. This keeps the operation stable (the keep set does not
//! depend on the batch size) and makes a prefixed query vector the highest
//! priority entry when deduplicating search results against the query.

/// Squared Euclidean distance between two equal-length vectors.
#[must_use]
pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vectors must have the same dimension");
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Returns indices of vectors to keep, earliest-wins.
///
/// Vectors are processed in fixed-size batches. For the batch starting at
/// global offset `i`, squared distances are taken between the full vector
/// set and the batch; a pair only counts when the comparison index is
/// strictly below the batch member's global index. Any batch member with
/// at least one such distance below `threshold` is dropped.
///
/// The keep set is idempotent under re-application and independent of
/// `batch_size`, which exists purely to bound the working set of the
/// distance computation.
#[must_use]
pub fn deduplicate(vectors: &[Vec<f32>], threshold: f32, batch_size: usize) -> Vec<usize> {
    debug_assert!(batch_size > 0, "batch size must be positive");

    let n = vectors.len();
    let mut keep = Vec::with_capacity(n);

    let mut start = 0;
    while start < n {
        let end = (start + batch_size).min(n);
        for member in start..end {
            // Only earlier vectors may flag this one.
            let duplicate = vectors[..member]
                .iter()
                .any(|earlier| squared_distance(earlier, &vectors[member]) < threshold);
            if !duplicate {
                keep.push(member);
            }
        }
        start = end;
    }

    keep
}
