//! Embedding math and BLOB encoding.

/// Compute cosine similarity between two vectors.
///
/// Mismatched dimensions or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

/// Scale a vector to unit length. Zero vectors are returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// `keep * old + (1 - keep) * new`, renormalized.
///
/// A dimension change replaces the old vector outright.
pub fn ema_blend(old: &[f32], new: &[f32], keep: f32) -> Vec<f32> {
    let new = normalize(new);
    if old.len() != new.len() {
        return new;
    }
    let blended: Vec<f32> = old
        .iter()
        .zip(&new)
        .map(|(o, n)| keep * o + (1.0 - keep) * n)
        .collect();
    normalize(&blended)
}

/// Serialize embedding to bytes for SQLite BLOB storage.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Deserialize embedding from bytes.
pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_normalize() {
        let v = normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_ema_blend_moves_toward_new() {
        let old = vec![1.0, 0.0];
        let blended = ema_blend(&old, &[0.0, 1.0], 0.8);
        let norm: f32 = blended.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(blended[0] > blended[1]);
        assert!(blended[1] > 0.0);
        // 0.8 / sqrt(0.8^2 + 0.2^2)
        assert!((blended[0] - 0.970_142_5).abs() < 1e-4);
    }

    #[test]
    fn test_ema_blend_dimension_change() {
        let blended = ema_blend(&[1.0, 0.0], &[0.0, 2.0, 0.0], 0.8);
        assert_eq!(blended, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_bytes_round_trip() {
        let v = vec![0.25, -1.5, 3.0];
        assert_eq!(embedding_from_bytes(&embedding_to_bytes(&v)), v);
    }
}
