//! Vector similarity utilities.
//!
//! Cosine similarity, top-K neighbor retrieval over in-memory embedding
//! sets, and the little-endian f32 BLOB codec used for SQLite storage.

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Indices and similarities of the `k` nearest neighbors of `embeddings[of]`,
/// most similar first. The query itself and entries without a vector
/// (empty slices) are excluded.
pub fn top_k_neighbors(embeddings: &[&[f32]], of: usize, k: usize) -> Vec<(usize, f32)> {
    let query = embeddings[of];
    if query.is_empty() || k == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(usize, f32)> = embeddings
        .iter()
        .enumerate()
        .filter(|(i, e)| *i != of && !e.is_empty())
        .map(|(i, e)| (i, cosine_similarity(query, e)))
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
