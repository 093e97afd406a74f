use crate::error::{PipelineError, Result};
use crate::normalizer::Chunk;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

const NUM_HYPERPLANES: usize = 32;
const MAX_SINGLE_BIT_NEIGHBORS: usize = 32;
const MAX_TOTAL_NEIGHBORS: usize = 64;
const HYPERPLANE_SEED: u64 = 42;

// ANN candidate pools are oversampled relative to the requested k, then
// exact-scored; the flat path scores everything anyway.
const CANDIDATE_OVERSAMPLE: usize = 5;

pub(crate) struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub(crate) fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    pub(crate) fn next_f32(&mut self) -> f32 {
        let bits = (self.next_u64() >> 32) as u32;
        let value = bits as f32 / u32::MAX as f32;
        value * 2.0 - 1.0
    }
}

/// Normalize a vector to unit length in place. Vectors with a near-zero
/// norm are left unchanged.
pub fn normalize(v: &mut [f32]) {
    let norm_sq: f32 = v.iter().map(|x| x * x).sum();
    if norm_sq > 1e-20 {
        let norm = norm_sq.sqrt();
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Dot product over the shared prefix of two vectors. Equals cosine
/// similarity when both sides are unit length.
#[inline(always)]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    // near-zero norm guard
    const EPSILON: f32 = 1e-10;

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a < EPSILON || norm_b < EPSILON {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }
}

/// Everything retrieval needs to know about a chunk besides its vector.
/// `position` is the chunk's slot in the index and pairs it with the
/// vector stored at the same offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub chunk_id: String,
    pub review_id: String,
    pub text: String,
    pub position: usize,
    pub token_count: usize,
    pub stars: f32,
}

/// Random-hyperplane LSH over chunk positions. Derived from the stored
/// vectors at build/load time and never persisted, so indexes on disk
/// stay portable across tuning changes.
#[derive(Debug)]
pub struct AnnIndex {
    dim: usize,
    hyperplanes: Vec<Vec<f32>>,
    buckets: HashMap<u64, Vec<usize>>,
}

impl AnnIndex {
    fn new(dim: usize) -> Self {
        let mut rng = SimpleRng::new(HYPERPLANE_SEED);
        let mut hyperplanes = Vec::with_capacity(NUM_HYPERPLANES);
        for _ in 0..NUM_HYPERPLANES {
            let mut plane: Vec<f32> = (0..dim).map(|_| rng.next_f32()).collect();
            normalize(&mut plane);
            hyperplanes.push(plane);
        }
        Self {
            dim,
            hyperplanes,
            buckets: HashMap::new(),
        }
    }

    fn insert(&mut self, position: usize, vector: &[f32]) {
        if vector.len() != self.dim {
            tracing::warn!(
                got = vector.len(),
                expected = self.dim,
                "skipping vector with wrong dimension for ann bucket"
            );
            return;
        }
        let hash = self.hash(vector);
        self.buckets.entry(hash).or_default().push(position);
    }

    /// Collects candidate positions from the query's bucket, then from
    /// nearby buckets (1-bit and 2-bit Hamming neighbors), then from any
    /// remaining bucket until `max_candidates` is reached.
    fn candidates(&self, vector: &[f32], max_candidates: usize) -> Vec<usize> {
        if self.buckets.is_empty() || max_candidates == 0 {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        let mut visited = HashSet::new();
        let primary = self.hash(vector);

        self.collect_bucket(primary, &mut candidates, &mut visited, max_candidates);

        if candidates.len() < max_candidates {
            for neighbor in self.neighbor_hashes(primary) {
                if candidates.len() >= max_candidates {
                    break;
                }
                self.collect_bucket(neighbor, &mut candidates, &mut visited, max_candidates);
            }
        }

        if candidates.len() < max_candidates {
            for (hash, bucket) in &self.buckets {
                if candidates.len() >= max_candidates {
                    break;
                }
                if visited.contains(hash) {
                    continue;
                }
                for &position in bucket {
                    if candidates.len() >= max_candidates {
                        break;
                    }
                    candidates.push(position);
                }
            }
        }

        candidates
    }

    fn hash(&self, vector: &[f32]) -> u64 {
        let mut hash = 0u64;
        for (i, plane) in self.hyperplanes.iter().enumerate() {
            if dot_product(vector, plane) >= 0.0 {
                hash |= 1u64 << i;
            }
        }
        hash
    }

    fn collect_bucket(
        &self,
        hash: u64,
        candidates: &mut Vec<usize>,
        visited: &mut HashSet<u64>,
        limit: usize,
    ) {
        if !visited.insert(hash) {
            return;
        }
        if let Some(bucket) = self.buckets.get(&hash) {
            for &position in bucket {
                if candidates.len() >= limit {
                    break;
                }
                candidates.push(position);
            }
        }
    }

    fn neighbor_hashes(&self, hash: u64) -> Vec<u64> {
        let bits = self.hyperplanes.len().min(64);
        let mut neighbors = Vec::new();

        for i in 0..bits {
            if neighbors.len() >= MAX_SINGLE_BIT_NEIGHBORS {
                break;
            }
            neighbors.push(hash ^ (1u64 << i));
        }

        if neighbors.len() < MAX_SINGLE_BIT_NEIGHBORS {
            for i in 0..bits {
                if neighbors.len() >= MAX_TOTAL_NEIGHBORS {
                    break;
                }
                for j in (i + 1)..bits {
                    neighbors.push(hash ^ (1u64 << i) ^ (1u64 << j));
                    if neighbors.len() >= MAX_TOTAL_NEIGHBORS {
                        break;
                    }
                }
            }
        }

        neighbors
    }
}

/// One restaurant's searchable index: unit-length chunk vectors and the
/// metadata row for each, stored at matching offsets. Indexes are built
/// whole and replaced whole; there is no in-place mutation.
#[derive(Debug)]
pub struct RestaurantIndex {
    pub restaurant_id: String,
    pub model: String,
    pub dim: usize,
    pub built_at: DateTime<Utc>,
    pub source_chunk_count: usize,
    vectors: Vec<Vec<f32>>,
    metadata: Vec<ChunkMeta>,
    ann: Option<AnnIndex>,
}

impl RestaurantIndex {
    /// Assembles an index from already-normalized vectors and metadata.
    /// Attaches an ANN structure only past `flat_index_max_chunks`; below
    /// that, searches scan every vector exactly.
    pub(crate) fn from_parts(
        restaurant_id: String,
        model: String,
        dim: usize,
        built_at: DateTime<Utc>,
        vectors: Vec<Vec<f32>>,
        metadata: Vec<ChunkMeta>,
        flat_index_max_chunks: usize,
    ) -> Self {
        let ann = if vectors.len() > flat_index_max_chunks {
            let mut ann = AnnIndex::new(dim);
            for (position, vector) in vectors.iter().enumerate() {
                ann.insert(position, vector);
            }
            Some(ann)
        } else {
            None
        };
        Self {
            restaurant_id,
            model,
            dim,
            built_at,
            source_chunk_count: metadata.len(),
            vectors,
            metadata,
            ann,
        }
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    pub fn uses_ann(&self) -> bool {
        self.ann.is_some()
    }

    pub fn meta(&self, position: usize) -> Option<&ChunkMeta> {
        self.metadata.get(position)
    }

    pub fn metadata(&self) -> &[ChunkMeta] {
        &self.metadata
    }

    pub(crate) fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    /// Returns up to `k` `(position, score)` pairs ordered by descending
    /// similarity, ties broken by ascending position. Scores are cosine
    /// similarity; the result is exact on the flat path and exact-rescored
    /// over an oversampled candidate pool on the ANN path.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        if self.metadata.is_empty() {
            return Err(PipelineError::EmptyIndex(self.restaurant_id.clone()));
        }
        if query.len() != self.dim {
            return Err(PipelineError::DimensionMismatch {
                expected: self.dim,
                got: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut q = query.to_vec();
        normalize(&mut q);

        let mut scored: Vec<(usize, f32)> = match &self.ann {
            Some(ann) => {
                let want = k.saturating_mul(CANDIDATE_OVERSAMPLE).max(k);
                ann.candidates(&q, want)
                    .into_iter()
                    .filter_map(|pos| self.vectors.get(pos).map(|v| (pos, dot_product(&q, v))))
                    .collect()
            }
            None => self
                .vectors
                .iter()
                .enumerate()
                .map(|(pos, v)| (pos, cosine_similarity(&q, v)))
                .collect(),
        };

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

/// Builds a `RestaurantIndex` out of the normalizer's chunks and the
/// gateway's vectors, enforcing the count and dimension contracts.
pub struct IndexBuilder {
    flat_index_max_chunks: usize,
}

impl IndexBuilder {
    pub fn new(flat_index_max_chunks: usize) -> Self {
        Self {
            flat_index_max_chunks,
        }
    }

    pub fn build(
        &self,
        restaurant_id: &str,
        model: &str,
        chunks: &[Chunk],
        stars_by_review: &HashMap<String, f32>,
        mut vectors: Vec<Vec<f32>>,
    ) -> Result<RestaurantIndex> {
        if chunks.is_empty() {
            return Err(PipelineError::EmptyIndex(restaurant_id.to_string()));
        }
        if vectors.len() != chunks.len() {
            return Err(PipelineError::DimensionMismatch {
                expected: chunks.len(),
                got: vectors.len(),
            });
        }

        let dim = vectors[0].len();
        if dim == 0 {
            return Err(PipelineError::DimensionMismatch {
                expected: 1,
                got: 0,
            });
        }
        for vector in &vectors {
            if vector.len() != dim {
                return Err(PipelineError::DimensionMismatch {
                    expected: dim,
                    got: vector.len(),
                });
            }
        }
        for vector in vectors.iter_mut() {
            normalize(vector);
        }

        let metadata: Vec<ChunkMeta> = chunks
            .iter()
            .enumerate()
            .map(|(position, chunk)| ChunkMeta {
                chunk_id: chunk.chunk_id.clone(),
                review_id: chunk.review_id.clone(),
                text: chunk.text.clone(),
                position,
                token_count: chunk.token_count,
                stars: stars_by_review
                    .get(&chunk.review_id)
                    .copied()
                    .unwrap_or(0.0),
            })
            .collect();

        Ok(RestaurantIndex::from_parts(
            restaurant_id.to_string(),
            model.to_string(),
            dim,
            Utc::now(),
            vectors,
            metadata,
            self.flat_index_max_chunks,
        ))
    }
}
