use crate::error::{PipelineError, Result};
use crate::index::{ChunkMeta, RestaurantIndex};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const INDEX_FORMAT_VERSION: u32 = 1;
const INDEX_SUFFIX: &str = ".index.json";

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    version: u32,
    restaurant_id: String,
    model: String,
    dim: usize,
    built_at: DateTime<Utc>,
    source_chunk_count: usize,
    vectors: Vec<Vec<f32>>,
    metadata: Vec<ChunkMeta>,
}

/// Turns a restaurant id into something safe to use as a filename.
/// Ids that sanitize to nothing fall back to "default".
fn sanitize_id(restaurant_id: &str) -> String {
    let trimmed = restaurant_id.trim();
    if trimmed.is_empty() {
        return "default".to_string();
    }
    let sanitized: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.chars().all(|c| c == '_') {
        "default".to_string()
    } else {
        sanitized
    }
}

/// One JSON artifact per restaurant under a single directory. Saves are
/// whole-index replacements through a temp file and rename, so readers
/// only ever observe the previous index or the new one, never a partial
/// write.
pub struct IndexStore {
    root: PathBuf,
    flat_index_max_chunks: usize,
}

impl IndexStore {
    pub fn new(root: impl Into<PathBuf>, flat_index_max_chunks: usize) -> Self {
        Self {
            root: root.into(),
            flat_index_max_chunks,
        }
    }

    pub(crate) fn artifact_path(&self, restaurant_id: &str) -> PathBuf {
        self.root
            .join(format!("{}{INDEX_SUFFIX}", sanitize_id(restaurant_id)))
    }

    pub fn exists(&self, restaurant_id: &str) -> bool {
        self.artifact_path(restaurant_id).exists()
    }

    pub async fn save(&self, index: &RestaurantIndex) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        let final_path = self.artifact_path(&index.restaurant_id);
        let temp_path = final_path.with_extension("json.tmp");

        let state = PersistedIndex {
            version: INDEX_FORMAT_VERSION,
            restaurant_id: index.restaurant_id.clone(),
            model: index.model.clone(),
            dim: index.dim,
            built_at: index.built_at,
            source_chunk_count: index.source_chunk_count,
            vectors: index.vectors().to_vec(),
            metadata: index.metadata().to_vec(),
        };
        let data = serde_json::to_string_pretty(&state)?;

        // temp file then rename keeps the swap atomic
        tokio::fs::write(&temp_path, data).await?;
        tokio::fs::rename(&temp_path, &final_path).await?;

        debug!(
            restaurant_id = %index.restaurant_id,
            chunks = index.len(),
            path = %final_path.display(),
            "saved index"
        );
        Ok(())
    }

    pub async fn load(&self, restaurant_id: &str) -> Result<RestaurantIndex> {
        let path = self.artifact_path(restaurant_id);
        if !path.exists() {
            return Err(PipelineError::IndexNotFound(restaurant_id.to_string()));
        }

        let data = tokio::fs::read_to_string(&path).await?;
        let state: PersistedIndex = serde_json::from_str(&data).map_err(|err| {
            PipelineError::CorruptIndex {
                restaurant_id: restaurant_id.to_string(),
                reason: format!("unparseable artifact: {err}"),
            }
        })?;

        Self::verify(restaurant_id, &state)?;

        Ok(RestaurantIndex::from_parts(
            state.restaurant_id,
            state.model,
            state.dim,
            state.built_at,
            state.vectors,
            state.metadata,
            self.flat_index_max_chunks,
        ))
    }

    fn verify(restaurant_id: &str, state: &PersistedIndex) -> Result<()> {
        let corrupt = |reason: String| PipelineError::CorruptIndex {
            restaurant_id: restaurant_id.to_string(),
            reason,
        };

        if state.version != INDEX_FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {}",
                state.version
            )));
        }
        if state.vectors.len() != state.metadata.len() {
            return Err(corrupt(format!(
                "{} vectors but {} metadata rows",
                state.vectors.len(),
                state.metadata.len()
            )));
        }
        if state.source_chunk_count != state.metadata.len() {
            return Err(corrupt(format!(
                "recorded chunk count {} disagrees with stored rows {}",
                state.source_chunk_count,
                state.metadata.len()
            )));
        }
        if state.metadata.is_empty() {
            return Err(corrupt("artifact holds no chunks".to_string()));
        }
        if let Some(bad) = state.vectors.iter().find(|v| v.len() != state.dim) {
            return Err(corrupt(format!(
                "vector of dimension {} in an index of dimension {}",
                bad.len(),
                state.dim
            )));
        }
        Ok(())
    }

    /// Removes a restaurant's artifact. Returns whether anything was
    /// there to remove.
    pub async fn invalidate(&self, restaurant_id: &str) -> Result<bool> {
        let path = self.artifact_path(restaurant_id);
        if !path.exists() {
            return Ok(false);
        }
        tokio::fs::remove_file(&path).await?;
        info!(restaurant_id, "invalidated index");
        Ok(true)
    }

    /// Lists the sanitized restaurant ids with a saved index.
    pub async fn list(&self) -> Result<Vec<String>> {
        if !Path::new(&self.root).exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_suffix(INDEX_SUFFIX) {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexBuilder;
    use crate::normalizer::Chunk;
    use std::collections::HashMap;

    fn sample_index(restaurant_id: &str) -> RestaurantIndex {
        let chunks = vec![
            Chunk {
                chunk_id: "c0".to_string(),
                restaurant_id: restaurant_id.to_string(),
                review_id: "r1".to_string(),
                text: "the pad thai was outstanding".to_string(),
                token_count: 5,
                position: 0,
            },
            Chunk {
                chunk_id: "c1".to_string(),
                restaurant_id: restaurant_id.to_string(),
                review_id: "r2".to_string(),
                text: "service was glacial on a tuesday".to_string(),
                token_count: 6,
                position: 0,
            },
        ];
        let stars = HashMap::from([("r1".to_string(), 5.0f32), ("r2".to_string(), 2.0f32)]);
        IndexBuilder::new(2048)
            .build(
                restaurant_id,
                "nomic-embed-text",
                &chunks,
                &stars,
                vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]],
            )
            .unwrap()
    }

    #[test]
    fn ids_sanitize_to_safe_filenames() {
        assert_eq!(sanitize_id("abc-123_X"), "abc-123_X");
        assert_eq!(sanitize_id("a/b:c d"), "a_b_c_d");
        assert_eq!(sanitize_id("   "), "default");
        assert_eq!(sanitize_id("///"), "default");
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path(), 2048);
        let index = sample_index("biz-1");
        store.save(&index).await.unwrap();

        let loaded = store.load("biz-1").await.unwrap();
        assert_eq!(loaded.restaurant_id, "biz-1");
        assert_eq!(loaded.model, "nomic-embed-text");
        assert_eq!(loaded.source_chunk_count, 2);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.metadata(), index.metadata());
        assert!(!loaded.uses_ann());

        // no temp file left behind
        let leftover = store.artifact_path("biz-1").with_extension("json.tmp");
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn loading_an_unknown_restaurant_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path(), 2048);
        let err = store.load("never-built").await.unwrap_err();
        assert!(matches!(err, PipelineError::IndexNotFound(ref id) if id == "never-built"));
    }

    #[tokio::test]
    async fn tampered_chunk_count_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path(), 2048);
        store.save(&sample_index("biz-1")).await.unwrap();

        let path = store.artifact_path("biz-1");
        let raw = std::fs::read_to_string(&path).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        value["source_chunk_count"] = serde_json::json!(9);
        std::fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();

        let err = store.load("biz-1").await.unwrap_err();
        assert!(matches!(err, PipelineError::CorruptIndex { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn garbage_artifact_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path(), 2048);
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        std::fs::write(store.artifact_path("biz-1"), "not json at all {").unwrap();

        let err = store.load("biz-1").await.unwrap_err();
        match err {
            PipelineError::CorruptIndex { restaurant_id, .. } => {
                assert_eq!(restaurant_id, "biz-1")
            }
            other => panic!("expected CorruptIndex, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalidate_removes_the_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path(), 2048);
        store.save(&sample_index("biz-1")).await.unwrap();
        assert!(store.exists("biz-1"));

        assert!(store.invalidate("biz-1").await.unwrap());
        assert!(!store.exists("biz-1"));
        assert!(!store.invalidate("biz-1").await.unwrap());
    }

    #[tokio::test]
    async fn list_reports_saved_restaurants() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path(), 2048);
        assert!(store.list().await.unwrap().is_empty());

        store.save(&sample_index("biz-b")).await.unwrap();
        store.save(&sample_index("biz-a")).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["biz-a", "biz-b"]);
    }

    #[tokio::test]
    async fn awkward_ids_still_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path(), 2048);
        store.save(&sample_index("biz/x:weird")).await.unwrap();
        let loaded = store.load("biz/x:weird").await.unwrap();
        assert_eq!(loaded.restaurant_id, "biz/x:weird");
    }
}
