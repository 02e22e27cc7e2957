// Hearth Agent Engine — Tool Embedding Index
//
// Instead of dumping the whole catalog into every model request, each tool
// gets one embedding vector (keyed by "name: description") and the selector
// scores the user message against them. Vectors are persisted across
// restarts in a single JSON cache file tagged with the embedding provider
// and model; a tag mismatch discards the cache wholesale.
//
// On startup only the uncached remainder is embedded (one batch request),
// so a warm restart needs no embedding traffic at all. The cache file is
// written via temp-file + rename and is never observed half-written.

use crate::atoms::error::EngineResult;
use crate::engine::embedding::EmbeddingClient;
use crate::engine::types::{cosine_similarity, ToolDescriptor};
use base64::Engine as _;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// On-disk cache shape: {provider, model, entries: {canonical_text: base64}}.
/// Entries are little-endian f32 vectors, base64-encoded.
#[derive(Debug, Serialize, Deserialize, Default)]
struct CacheFile {
    provider: String,
    model: String,
    entries: HashMap<String, String>,
}

/// One indexed tool: its canonical text and embedding vector.
struct IndexedTool {
    canonical: String,
    embedding: Vec<f32>,
}

/// In-memory index of the current catalog's tool embeddings.
/// The active set always mirrors the catalog exactly; stale cache entries on
/// disk are harmless and left in place.
pub struct ToolIndex {
    cache_path: PathBuf,
    tools: HashMap<String, IndexedTool>,
    ready: bool,
}

impl ToolIndex {
    pub fn new(cache_path: PathBuf) -> Self {
        ToolIndex { cache_path, tools: HashMap::new(), ready: false }
    }

    /// Whether the index holds embeddings for the current catalog.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Canonical embedding text for a tool.
    pub fn canonical_text(tool: &ToolDescriptor) -> String {
        format!("{}: {}", tool.name, tool.description)
    }

    /// (Re)build the index for `tools`: satisfy from the disk cache, embed
    /// the uncached remainder as one batch, merge the result back to disk.
    ///
    /// Errors only when uncached tools exist and the embedding service is
    /// unreachable — the caller then leaves the index uninitialized and the
    /// selector falls back to keyword matching.
    pub async fn initialize(
        &mut self,
        tools: &[ToolDescriptor],
        client: &EmbeddingClient,
    ) -> EngineResult<()> {
        self.ready = false;
        self.tools.clear();

        let mut cache = self.load_cache(client);

        let mut uncached: Vec<(&ToolDescriptor, String)> = Vec::new();
        for tool in tools {
            let canonical = Self::canonical_text(tool);
            match cache.entries.get(&canonical).and_then(|b64| decode_vector(b64)) {
                Some(vec) => {
                    self.tools.insert(tool.name.clone(), IndexedTool { canonical, embedding: vec });
                }
                None => uncached.push((tool, canonical)),
            }
        }

        let embedded = uncached.len();
        if !uncached.is_empty() {
            let texts: Vec<String> = uncached.iter().map(|(_, c)| c.clone()).collect();
            let vectors = client.embed_batch(&texts).await?;
            for ((tool, canonical), vec) in uncached.into_iter().zip(vectors) {
                cache.entries.insert(canonical.clone(), encode_vector(&vec));
                self.tools.insert(tool.name.clone(), IndexedTool { canonical, embedding: vec });
            }
            self.write_cache(&cache)?;
        }

        self.ready = true;
        info!(
            "[tool-index] Index ready: {} tools ({} from cache, {} embedded)",
            self.tools.len(),
            self.tools.len() - embedded,
            embedded
        );
        Ok(())
    }

    /// Embed `text` and return, for each named tool present in the index,
    /// its cosine similarity. The input embedding is not cached.
    pub async fn score_message(
        &self,
        text: &str,
        names: &[String],
        client: &EmbeddingClient,
    ) -> EngineResult<HashMap<String, f64>> {
        let query = client.embed(text).await?;
        Ok(self.score_with_vector(&query, names))
    }

    /// Score a pre-computed query vector against the named tools.
    pub fn score_with_vector(&self, query: &[f32], names: &[String]) -> HashMap<String, f64> {
        names
            .iter()
            .filter_map(|name| {
                self.tools
                    .get(name)
                    .map(|t| (name.clone(), cosine_similarity(query, &t.embedding)))
            })
            .collect()
    }

    /// Raw embedding for a tool, if indexed. Used by tests and diagnostics.
    pub fn embedding_of(&self, name: &str) -> Option<&[f32]> {
        self.tools.get(name).map(|t| t.embedding.as_slice())
    }

    // ── Disk cache ─────────────────────────────────────────────────────

    /// Load the cache file, discarding it entirely when the provider or
    /// model tag differs from the configured client.
    fn load_cache(&self, client: &EmbeddingClient) -> CacheFile {
        let fresh = CacheFile {
            provider: client.provider().to_string(),
            model: client.model().to_string(),
            entries: HashMap::new(),
        };

        let raw = match std::fs::read_to_string(&self.cache_path) {
            Ok(raw) => raw,
            Err(_) => return fresh,
        };

        match serde_json::from_str::<CacheFile>(&raw) {
            Ok(cache) if cache.provider == fresh.provider && cache.model == fresh.model => cache,
            Ok(cache) => {
                info!(
                    "[tool-index] Cache tag mismatch ({}/{} vs {}/{}) — discarding cache",
                    cache.provider, cache.model, fresh.provider, fresh.model
                );
                fresh
            }
            Err(e) => {
                warn!("[tool-index] Unreadable embedding cache — discarding: {}", e);
                fresh
            }
        }
    }

    /// Atomic cache write: temp file in the same directory, then rename.
    fn write_cache(&self, cache: &CacheFile) -> EngineResult<()> {
        if let Some(parent) = self.cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.cache_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(cache)?)?;
        std::fs::rename(&tmp, &self.cache_path)?;
        Ok(())
    }
}

/// Encode an f32 vector as base64 over its little-endian bytes.
fn encode_vector(vec: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode a base64 little-endian f32 vector. None on any malformed input.
fn decode_vector(b64: &str) -> Option<Vec<f32>> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
    if bytes.len() % 4 != 0 || bytes.is_empty() {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::EngineConfig;

    fn tool(name: &str, description: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    fn unreachable_client() -> EmbeddingClient {
        let mut cfg = EngineConfig::default();
        // Non-routable port: any embed call fails fast, cache-only paths succeed.
        cfg.embedding_url = "http://127.0.0.1:1".into();
        cfg.embedding_model = "test-embed".into();
        cfg.embedding_provider = "test".into();
        EmbeddingClient::new(&cfg)
    }

    fn seed_cache(path: &std::path::Path, entries: &[(&str, Vec<f32>)]) {
        let cache = CacheFile {
            provider: "test".into(),
            model: "test-embed".into(),
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), encode_vector(v)))
                .collect(),
        };
        std::fs::write(path, serde_json::to_vec(&cache).unwrap()).unwrap();
    }

    #[test]
    fn test_vector_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.125, 0.0];
        let decoded = decode_vector(&encode_vector(&v)).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode_vector("not base64 !!!").is_none());
        // 3 bytes is not a whole number of f32s
        let b64 = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        assert!(decode_vector(&b64).is_none());
    }

    #[tokio::test]
    async fn test_initialize_from_cache_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool_embeddings.json");
        let tools = vec![tool("send_email", "Send an email"), tool("web_search", "Search the web")];
        seed_cache(
            &path,
            &[
                ("send_email: Send an email", vec![1.0, 0.0]),
                ("web_search: Search the web", vec![0.0, 1.0]),
            ],
        );

        let mut index = ToolIndex::new(path);
        // Embedding service unreachable — must still succeed from cache alone.
        index.initialize(&tools, &unreachable_client()).await.unwrap();
        assert!(index.is_ready());
        assert_eq!(index.embedding_of("send_email"), Some([1.0f32, 0.0].as_slice()));

        let names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
        let scores = index.score_with_vector(&[1.0, 0.0], &names);
        assert!((scores["send_email"] - 1.0).abs() < 1e-9);
        assert!(scores["web_search"].abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_initialize_fails_soft_when_uncached_and_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool_embeddings.json");
        let tools = vec![tool("send_email", "Send an email")];

        let mut index = ToolIndex::new(path);
        assert!(index.initialize(&tools, &unreachable_client()).await.is_err());
        assert!(!index.is_ready());
    }

    #[tokio::test]
    async fn test_tag_mismatch_discards_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool_embeddings.json");
        // Cache written by a different provider/model
        let stale = CacheFile {
            provider: "other".into(),
            model: "other-embed".into(),
            entries: [("send_email: Send an email".to_string(), encode_vector(&[1.0]))]
                .into_iter()
                .collect(),
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let tools = vec![tool("send_email", "Send an email")];
        let mut index = ToolIndex::new(path);
        // Tag mismatch → entry unusable → needs network → fails soft.
        assert!(index.initialize(&tools, &unreachable_client()).await.is_err());
        assert!(!index.is_ready());
    }

    #[tokio::test]
    async fn test_active_set_mirrors_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool_embeddings.json");
        seed_cache(
            &path,
            &[
                ("send_email: Send an email", vec![1.0, 0.0]),
                ("old_tool: Left the catalog", vec![0.5, 0.5]),
            ],
        );

        let tools = vec![tool("send_email", "Send an email")];
        let mut index = ToolIndex::new(path);
        index.initialize(&tools, &unreachable_client()).await.unwrap();

        // The departed tool's cache entry is harmless but not active.
        assert!(index.embedding_of("old_tool").is_none());
        assert!(index.embedding_of("send_email").is_some());
    }
}
