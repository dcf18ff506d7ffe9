use crate::config::{env_opt, env_or, env_string};
use crate::error::{RagError, Result};
use crate::index::{rank_by_score, validate_entries, IndexEntry, SearchHit, VectorIndex};
use anyhow::Context;
use async_trait::async_trait;
use log::{info, warn};
use qdrant_client::qdrant::{
    CreateCollectionBuilder, Distance, PayloadIncludeSelector, PointStruct, ScrollPointsBuilder,
    SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParams,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const SCROLL_PAGE_SIZE: u32 = 256;

/// Upper bound on points fetched while widening a search past tied scores
const MAX_SEARCH_LIMIT: u64 = 1024;

/// Configuration for Qdrant
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
    /// Drop and recreate the collection at startup, discarding every stored vector
    pub recreate_on_start: bool,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
}

impl QdrantConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(QdrantConfig {
            url: env_string("QDRANT_URL", "http://localhost:6334"),
            api_key: env_opt("QDRANT_API_KEY"),
            collection: env_string("QDRANT_COLLECTION", "chat_documents"),
            recreate_on_start: env_or("QDRANT_RECREATE_ON_START", false)?,
            connect_attempts: env_or("QDRANT_CONNECT_ATTEMPTS", 5u32)?.max(1),
            connect_backoff: Duration::from_secs(env_or("QDRANT_CONNECT_BACKOFF_SECS", 5u64)?),
        })
    }
}

/// Insertion counter stored in each point's `seq` payload field
#[derive(Debug, Default)]
struct SeqCounter(AtomicU64);

impl SeqCounter {
    /// Continue after the largest `seq` already stored
    fn starting_after(max_stored: Option<u64>) -> Self {
        SeqCounter(AtomicU64::new(max_stored.map_or(0, |max| max + 1)))
    }

    /// Reserve `n` consecutive values and return the first
    fn reserve(&self, n: usize) -> u64 {
        self.0.fetch_add(n as u64, Ordering::SeqCst)
    }
}

/// Qdrant-backed vector index over a single shared collection.
///
/// One process writes the collection; `seq` values are only ordered within
/// the writes of a single writer.
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    dims: usize,
    seq: SeqCounter,
}

impl QdrantIndex {
    /// Connect to Qdrant and provision the collection.
    ///
    /// The connection is tried up to `connect_attempts` times with a fixed
    /// `connect_backoff` between attempts; running out of attempts is
    /// fatal for the caller. The collection is created when missing and
    /// kept otherwise, unless `recreate_on_start` asks for a wipe.
    pub async fn connect(config: &QdrantConfig, dims: usize) -> Result<Self> {
        let config_builder = Qdrant::from_url(&config.url);
        let config_builder = if let Some(api_key) = &config.api_key {
            config_builder.api_key(api_key.clone())
        } else {
            config_builder
        };

        let client = config_builder
            .build()
            .context("Failed to build Qdrant client")
            .map_err(RagError::IndexUnavailable)?;

        wait_until_reachable(&client, config).await?;

        let mut index = QdrantIndex {
            client,
            collection: config.collection.clone(),
            dims,
            seq: SeqCounter::default(),
        };
        index
            .provision(config.recreate_on_start)
            .await
            .map_err(RagError::IndexUnavailable)?;

        // Resume insertion order after whatever the collection already holds
        let max_stored = index
            .max_stored_seq()
            .await
            .map_err(RagError::IndexUnavailable)?;
        index.seq = SeqCounter::starting_after(max_stored);

        Ok(index)
    }

    async fn provision(&self, recreate: bool) -> anyhow::Result<()> {
        let exists = self
            .client
            .collection_exists(self.collection.clone())
            .await
            .with_context(|| format!("Failed to check collection {}", self.collection))?;

        if exists && recreate {
            warn!(
                "Recreating collection {}; previously ingested documents are discarded",
                self.collection
            );
            self.client
                .delete_collection(self.collection.clone())
                .await
                .with_context(|| format!("Failed to delete collection {}", self.collection))?;
        } else if exists {
            info!("Using existing collection {}", self.collection);
            return Ok(());
        }

        let create_collection =
            CreateCollectionBuilder::new(self.collection.clone()).vectors_config(VectorParams {
                size: self.dims as u64,
                distance: Distance::Cosine.into(),
                ..Default::default()
            });

        self.client
            .create_collection(create_collection)
            .await
            .with_context(|| format!("Failed to create collection {}", self.collection))?;

        info!(
            "Created collection {} ({} dimensions, cosine)",
            self.collection, self.dims
        );
        Ok(())
    }

    /// Page through every point, reading only the payload `fields`
    async fn scan_payload(
        &self,
        fields: &[&str],
        mut visit: impl FnMut(&HashMap<String, Value>) + Send,
    ) -> anyhow::Result<()> {
        let mut offset = None;

        loop {
            let mut request = ScrollPointsBuilder::new(self.collection.clone())
                .limit(SCROLL_PAGE_SIZE)
                .with_payload(only_fields(fields))
                .with_vectors(false);
            if let Some(offset) = offset.take() {
                request = request.offset(offset);
            }

            let page = self
                .client
                .scroll(request)
                .await
                .with_context(|| format!("Failed to scroll collection {}", self.collection))?;

            for point in &page.result {
                visit(&point.payload);
            }

            match page.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        Ok(())
    }

    async fn max_stored_seq(&self) -> anyhow::Result<Option<u64>> {
        let mut max: Option<u64> = None;
        self.scan_payload(&["seq"], |payload| {
            if let Some(seq) = payload.get("seq").and_then(|v| v.as_integer()) {
                max = max.max(Some(seq as u64));
            }
        })
        .await?;
        Ok(max)
    }
}

async fn wait_until_reachable(client: &Qdrant, config: &QdrantConfig) -> Result<()> {
    let mut last_error = None;

    for attempt in 1..=config.connect_attempts {
        match client.list_collections().await {
            Ok(_) => {
                info!("Connected to Qdrant at {}", config.url);
                return Ok(());
            }
            Err(e) => {
                warn!(
                    "Attempt {}/{}: could not connect to Qdrant at {}: {}",
                    attempt, config.connect_attempts, config.url, e
                );
                last_error = Some(e);
                if attempt < config.connect_attempts {
                    tokio::time::sleep(config.connect_backoff).await;
                }
            }
        }
    }

    let cause = last_error
        .map(anyhow::Error::from)
        .unwrap_or_else(|| anyhow::anyhow!("no connection attempts were made"));
    Err(RagError::IndexUnavailable(cause.context(format!(
        "Qdrant at {} unreachable after {} attempts",
        config.url, config.connect_attempts
    ))))
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<usize> {
        validate_entries(&entries, self.dims)?;
        let total = entries.len();
        if total == 0 {
            return Ok(0);
        }

        // `seq` orders equal-score hits by insertion
        let base_seq = self.seq.reserve(total);

        let mut points = Vec::with_capacity(total);
        for (i, entry) in entries.into_iter().enumerate() {
            let payload = Payload::try_from(json!({
                "text": entry.text,
                "source": entry.source,
                "chunk_id": entry.chunk_id,
                "seq": base_seq + i as u64,
            }))
            .map_err(|e| RagError::UpsertRejected {
                failed: vec![i],
                total,
                reason: format!("invalid payload: {}", e),
            })?;

            points.push(PointStruct::new(
                uuid::Uuid::new_v4().to_string(),
                entry.vector,
                payload,
            ));
        }

        // `wait` makes the batch visible to searches before returning
        self.client
            .upsert_points(UpsertPointsBuilder::new(self.collection.clone(), points).wait(true))
            .await
            .with_context(|| format!("Failed to upsert points in collection {}", self.collection))
            .map_err(RagError::IndexUnavailable)?;

        Ok(total)
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dims {
            return Err(RagError::Embedding(anyhow::anyhow!(
                "query vector has {} dimensions, index expects {}",
                query.len(),
                self.dims
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        // Widen the request while equal scores straddle the top-k cut-off
        let mut limit = k as u64 + 1;
        let points = loop {
            let search_request =
                SearchPointsBuilder::new(self.collection.clone(), query.to_vec(), limit)
                    .with_payload(true);

            let search_response = self
                .client
                .search_points(search_request)
                .await
                .with_context(|| format!("Failed to search collection {}", self.collection))
                .map_err(RagError::IndexUnavailable)?;

            let scores: Vec<f32> = search_response.result.iter().map(|p| p.score).collect();
            if limit >= MAX_SEARCH_LIMIT || !tie_at_cutoff(&scores, k, limit as usize) {
                break search_response.result;
            }
            limit = (limit * 2).min(MAX_SEARCH_LIMIT);
        };

        let ranked: Vec<(u64, SearchHit)> = points
            .into_iter()
            .filter_map(|point| {
                let hit = hit_from_payload(&point.payload, point.score)?;
                let seq = point
                    .payload
                    .get("seq")
                    .and_then(|v| v.as_integer())
                    .map_or(u64::MAX, |v| v as u64);
                Some((seq, hit))
            })
            .collect();

        Ok(order_hits(ranked, k))
    }

    async fn sources(&self) -> Result<Vec<String>> {
        let mut sources: Vec<String> = Vec::new();
        self.scan_payload(&["source"], |payload| {
            if let Some(source) = payload.get("source").and_then(|v| v.as_str()) {
                if !sources.contains(source) {
                    sources.push(source.clone());
                }
            }
        })
        .await
        .map_err(RagError::IndexUnavailable)?;

        Ok(sources)
    }

    async fn count(&self) -> Result<usize> {
        let info = self
            .client
            .collection_info(&self.collection)
            .await
            .with_context(|| format!("Failed to read collection {}", self.collection))
            .map_err(RagError::IndexUnavailable)?;

        Ok(info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or_default() as usize)
    }
}

fn only_fields(fields: &[&str]) -> PayloadIncludeSelector {
    PayloadIncludeSelector {
        fields: fields.iter().map(|f| f.to_string()).collect(),
    }
}

/// True when a full page ends on the same score as the k-th hit, so more
/// equally scored points may lie beyond `limit`
fn tie_at_cutoff(scores: &[f32], k: usize, limit: usize) -> bool {
    if k == 0 || scores.len() < limit || scores.len() <= k {
        return false;
    }
    scores[scores.len() - 1] >= scores[k - 1]
}

/// Order hits by score, earlier insertions first among equals, and keep `k`
fn order_hits(mut ranked: Vec<(u64, SearchHit)>, k: usize) -> Vec<SearchHit> {
    ranked.sort_by_key(|(seq, _)| *seq);
    let mut hits: Vec<SearchHit> = ranked.into_iter().map(|(_, hit)| hit).collect();
    rank_by_score(&mut hits);
    hits.truncate(k);
    hits
}

/// Convert a stored payload back into a search hit; points without text are skipped
fn hit_from_payload(payload: &HashMap<String, Value>, score: f32) -> Option<SearchHit> {
    let text = payload.get("text")?.as_str()?;
    let source = payload
        .get("source")
        .and_then(|v| v.as_str())
        .cloned()
        .unwrap_or_default();
    let chunk_id = payload
        .get("chunk_id")
        .and_then(|v| v.as_integer())
        .map(|v| v as usize)
        .unwrap_or(0);

    Some(SearchHit {
        score,
        source,
        chunk_id,
        text: text.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(value: serde_json::Value) -> HashMap<String, Value> {
        Payload::try_from(value).unwrap().into()
    }

    #[test]
    fn test_hit_from_payload() {
        let stored = payload(json!({
            "text": "Reset the inverter by holding the power button.",
            "source": "manual.pdf",
            "chunk_id": 7,
            "seq": 42,
        }));

        let hit = hit_from_payload(&stored, 0.83).unwrap();
        assert_eq!(hit.source, "manual.pdf");
        assert_eq!(hit.chunk_id, 7);
        assert_eq!(hit.score, 0.83);
        assert!(hit.text.starts_with("Reset the inverter"));
    }

    #[test]
    fn test_hit_without_text_is_skipped() {
        let stored = payload(json!({ "source": "manual.pdf", "chunk_id": 1 }));
        assert!(hit_from_payload(&stored, 0.5).is_none());
    }

    fn hit(text: &str, score: f32) -> SearchHit {
        SearchHit {
            score,
            source: "manual.pdf".to_string(),
            chunk_id: 0,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_order_hits_keeps_insertion_order_among_ties() {
        // arrival order from the server is arbitrary among equal scores
        let ranked = vec![
            (12, hit("third", 0.9)),
            (3, hit("best", 0.95)),
            (10, hit("first", 0.9)),
            (11, hit("second", 0.9)),
        ];

        let texts: Vec<String> = order_hits(ranked, 3).into_iter().map(|h| h.text).collect();
        assert_eq!(texts, vec!["best", "first", "second"]);
    }

    #[test]
    fn test_tie_at_cutoff() {
        // full page whose last score equals the k-th: widen
        assert!(tie_at_cutoff(&[0.9, 0.8, 0.8], 2, 3));
        // last score below the k-th: every tie is already in the page
        assert!(!tie_at_cutoff(&[0.9, 0.8, 0.7], 2, 3));
        // short page: the collection has nothing more
        assert!(!tie_at_cutoff(&[0.9, 0.8], 2, 3));
        assert!(!tie_at_cutoff(&[], 4, 5));
    }

    #[test]
    fn test_scans_request_only_named_fields() {
        assert_eq!(only_fields(&["source"]).fields, vec!["source"]);
        assert_eq!(only_fields(&["seq"]).fields, vec!["seq"]);
    }

    #[test]
    fn test_seq_counter_resumes_after_stored_maximum() {
        let fresh = SeqCounter::starting_after(None);
        assert_eq!(fresh.reserve(3), 0);
        assert_eq!(fresh.reserve(2), 3);
        assert_eq!(fresh.reserve(1), 5);

        let resumed = SeqCounter::starting_after(Some(41));
        assert_eq!(resumed.reserve(10), 42);
        assert_eq!(resumed.reserve(1), 52);
    }

    #[tokio::test]
    async fn test_unreachable_qdrant_is_fatal() {
        let config = QdrantConfig {
            url: "http://127.0.0.1:1".to_string(),
            api_key: None,
            collection: "unreachable".to_string(),
            recreate_on_start: false,
            connect_attempts: 2,
            connect_backoff: Duration::from_millis(10),
        };

        let err = QdrantIndex::connect(&config, 4).await.err().unwrap();
        assert!(matches!(err, RagError::IndexUnavailable(_)));
        assert!(err.to_string().contains("after 2 attempts"));
    }
}
