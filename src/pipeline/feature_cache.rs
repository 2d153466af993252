//! Manual feature cache.
//!
//! Keyed by manual content hash. Concurrent lookups for the same hash share
//! one extraction (moka's `try_get_with`); failed extractions are handed to
//! every waiter and never stored. Entries expire `ttl` after extraction,
//! checked lazily on read. With `persist_dir` set, a miss first looks for a
//! fresh `{hash}.json` record and successful extractions are written back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::noise_filter::Pattern;
use super::stages::ManualJudgment;
use super::types::Manual;

pub const DEFAULT_TTL_SECS: f64 = 86_400.0;
pub const DEFAULT_MAX_ENTRIES: u64 = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("No available endpoint for manual extraction")]
    NoAvailableEndpoint,

    #[error("Manual extraction failed after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// `[cache]` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: f64,
    pub max_entries: u64,
    pub persist_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            max_entries: DEFAULT_MAX_ENTRIES,
            persist_dir: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::try_from_secs_f64(self.ttl_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_TTL_SECS))
    }
}

/// Judgment patterns extracted from one manual. Also the persisted record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualFeatures {
    pub content_hash: String,
    pub keyword_patterns: Vec<Pattern>,
    pub extracted_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    pub judgment: ManualJudgment,
}

impl ManualFeatures {
    pub fn new(content_hash: &str, judgment: ManualJudgment, ttl: Duration) -> Self {
        Self {
            content_hash: content_hash.to_string(),
            keyword_patterns: judgment.keyword_patterns(),
            extracted_at: Utc::now(),
            ttl,
            judgment,
        }
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_ttl(&self) -> Duration {
        let age = (Utc::now() - self.extracted_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.ttl.saturating_sub(age)
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_ttl().is_zero()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// How a lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureSource {
    /// This caller ran the extraction.
    Extracted,
    /// In memory: a plain hit or a coalesced wait on another caller's extraction.
    Cached,
    /// Loaded from a fresh persisted record.
    Persisted,
}

#[derive(Debug, Clone)]
pub struct FeatureLookup {
    pub features: Arc<ManualFeatures>,
    pub source: FeatureSource,
}

/// Entries live for whatever is left of their own TTL.
struct RemainingTtl;

impl Expiry<String, Arc<ManualFeatures>> for RemainingTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<ManualFeatures>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.remaining_ttl())
    }
}

pub struct ManualFeatureCache {
    cache: Cache<String, Arc<ManualFeatures>>,
    ttl: Duration,
    persist_dir: Option<PathBuf>,
}

impl ManualFeatureCache {
    pub fn new(config: CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(RemainingTtl)
            .build();
        Self {
            cache,
            ttl: config.ttl(),
            persist_dir: config.persist_dir,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Features for `manual`, running `extract` only on a miss. Callers racing
    /// on the same hash wait for the single in-flight extraction and share its
    /// outcome; an error is not cached.
    pub fn get_features<F>(
        &self,
        manual: &Manual,
        extract: F,
    ) -> Result<FeatureLookup, Arc<ExtractionError>>
    where
        F: FnOnce(&Manual) -> Result<ManualJudgment, ExtractionError>,
    {
        let mut source = FeatureSource::Cached;
        let hash = manual.content_hash.clone();

        let features = self.cache.try_get_with(hash.clone(), || {
            if let Some(record) = self.load_persisted(&hash) {
                source = FeatureSource::Persisted;
                return Ok(Arc::new(record));
            }

            tracing::info!(manual_hash = %hash, "Extracting manual features");
            source = FeatureSource::Extracted;
            let judgment = extract(manual)?;
            let features = ManualFeatures::new(&hash, judgment, self.ttl);
            self.store_persisted(&features);
            Ok(Arc::new(features))
        });

        match &features {
            Ok(f) => tracing::debug!(
                manual_hash = %hash,
                source = ?source,
                patterns = f.keyword_patterns.len(),
                "Manual features ready"
            ),
            Err(e) => tracing::warn!(manual_hash = %hash, error = %e, "Manual feature extraction failed"),
        }

        features.map(|features| FeatureLookup { features, source })
    }

    pub fn invalidate(&self, content_hash: &str) {
        self.cache.invalidate(content_hash);
    }

    /// Approximate number of live entries.
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_path(dir: &Path, hash: &str) -> PathBuf {
        dir.join(format!("{hash}.json"))
    }

    fn load_persisted(&self, hash: &str) -> Option<ManualFeatures> {
        let path = Self::record_path(self.persist_dir.as_deref()?, hash);
        let bytes = std::fs::read(&path).ok()?;
        let record: ManualFeatures = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable feature record");
                return None;
            }
        };
        if record.content_hash != hash || record.is_expired() {
            tracing::debug!(path = %path.display(), "Ignoring stale feature record");
            return None;
        }
        Some(record)
    }

    fn store_persisted(&self, features: &ManualFeatures) {
        let Some(dir) = self.persist_dir.as_deref() else {
            return;
        };
        let path = Self::record_path(dir, &features.content_hash);
        let result = std::fs::create_dir_all(dir).and_then(|_| {
            let bytes = serde_json::to_vec_pretty(features)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(&path, bytes)
        });
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist feature record");
        }
    }
}
