use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use url::Url;

use crate::source::MediaMetadata;

/// Кэш метаданных с TTL
///
/// Workers consult this before resolving a URL through the provider, so a
/// repeated request within the TTL costs no rate-window budget.
pub struct MetadataCache {
    cache: Cache<String, MediaMetadata>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl MetadataCache {
    /// Создает новый кэш с указанным TTL
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    /// Получает метаданные из кэша или возвращает None если их нет или они устарели
    pub async fn get(&self, url: &Url) -> Option<MediaMetadata> {
        match self.cache.get(url.as_str()).await {
            Some(metadata) => {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                Some(metadata)
            }
            None => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Сохраняет метаданные в кэш
    pub async fn set(&self, url: &Url, metadata: MediaMetadata) {
        self.cache.insert(url.as_str().to_string(), metadata).await;
    }

    /// Получает статистику кэша
    pub async fn stats(&self) -> CacheStats {
        // entry_count is eventually consistent unless pending tasks run first
        self.cache.run_pending_tasks().await;

        let hits = self.hit_count.load(Ordering::Relaxed);
        let misses = self.miss_count.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        CacheStats {
            size: self.cache.entry_count() as usize,
            hits,
            misses,
            hit_rate,
        }
    }

    /// Очищает весь кэш
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        self.hit_count.store(0, Ordering::Relaxed);
        self.miss_count.store(0, Ordering::Relaxed);
        log::info!("Cache cleared");
    }
}

/// Статистика кэша
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}
