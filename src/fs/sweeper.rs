//! Background Cache Sweeper
//!
//! This module implements a background task that periodically evicts idle
//! file entries from the cache. Without it, a file that is requested once
//! would keep its descriptor and metadata alive forever.
//!
//! ## Design
//!
//! The sweeper runs as a Tokio task and:
//! 1. Sleeps for a configurable interval
//! 2. Wakes up and scans both cache maps
//! 3. Evicts entries that have been idle past the threshold and have no
//!    live readers
//! 4. Logs statistics about the eviction

use crate::fs::cache::FileCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Configuration for the cache sweeper.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Interval between sweeps (default: 1s)
    pub interval: Duration,

    /// How long an entry may sit unused before eviction (default: 10s)
    pub max_idle: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_idle: Duration::from_secs(10),
        }
    }
}

/// A handle to the running cache sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct CacheSweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl CacheSweeper {
    /// Starts the cache sweeper as a background task. The sweeper stops
    /// automatically when the returned handle is dropped.
    pub fn start(cache: Arc<FileCache>, config: SweepConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(cache, config, shutdown_rx));

        info!("File cache sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the sweeper. Called automatically on drop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        debug!("File cache sweeper stopped");
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    cache: Arc<FileCache>,
    config: SweepConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Cache sweeper received shutdown signal");
                    return;
                }
            }
        }

        let evicted = cache.sweep(config.max_idle);
        if evicted > 0 {
            debug!(
                evicted = evicted,
                entries_remaining = cache.len(),
                "Idle file entries evicted"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::cache::{CacheKind, FsFile};
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn temp_file(name: &str, content: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "flashhttp-sweeper-test-{}-{}",
            std::process::id(),
            name
        ));
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    fn insert_entry(cache: &FileCache, path: PathBuf) -> Arc<FsFile> {
        let file = File::open(&path).unwrap();
        let len = file.metadata().unwrap().len() as usize;
        cache.insert(
            CacheKind::Identity,
            path.clone(),
            FsFile::from_file(
                path,
                file,
                len,
                "text/plain".to_string(),
                SystemTime::UNIX_EPOCH,
                "Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
                false,
                false,
            ),
        )
    }

    #[tokio::test]
    async fn test_sweeper_evicts_idle_entries() {
        let cache = Arc::new(FileCache::new());
        let path = temp_file("evict", b"idle content");
        insert_entry(&cache, path);
        assert_eq!(cache.len(), 1);

        let config = SweepConfig {
            interval: Duration::from_millis(10),
            max_idle: Duration::from_millis(30),
        };
        let _sweeper = CacheSweeper::start(Arc::clone(&cache), config);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_keeps_entries_with_live_readers() {
        let cache = Arc::new(FileCache::new());
        let path = temp_file("pinned", b"pinned content");
        let entry = insert_entry(&cache, path);

        let mut reader = entry.reader().unwrap();

        let config = SweepConfig {
            interval: Duration::from_millis(10),
            max_idle: Duration::from_millis(20),
        };
        let _sweeper = CacheSweeper::start(Arc::clone(&cache), config);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.len(), 1);

        use crate::protocol::BodyReader;
        reader.close().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let cache = Arc::new(FileCache::new());

        {
            let _sweeper = CacheSweeper::start(
                Arc::clone(&cache),
                SweepConfig {
                    interval: Duration::from_millis(10),
                    max_idle: Duration::from_millis(10),
                },
            );
            tokio::time::sleep(Duration::from_millis(30)).await;
            // Sweeper is dropped here
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        let path = temp_file("after-stop", b"x");
        insert_entry(&cache, path);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // No sweeper is running, so the idle entry survives.
        assert_eq!(cache.len(), 1);
    }
}
