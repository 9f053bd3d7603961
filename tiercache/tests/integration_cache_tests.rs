//! End-to-end tests for the tiered cache: memory/disk routing, rotation,
//! recovery, corruption handling and lifecycle.

use std::path::Path;

use tempfile::tempdir;
use tiercache::persistence::{discover, partition_filename};
use tiercache::{
    CacheConfig, CacheError, CompressionAlgorithm, Lookup, PartitionConfig, PutOptions, Tier,
    TieredCache,
};

fn test_config(directory: &Path) -> CacheConfig {
    let mut config = CacheConfig::default();
    config.directory = directory.to_path_buf();
    config.capacity = 64;
    config.max_entry_size = 1024 * 1024;
    config.queue_capacity = 64;
    config.partition = PartitionConfig {
        max_rows: 1000,
        max_bytes: 16 * 1024 * 1024,
        flush_rows: 1,
        flush_bytes: 1024 * 1024,
    };
    config
}

async fn assert_hit(cache: &TieredCache, key: &str, expected: &[u8]) -> Tier {
    match cache.get(key).await.unwrap() {
        Lookup::Hit(entry) => {
            assert_eq!(entry.value, expected, "value mismatch for {}", key);
            entry.tier
        }
        Lookup::Miss => panic!("expected hit for {}", key),
    }
}

#[tokio::test]
async fn test_put_get_round_trip() {
    let dir = tempdir().unwrap();
    let cache = TieredCache::open(test_config(dir.path())).await.unwrap();

    cache
        .put("cid-1", b"hello world".to_vec(), PutOptions::default())
        .await
        .unwrap();
    let tier = assert_hit(&cache, "cid-1", b"hello world").await;
    assert_eq!(tier, Tier::Recent);

    // Reused entries come back from the frequency list
    let tier = assert_hit(&cache, "cid-1", b"hello world").await;
    assert_eq!(tier, Tier::Frequent);

    let stats = cache.stats().await;
    assert_eq!(stats.memory_hits, 2);
    assert_eq!(stats.misses, 0);

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_cold_miss() {
    let dir = tempdir().unwrap();
    let cache = TieredCache::open(test_config(dir.path())).await.unwrap();

    assert!(matches!(
        cache.get("absent").await.unwrap(),
        Lookup::Miss
    ));
    assert_eq!(cache.stats().await.misses, 1);

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_entry_too_large_is_a_no_op() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.max_entry_size = 64;
    let cache = TieredCache::open(config).await.unwrap();

    let err = cache
        .put("huge", vec![0u8; 65], PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::EntryTooLarge { size: 65, max: 64 }));

    let stats = cache.stats().await;
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.pending_writes, 0);
    assert!(matches!(cache.get("huge").await.unwrap(), Lookup::Miss));

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_evicted_entry_served_from_disk_and_promoted() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.capacity = 2;
    let cache = TieredCache::open(config).await.unwrap();

    for i in 0..4 {
        cache
            .put(&format!("cid-{}", i), vec![i as u8; 128], PutOptions::default())
            .await
            .unwrap();
    }
    cache.flush().await.unwrap();

    // cid-0 was demoted out of memory; it must come back from disk
    let tier = assert_hit(&cache, "cid-0", &[0u8; 128]).await;
    assert_eq!(tier, Tier::Disk);

    // ...and is now resident again
    let tier = assert_hit(&cache, "cid-0", &[0u8; 128]).await;
    assert_ne!(tier, Tier::Disk);

    let stats = cache.stats().await;
    assert_eq!(stats.disk_hits, 1);
    assert!(stats.disk_bytes > 0);

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_sync_flush_put() {
    let dir = tempdir().unwrap();
    let cache = TieredCache::open(test_config(dir.path())).await.unwrap();

    cache
        .put(
            "durable",
            b"now".to_vec(),
            PutOptions { sync_flush: true },
        )
        .await
        .unwrap();
    assert_eq!(cache.stats().await.pending_writes, 0);

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_invalidate() {
    let dir = tempdir().unwrap();
    let cache = TieredCache::open(test_config(dir.path())).await.unwrap();

    cache
        .put("cid-1", b"v".to_vec(), PutOptions::default())
        .await
        .unwrap();
    cache.invalidate("cid-1").await.unwrap();
    assert!(matches!(cache.get("cid-1").await.unwrap(), Lookup::Miss));

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_values_survive_restart() {
    let dir = tempdir().unwrap();

    let cache = TieredCache::open(test_config(dir.path())).await.unwrap();
    for i in 0..10 {
        cache
            .put(&format!("cid-{}", i), vec![i as u8; 64], PutOptions::default())
            .await
            .unwrap();
    }
    cache.close().await.unwrap();

    let cache = TieredCache::open(test_config(dir.path())).await.unwrap();
    assert!(cache.discovery_report().sidecar_used);
    for i in 0..10 {
        let tier = assert_hit(&cache, &format!("cid-{}", i), &[i as u8; 64]).await;
        assert_eq!(tier, Tier::Disk);
    }
    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_tombstone_survives_restart() {
    let dir = tempdir().unwrap();

    let cache = TieredCache::open(test_config(dir.path())).await.unwrap();
    cache
        .put("dead", b"v".to_vec(), PutOptions::default())
        .await
        .unwrap();
    cache
        .put("alive", b"w".to_vec(), PutOptions::default())
        .await
        .unwrap();
    cache.invalidate("dead").await.unwrap();
    cache.close().await.unwrap();

    // Force the row-scan rebuild so the tombstone itself is replayed
    std::fs::remove_file(dir.path().join("index.json")).unwrap();

    let cache = TieredCache::open(test_config(dir.path())).await.unwrap();
    assert!(!cache.discovery_report().sidecar_used);
    assert!(matches!(cache.get("dead").await.unwrap(), Lookup::Miss));
    assert_hit(&cache, "alive", b"w").await;
    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_rotation_partition_counts() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.partition.max_rows = 5;
    let cache = TieredCache::open(config).await.unwrap();

    for i in 0..6 {
        cache
            .put(&format!("cid-{}", i), vec![i as u8; 32], PutOptions::default())
            .await
            .unwrap();
    }
    cache.flush().await.unwrap();
    assert_eq!(cache.stats().await.partition_count, 2);
    cache.close().await.unwrap();

    let discovery = discover(dir.path()).await.unwrap();
    assert_eq!(discovery.index.len(), 2);
    let rows: Vec<u64> = discovery.index.iter().map(|m| m.row_count).collect();
    assert_eq!(rows, vec![5, 1]);
}

#[tokio::test]
async fn test_corrupt_partition_excluded_at_startup() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.partition.max_rows = 3;
    let cache = TieredCache::open(config).await.unwrap();

    for i in 0..6 {
        cache
            .put(&format!("cid-{}", i), vec![i as u8; 32], PutOptions::default())
            .await
            .unwrap();
    }
    cache.close().await.unwrap();

    // Truncate the first partition's footer
    let victim = dir.path().join(partition_filename(1));
    let bytes = std::fs::read(&victim).unwrap();
    std::fs::write(&victim, &bytes[..bytes.len() - 8]).unwrap();

    let cache = TieredCache::open(test_config(dir.path())).await.unwrap();
    let report = cache.discovery_report();
    assert_eq!(report.corrupt.len(), 1);
    assert_eq!(report.corrupt[0].id, Some(1));
    assert!(victim.exists(), "corrupt partitions are never deleted");

    // Keys from the surviving partition are still served
    assert_hit(&cache, "cid-4", &[4u8; 32]).await;
    assert!(matches!(cache.get("cid-0").await.unwrap(), Lookup::Miss));
    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_read_time_corruption_quarantines_partition() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.capacity = 2;
    config.partition.max_rows = 3;
    let cache = TieredCache::open(config).await.unwrap();

    for i in 0..6 {
        cache
            .put(&format!("cid-{}", i), vec![i as u8; 64], PutOptions::default())
            .await
            .unwrap();
    }
    cache.flush().await.unwrap();

    // Partition 1 (cid-0..2) is finalized; wreck its row region
    let victim = dir.path().join(partition_filename(1));
    std::fs::write(&victim, b"TIERPAR1 garbage").unwrap();

    let err = cache.get("cid-0").await.unwrap_err();
    assert!(matches!(err, CacheError::PartitionCorrupt { id: 1, .. }));

    // The partition is quarantined; its keys now miss cleanly
    assert!(matches!(cache.get("cid-1").await.unwrap(), Lookup::Miss));
    // Sibling partitions are untouched
    assert_hit(&cache, "cid-5", &[5u8; 64]).await;

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_crashed_active_partition_salvaged_on_reopen() {
    let dir = tempdir().unwrap();

    let cache = TieredCache::open(test_config(dir.path())).await.unwrap();
    for i in 0..3 {
        cache
            .put(&format!("cid-{}", i), vec![i as u8; 16], PutOptions::default())
            .await
            .unwrap();
    }
    // Durable rows, no footer: the writer flushed (flush_rows = 1) but
    // the cache was never closed
    cache.flush().await.unwrap();
    drop(cache);

    let cache = TieredCache::open(test_config(dir.path())).await.unwrap();
    assert_eq!(cache.discovery_report().salvaged, Some(1));
    for i in 0..3 {
        assert_hit(&cache, &format!("cid-{}", i), &[i as u8; 16]).await;
    }
    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_compressed_values_round_trip() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.compression.enabled = true;
    config.compression.min_payload_size = 64;
    config.compression.default_algorithm = CompressionAlgorithm::Lz4;

    let cache = TieredCache::open(config.clone()).await.unwrap();
    let value = b"abcdefgh".repeat(512);
    cache
        .put("compressed", value.clone(), PutOptions::default())
        .await
        .unwrap();
    cache.close().await.unwrap();

    let cache = TieredCache::open(config).await.unwrap();
    let tier = assert_hit(&cache, "compressed", &value).await;
    assert_eq!(tier, Tier::Disk);
    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_operations_after_close() {
    let dir = tempdir().unwrap();
    let cache = TieredCache::open(test_config(dir.path())).await.unwrap();
    cache.close().await.unwrap();

    assert!(matches!(
        cache.get("any").await.unwrap_err(),
        CacheError::Closed
    ));
    assert!(matches!(
        cache
            .put("any", b"v".to_vec(), PutOptions::default())
            .await
            .unwrap_err(),
        CacheError::Closed
    ));
    assert!(matches!(cache.close().await.unwrap_err(), CacheError::Closed));
}

#[tokio::test]
async fn test_stats_shape() {
    let dir = tempdir().unwrap();
    let cache = TieredCache::open(test_config(dir.path())).await.unwrap();

    cache
        .put("cid-1", b"v".to_vec(), PutOptions::default())
        .await
        .unwrap();
    cache.get("cid-1").await.unwrap();
    cache.get("nope").await.unwrap();

    let stats = cache.stats().await;
    assert_eq!(stats.memory_hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entries, 1);
    assert!(stats.p <= 64);
    assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);

    cache.close().await.unwrap();
}
