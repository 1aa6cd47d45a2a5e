//! Integration tests for the cache engine's public API
//!
//! Every test runs against its own temporary cache root.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, sleep};
use std::time::Duration;

use tempfile::TempDir;

use mini_filecache::cache::HealthStatus;
use mini_filecache::config::{ErrorMode, SerializerKind};
use mini_filecache::{CacheError, CacheStore, CacheValue, Config, Ttl};

// == Test Helpers ==
fn config_for(dir: &TempDir) -> Config {
    let mut config = Config::new(dir.path());
    config.gc_probability = 0;
    config
}

fn open(dir: &TempDir) -> CacheStore {
    CacheStore::open(config_for(dir)).unwrap()
}

fn open_with(dir: &TempDir, configure: impl FnOnce(&mut Config)) -> CacheStore {
    let mut config = config_for(dir);
    configure(&mut config);
    CacheStore::open(config).unwrap()
}

fn entry_files(dir: &TempDir) -> usize {
    walkdir::WalkDir::new(dir.path())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "cache"))
        .count()
}

// == Round Trip ==

#[test]
fn test_set_get_round_trip_across_instances() {
    let dir = TempDir::new().unwrap();
    let mut writer = open(&dir);
    writer.set("greeting", "hello", None).unwrap();
    writer.set("answer", 42i64, None).unwrap();
    writer.set("blob", vec![0u8, 1, 2, 255], None).unwrap();

    let mut reader = open(&dir);
    assert_eq!(reader.get("greeting").unwrap(), Some(CacheValue::from("hello")));
    assert_eq!(reader.get("answer").unwrap(), Some(CacheValue::Int(42)));
    assert_eq!(
        reader.get("blob").unwrap(),
        Some(CacheValue::Bytes(vec![0, 1, 2, 255]))
    );
}

#[test]
fn test_round_trip_with_compression_and_json() {
    let dir = TempDir::new().unwrap();
    let mut cache = open_with(&dir, |c| {
        c.serializer = SerializerKind::Json;
        c.compression = true;
        c.compression_threshold = 16;
    });

    let big = "x".repeat(4096);
    cache.set("big", big.as_str(), None).unwrap();
    let on_disk = fs::metadata(cache.entry_path("big").unwrap()).unwrap().len();
    assert!(on_disk < 4096, "compressed entry should be smaller, got {}", on_disk);

    let mut reader = open_with(&dir, |c| c.serializer = SerializerKind::Json);
    assert_eq!(reader.get("big").unwrap(), Some(CacheValue::from(big)));
}

#[test]
fn test_entry_layout_on_disk() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    cache.set("hello", "world", None).unwrap();

    let path = cache.entry_path("hello").unwrap();
    let relative = path.strip_prefix(dir.path()).unwrap();
    let parts: Vec<_> = relative.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    assert_eq!(parts.len(), 3, "two shard levels plus the file");
    assert_eq!(parts[0], "2c");
    assert_eq!(parts[1], "f2");
    assert!(parts[2].ends_with(".cache"));
    assert_eq!(entry_files(&dir), 1);
}

// == Expiry ==

#[test]
fn test_ttl_expiry() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    cache.set("short", "lived", Some(Ttl::seconds(1))).unwrap();
    assert!(cache.has("short").unwrap());

    sleep(Duration::from_millis(1100));

    assert!(!cache.has("short").unwrap());
    assert_eq!(cache.get("short").unwrap(), None);
    assert_eq!(
        cache.get_or("short", "default").unwrap(),
        CacheValue::from("default")
    );
}

#[test]
fn test_expiry_check_disabled_leaves_cleanup_to_gc() {
    let dir = TempDir::new().unwrap();
    let mut cache = open_with(&dir, |c| c.check_expiry_on_read = false);
    cache
        .set("stale", "still here", Some(Ttl::Duration(Duration::from_millis(200))))
        .unwrap();

    sleep(Duration::from_millis(300));

    assert!(cache.has("stale").unwrap());
    assert_eq!(cache.gc(true).unwrap(), 1);
    assert!(!cache.has("stale").unwrap());
}

// == Delete ==

#[test]
fn test_delete_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    cache.set("k", "v", None).unwrap();

    assert!(cache.delete("k").unwrap());
    assert!(!cache.has("k").unwrap());
    assert!(cache.delete("k").unwrap());
    assert!(!cache.has("k").unwrap());
    assert_eq!(entry_files(&dir), 0);
}

#[test]
fn test_pull_returns_and_removes() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    cache.set("once", "only", None).unwrap();

    assert_eq!(cache.pull("once").unwrap(), Some(CacheValue::from("only")));
    assert_eq!(cache.pull("once").unwrap(), None);
}

// == Tags ==

#[test]
fn test_delete_by_tag_leaves_other_tags() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    cache.tags(["users"]).set("user.1", "alice", None).unwrap();
    cache.tags(["users", "admins"]).set("user.2", "bob", None).unwrap();
    cache.tags(["posts"]).set("post.1", "hello", None).unwrap();

    assert_eq!(cache.delete_by_tag("users").unwrap(), 2);

    assert!(!cache.has("user.1").unwrap());
    assert!(!cache.has("user.2").unwrap());
    assert!(cache.has("post.1").unwrap());
    assert!(cache.tagged_keys("admins").unwrap().is_empty());
    assert_eq!(cache.tagged_keys("posts").unwrap(), vec!["post.1".to_string()]);
}

#[test]
fn test_tag_index_shared_between_instances() {
    let dir = TempDir::new().unwrap();
    let mut first = open(&dir);
    let mut second = open(&dir);

    first.tags(["shared"]).set("a", 1i64, None).unwrap();
    second.tags(["shared"]).set("b", 2i64, None).unwrap();

    assert_eq!(first.delete_by_tags(["shared"]).unwrap(), 2);
    assert!(!second.has("a").unwrap());
    assert!(!second.has("b").unwrap());
}

// == Cross-Instance Consistency ==

#[test]
fn test_instances_see_each_others_deletes_and_overwrites() {
    let dir = TempDir::new().unwrap();
    let mut writer = open(&dir);
    let mut reader = open(&dir);

    writer.set("k", "v1", None).unwrap();
    assert_eq!(reader.get("k").unwrap(), Some(CacheValue::from("v1")));

    writer.delete("k").unwrap();
    assert_eq!(reader.get("k").unwrap(), None);

    writer.set("k", "v2", None).unwrap();
    assert_eq!(reader.get("k").unwrap(), Some(CacheValue::from("v2")));

    // Let the file clock move past the mirrored copy's mtime.
    sleep(Duration::from_millis(50));
    writer.set("k", "v3", None).unwrap();
    assert_eq!(reader.get("k").unwrap(), Some(CacheValue::from("v3")));
}

#[test]
fn test_hit_counting_reader_never_restores_deleted_key() {
    let dir = TempDir::new().unwrap();
    let mut writer = open_with(&dir, |c| c.lock_timeout_ms = 5000);
    let path = writer.entry_path("k").unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reader_config = {
        let mut config = config_for(&dir);
        config.statistics = true;
        config.lock_timeout_ms = 5000;
        config
    };
    let reader_stop = stop.clone();
    let reader = thread::spawn(move || {
        let mut reader = CacheStore::open(reader_config).unwrap();
        let mut reads = 0u64;
        while !reader_stop.load(Ordering::Relaxed) {
            reader.get("k").unwrap();
            reads += 1;
        }
        reads
    });

    for i in 0..300i64 {
        writer.tags(["t"]).set("k", i, None).unwrap();
        writer.delete("k").unwrap();
        assert!(!path.exists(), "deleted key came back at iteration {}", i);
        assert!(writer.tagged_keys("t").unwrap().is_empty());
    }

    stop.store(true, Ordering::Relaxed);
    assert!(reader.join().unwrap() > 0);
    assert!(!path.exists());
}

#[test]
fn test_hit_counting_reader_never_restores_old_value() {
    let dir = TempDir::new().unwrap();
    let mut writer = open_with(&dir, |c| c.lock_timeout_ms = 5000);

    let stop = Arc::new(AtomicBool::new(false));
    let reader_config = {
        let mut config = config_for(&dir);
        config.statistics = true;
        config.lock_timeout_ms = 5000;
        config
    };
    let reader_stop = stop.clone();
    let reader = thread::spawn(move || {
        let mut reader = CacheStore::open(reader_config).unwrap();
        while !reader_stop.load(Ordering::Relaxed) {
            reader.get("k").unwrap();
        }
    });

    let mut check = open_with(&dir, |c| c.stat_cache_bypass = true);
    for i in 0..300i64 {
        writer.set("k", i, None).unwrap();
        assert_eq!(check.get("k").unwrap(), Some(CacheValue::Int(i)));
    }

    stop.store(true, Ordering::Relaxed);
    reader.join().unwrap();
}

// == Counters ==

#[test]
fn test_increment_from_zero() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    assert_eq!(cache.increment("counter", 1).unwrap(), Some(1));
    assert_eq!(cache.increment("counter", 5).unwrap(), Some(6));
    assert_eq!(cache.decrement("counter", 10).unwrap(), Some(-4));
}

#[test]
fn test_increment_decrement_preserve_ttl() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    cache.set("counter", 10i64, Some(Ttl::seconds(30))).unwrap();

    cache.increment("counter", 3).unwrap();
    cache.decrement("counter", 3).unwrap();

    assert_eq!(cache.get("counter").unwrap(), Some(CacheValue::Int(10)));
    assert_eq!(cache.ttl("counter").unwrap(), Some(30));
}

#[test]
fn test_increment_non_numeric_is_type_error() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    cache.set("name", "alice", None).unwrap();

    assert!(matches!(cache.increment("name", 1), Err(CacheError::Type(_))));
}

// == Remember ==

#[test]
fn test_remember_invokes_producer_once_until_expiry() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    let mut calls = 0;

    for _ in 0..3 {
        let value = cache
            .remember("report", Some(Ttl::seconds(1)), || {
                calls += 1;
                "computed"
            })
            .unwrap();
        assert_eq!(value, CacheValue::from("computed"));
    }
    assert_eq!(calls, 1);

    sleep(Duration::from_millis(1100));

    cache
        .remember("report", Some(Ttl::seconds(1)), || {
            calls += 1;
            "recomputed"
        })
        .unwrap();
    assert_eq!(calls, 2);
}

#[test]
fn test_remember_forever_applies_pending_tags() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    cache.tags(["config"]).remember_forever("settings", || 1i64).unwrap();

    assert_eq!(cache.ttl("settings").unwrap(), Some(-1));
    assert_eq!(cache.tagged_keys("config").unwrap(), vec!["settings".to_string()]);
}

// == Eviction ==

#[test]
fn test_size_eviction_removes_oldest() {
    let dir = TempDir::new().unwrap();
    let entry_size = {
        let mut cache = open(&dir);
        cache.set("sample", "x".repeat(200).as_str(), None).unwrap();
        let size = fs::metadata(cache.entry_path("sample").unwrap()).unwrap().len();
        cache.clear().unwrap();
        size
    };

    // Room for three entries, not four
    let budget = entry_size * 3 + entry_size / 2;
    let mut cache = open_with(&dir, |c| c.max_cache_size = Some(budget));
    for key in ["k0", "k1", "k2", "k3", "k4"] {
        cache.set(key, "x".repeat(200).as_str(), None).unwrap();
        sleep(Duration::from_millis(50));
    }

    let stats = cache.stats();
    assert!(stats.total_bytes <= budget, "{} > {}", stats.total_bytes, budget);
    assert_eq!(stats.total_entries, 3);
    assert!(!cache.has("k0").unwrap());
    assert!(!cache.has("k1").unwrap());
    for key in ["k2", "k3", "k4"] {
        assert!(cache.has(key).unwrap(), "{} should survive eviction", key);
    }
    assert_eq!(stats.evictions, 2);
}

#[test]
fn test_max_item_size_rejects_before_io() {
    let dir = TempDir::new().unwrap();
    let mut cache = open_with(&dir, |c| c.max_item_size = Some(64));

    let result = cache.set("huge", "y".repeat(1024).as_str(), None);
    assert!(matches!(result, Err(CacheError::Validation(_))));
    assert_eq!(entry_files(&dir), 0);
}

// == Corruption ==

#[test]
fn test_truncated_file_is_a_miss_and_removed() {
    let dir = TempDir::new().unwrap();
    let path = {
        let mut writer = open(&dir);
        writer.tags(["t"]).set("fragile", "payload", None).unwrap();
        writer.entry_path("fragile").unwrap()
    };

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let mut cache = open(&dir);
    assert_eq!(
        cache.get_or("fragile", "default").unwrap(),
        CacheValue::from("default")
    );
    assert!(!path.exists(), "corrupt file should be deleted");
    assert!(cache.tagged_keys("t").unwrap().is_empty());
    assert_eq!(cache.stats().corrupt, 1);
}

#[test]
fn test_empty_file_is_a_miss() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    let path = cache.entry_path("empty").unwrap();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"").unwrap();

    assert!(!cache.has("empty").unwrap());
    assert!(!path.exists());
}

// == Garbage Collection ==

#[test]
fn test_gc_removes_exactly_expired_entries() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    cache.set("fresh", 1i64, Some(Ttl::seconds(3600))).unwrap();
    cache.forever("eternal", 2i64).unwrap();
    assert_eq!(cache.gc(true).unwrap(), 0);

    cache
        .set("stale.a", 3i64, Some(Ttl::Duration(Duration::from_millis(100))))
        .unwrap();
    cache
        .set("stale.b", 4i64, Some(Ttl::Duration(Duration::from_millis(100))))
        .unwrap();
    sleep(Duration::from_millis(200));

    assert_eq!(cache.gc(true).unwrap(), 2);
    assert!(cache.has("fresh").unwrap());
    assert!(cache.has("eternal").unwrap());
    assert_eq!(entry_files(&dir), 2);
    assert_eq!(cache.stats().gc_runs, 2);
}

#[test]
fn test_gc_never_sampled_with_zero_probability() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    cache
        .set("stale", 1i64, Some(Ttl::Duration(Duration::from_millis(50))))
        .unwrap();
    sleep(Duration::from_millis(100));

    assert_eq!(cache.gc(false).unwrap(), 0);
    assert_eq!(cache.stats().gc_runs, 0);
}

// == Error Modes ==

#[test]
fn test_error_modes() {
    let dir = TempDir::new().unwrap();

    let mut throwing = open(&dir);
    assert!(matches!(
        throwing.set("bad:key", "v", None),
        Err(CacheError::Validation(_))
    ));

    let mut logging = open_with(&dir, |c| c.error_mode = ErrorMode::Log);
    assert!(!logging.set("bad:key", "v", None).unwrap());
    assert_eq!(logging.get("bad:key").unwrap(), None);

    let mut silent = open_with(&dir, |c| c.error_mode = ErrorMode::Silent);
    assert!(!silent.delete("bad@key").unwrap());
    assert_eq!(silent.delete_by_tag("missing").unwrap(), 0);
}

#[test]
fn test_open_fails_fast_on_bad_config() {
    let dir = TempDir::new().unwrap();
    let mut config = config_for(&dir);
    config.compression_level = 12;
    assert!(CacheStore::open(config).is_err());

    assert!(matches!(
        CacheStore::open(Config::new("not/absolute")),
        Err(CacheError::Configuration(_))
    ));
}

// == Touch, Add, Warmup, Clear ==

#[test]
fn test_touch_extends_live_entries_only() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    cache
        .set("session", "abc", Some(Ttl::Duration(Duration::from_millis(300))))
        .unwrap();
    cache
        .set("gone", "x", Some(Ttl::Duration(Duration::from_millis(50))))
        .unwrap();
    sleep(Duration::from_millis(100));

    assert!(cache.touch("session", Some(Ttl::seconds(60))).unwrap());
    assert!(!cache.touch("gone", Some(Ttl::seconds(60))).unwrap());
    assert!(!cache.touch("never", None).unwrap());

    sleep(Duration::from_millis(300));
    assert_eq!(cache.get("session").unwrap(), Some(CacheValue::from("abc")));
}

#[test]
fn test_add_replaces_expired_entry() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    cache
        .set("slot", "old", Some(Ttl::Duration(Duration::from_millis(50))))
        .unwrap();
    assert!(!cache.add("slot", "new", None).unwrap());

    sleep(Duration::from_millis(100));
    assert!(cache.add("slot", "new", None).unwrap());
    assert_eq!(cache.get("slot").unwrap(), Some(CacheValue::from("new")));
}

#[test]
fn test_warmup_and_clear() {
    let dir = TempDir::new().unwrap();
    {
        let mut writer = open(&dir);
        writer.set_many([("a", 1i64), ("b", 2i64), ("c", 3i64)], None).unwrap();
    }

    let mut cache = open(&dir);
    assert_eq!(cache.warmup(["a", "b", "zzz"]).unwrap(), 2);
    assert_eq!(cache.stats().memory_entries, 2);

    assert!(cache.clear().unwrap());
    assert_eq!(entry_files(&dir), 0);
    assert!(!cache.has("a").unwrap());
    assert_eq!(cache.stats().memory_entries, 0);
}

// == Diagnostics ==

#[test]
fn test_stats_and_health() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    cache.set("a", 1i64, None).unwrap();
    cache.get("a").unwrap();
    cache.get("missing").unwrap();
    cache.delete("a").unwrap();

    let stats = cache.stats();
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.deletes, 1);
    assert_eq!(stats.hit_rate(), 0.5);

    let health = cache.health_check();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.writable.ok);
    assert_eq!(health.entries, 0);
}

#[test]
fn test_locking_disabled_still_works() {
    let dir = TempDir::new().unwrap();
    let mut cache = open_with(&dir, |c| {
        c.locking = false;
        c.atomic_writes = false;
        c.sharding = false;
    });

    cache.set("plain", "value", None).unwrap();
    assert_eq!(cache.increment("n", 2).unwrap(), Some(2));
    assert_eq!(cache.get("plain").unwrap(), Some(CacheValue::from("value")));
    assert!(!dir.path().join("locks").exists());
}
