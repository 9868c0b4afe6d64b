//! Tests for the derivative cache

use super::*;
use crate::core::error::ShieldError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use tempfile::TempDir;

fn create_test_cache() -> (DerivativeCache, TempDir) {
    let dir = TempDir::new().unwrap();
    let cache = DerivativeCache::new(DerivativeCacheConfig::with_cache_dir(dir.path().join("derivatives"))).unwrap();
    (cache, dir)
}

fn age_file(path: &Path, age: Duration) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_filename_layout() {
    let key = CacheKey::watermark(AttachmentId(12), "viewer-binding");
    let name = key.to_filename("png");
    assert!(name.starts_with("wm-12-"));
    assert!(name.ends_with(".png"));
    assert_eq!(name.len(), "wm-12-".len() + 16 + ".png".len());

    let other = CacheKey::watermark(AttachmentId(12), "someone-else");
    assert_ne!(name, other.to_filename("png"));
    assert!(CacheKey::blur(AttachmentId(12)).to_filename("jpg").starts_with("blur-12-"));
}

#[test]
fn test_second_call_is_a_hit() {
    let (cache, _dir) = create_test_cache();
    let calls = AtomicUsize::new(0);
    let key = CacheKey::blur(AttachmentId(1));
    let produce = || {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(b"derivative".to_vec())
    };

    let first = cache.get_or_create(&key, "png", produce).unwrap();
    let second = cache
        .get_or_create(&key, "png", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(b"other".to_vec())
        })
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.path, second.path);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.read().unwrap(), b"derivative");
}

#[test]
fn test_concurrent_callers_produce_once() {
    let (cache, _dir) = create_test_cache();
    let calls = AtomicUsize::new(0);
    let barrier = Barrier::new(8);
    let key = CacheKey::watermark(AttachmentId(3), "v1");

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                barrier.wait();
                cache
                    .get_or_create(&key, "png", || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        Ok(vec![7; 64])
                    })
                    .unwrap();
            });
        }
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(file_names(cache.cache_dir()).len(), 1);
}

#[test]
fn test_failed_producer_leaves_nothing() {
    let (cache, _dir) = create_test_cache();
    let key = CacheKey::blur(AttachmentId(4));
    let result = cache.get_or_create(&key, "png", || Err(ShieldError::unsupported("webp")));
    assert!(result.is_err());
    assert!(file_names(cache.cache_dir()).is_empty());

    let retry = cache.get_or_create(&key, "png", || Ok(vec![1])).unwrap();
    assert!(retry.created);
}

#[test]
fn test_expired_watermark_is_regenerated() {
    let dir = TempDir::new().unwrap();
    let cache = DerivativeCache::new(
        DerivativeCacheConfig::with_cache_dir(dir.path().to_path_buf()).with_watermark_ttl(Duration::from_secs(60)),
    )
    .unwrap();
    let key = CacheKey::watermark(AttachmentId(5), "v");

    let first = cache.get_or_create(&key, "png", || Ok(vec![1])).unwrap();
    age_file(&first.path, Duration::from_secs(120));
    assert!(cache.lookup(&key, "png").is_none());

    let second = cache.get_or_create(&key, "png", || Ok(vec![2])).unwrap();
    assert!(second.created);
    assert_eq!(second.read().unwrap(), vec![2]);
}

#[test]
fn test_sweep_respects_purpose_retention() {
    let dir = TempDir::new().unwrap();
    let cache = DerivativeCache::new(
        DerivativeCacheConfig::with_cache_dir(dir.path().to_path_buf()).with_watermark_ttl(Duration::from_secs(60)),
    )
    .unwrap();

    let wm = cache.get_or_create(&CacheKey::watermark(AttachmentId(1), "a"), "png", || Ok(vec![1])).unwrap();
    let fresh = cache.get_or_create(&CacheKey::watermark(AttachmentId(1), "b"), "png", || Ok(vec![1])).unwrap();
    let blur = cache.get_or_create(&CacheKey::blur(AttachmentId(1)), "png", || Ok(vec![1])).unwrap();
    age_file(&wm.path, Duration::from_secs(3600));
    age_file(&blur.path, Duration::from_secs(365 * 24 * 3600));

    let partial = dir.path().join(".partial-abc");
    fs::write(&partial, b"x").unwrap();
    age_file(&partial, Duration::from_secs(2 * 3600));
    fs::write(dir.path().join("unrelated.txt"), b"keep").unwrap();

    let report = cache.sweep_expired().unwrap();
    assert_eq!(report, SweepReport { expired: 1, partials: 1 });
    assert!(!wm.path.exists());
    assert!(fresh.path.exists());
    assert!(blur.path.exists());
    assert!(dir.path().join("unrelated.txt").exists());
}

#[test]
fn test_purge_source_only_touches_that_source() {
    let (cache, _dir) = create_test_cache();
    cache.get_or_create(&CacheKey::blur(AttachmentId(1)), "png", || Ok(vec![1])).unwrap();
    cache.get_or_create(&CacheKey::watermark(AttachmentId(1), "x"), "png", || Ok(vec![1])).unwrap();
    cache.get_or_create(&CacheKey::blur(AttachmentId(12)), "png", || Ok(vec![1])).unwrap();

    assert_eq!(cache.purge_source(AttachmentId(1)).unwrap(), 2);
    let remaining = file_names(cache.cache_dir());
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].starts_with("blur-12-"));
}

#[test]
fn test_remove_is_idempotent() {
    let (cache, _dir) = create_test_cache();
    let key = CacheKey::blur(AttachmentId(9));
    cache.get_or_create(&key, "jpg", || Ok(vec![1])).unwrap();
    assert!(cache.remove(&key, "jpg").unwrap());
    assert!(!cache.remove(&key, "jpg").unwrap());
}

#[test]
fn test_purge_purpose_keeps_other_purpose() {
    let (cache, _dir) = create_test_cache();
    cache.get_or_create(&CacheKey::blur(AttachmentId(3)), "png", || Ok(vec![1])).unwrap();
    cache.get_or_create(&CacheKey::watermark(AttachmentId(3), "v"), "png", || Ok(vec![1])).unwrap();

    assert_eq!(cache.purge_purpose(AttachmentId(3), DerivativePurpose::Blur).unwrap(), 1);
    let remaining = file_names(cache.cache_dir());
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].starts_with("wm-3-"));
}
