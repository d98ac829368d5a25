use anyhow::Result;
use pagedb::access::{IdIndexCodec, PageTree};
use pagedb::context::{ObjectContext, FIRST_OBJECT_ID, ROOT_PAGE};
use pagedb::database::{Database, DatabaseConfig};
use pagedb::record::{Record, Value};
use pagedb::storage::{CacheConfig, PageCache, PageId, PageManager, PageProvider};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

const TIMEOUT: Duration = Duration::from_secs(5);

fn create_provider(page_size: usize, cache: CacheConfig) -> Result<(Arc<PageCache>, TempDir)> {
    let dir = tempdir()?;
    let page_manager = PageManager::create(&dir.path().join("test.db"), page_size)?;
    Ok((Arc::new(PageCache::new(Box::new(page_manager), cache)), dir))
}

fn create_context(page_size: usize) -> Result<(ObjectContext, Arc<PageCache>, TempDir)> {
    let (cache, dir) = create_provider(page_size, CacheConfig::default())?;
    let provider: Arc<dyn PageProvider> = cache.clone();
    let context = ObjectContext::create(provider, None, TIMEOUT)?;
    Ok((context, cache, dir))
}

fn padded(len: usize) -> Record {
    Record::with_class("Padded").with("pad", vec![0xabu8; len])
}

#[test]
fn test_eviction_writes_back_lowest_page() -> Result<()> {
    let config = CacheConfig {
        cache_size: 0,
        lock_timeout: TIMEOUT,
        ..CacheConfig::default()
    };
    let (cache, _dir) = create_provider(256, config)?;
    let capacity = cache.capacity();

    let mut pages = Vec::new();
    for i in 0..capacity {
        let page_id = cache.allocate()?;
        let mut page = cache.write_lock(page_id)?;
        page[100] = i as u8;
        pages.push(page_id);
    }
    assert_eq!(cache.resident_pages(), capacity);

    // Keep the lowest page locked: the next lowest one is evicted instead.
    let pinned = cache.read_lock(pages[0])?;
    let extra = cache.allocate()?;
    assert!(cache.is_resident(pages[0]));
    assert!(!cache.is_resident(pages[1]));
    assert!(cache.is_resident(extra));
    drop(pinned);

    // The evicted page was dirty, so its contents come back from disk.
    let page = cache.read_lock(pages[1])?;
    assert_eq!(page[100], 1);
    Ok(())
}

#[test]
fn test_tree_insert_order_and_black_root() -> Result<()> {
    let (cache, _dir) = create_provider(512, CacheConfig::default())?;
    let tree = PageTree::create(cache, IdIndexCodec, TIMEOUT)?;

    for key in [50, 10, 90, 30, 70] {
        tree.insert(key, key as u64 * 10)?;
    }
    let keys: Vec<i64> = tree.entries()?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![10, 30, 50, 70, 90]);

    let nodes = tree.nodes()?;
    let children: HashSet<i64> = nodes
        .iter()
        .flat_map(|n| n.left.into_iter().chain(n.right))
        .collect();
    let roots: Vec<_> = nodes.iter().filter(|n| !children.contains(&n.key)).collect();
    assert_eq!(roots.len(), 1);
    assert!(roots[0].black);
    tree.check()?;

    assert!(tree.remove(&30)?);
    let keys: Vec<i64> = tree.entries()?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![10, 50, 70, 90]);
    assert_eq!(tree.get(&30)?, None);

    let live: HashSet<_> = tree.nodes()?.into_iter().map(|n| n.item).collect();
    for item in tree.free_items()? {
        assert!(!live.contains(&item));
    }
    tree.check()?;
    Ok(())
}

#[test]
fn test_shrinking_update_frees_tail_pages() -> Result<()> {
    let (context, cache, _dir) = create_context(512)?;

    // 448 payload bytes per page: three pages.
    let mut record = padded(1000);
    let id = context.add(&mut record)?;
    assert!(context.free_pages()?.is_empty());

    let small = Record {
        id: Some(id),
        ..Record::new().with("x", 1i64)
    };
    assert_eq!(context.update(&small)?, Some(2));

    let freed = context.free_pages()?;
    assert_eq!(freed.len(), 2);

    let resident_before = cache.resident_pages();
    let page = context.allocate_page()?;
    assert_eq!(page, freed[0]);
    assert_eq!(cache.resident_pages(), resident_before);
    assert_eq!(context.free_pages()?, vec![freed[1]]);
    Ok(())
}

#[test]
fn test_store_grows_under_root_lock() -> Result<()> {
    let (context, cache, _dir) = create_context(512)?;
    let context = Arc::new(context);
    let before = cache.page_count();

    let root = cache.write_lock(ROOT_PAGE)?;
    let handle = {
        let context = Arc::clone(&context);
        thread::spawn(move || context.allocate_page())
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(cache.page_count(), before);
    drop(root);

    let page = handle.join().unwrap()?;
    assert_eq!(page, PageId(before));
    assert_eq!(cache.page_count(), before + 1);
    Ok(())
}

#[test]
fn test_competing_id_write_locks() -> Result<()> {
    let (context, _cache, _dir) = create_context(512)?;
    let context = Arc::new(context);
    let barrier = Arc::new(Barrier::new(2));
    let timeout = Duration::from_secs(2);

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let context = Arc::clone(&context);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<Duration> {
                barrier.wait();
                let started = Instant::now();
                context.write_lock(42, timeout)?;
                let waited = started.elapsed();
                thread::sleep(Duration::from_millis(100));
                context.write_unlock(42, false)?;
                Ok(waited)
            })
        })
        .collect();

    let mut waits: Vec<Duration> = Vec::new();
    for handle in handles {
        waits.push(handle.join().unwrap()?);
    }
    waits.sort();
    assert!(waits[0] < Duration::from_millis(100));
    assert!(waits[1] >= Duration::from_millis(50));

    // A holder that outlives the timeout makes the other side fail cleanly.
    context.write_lock(42, timeout)?;
    let other = Arc::clone(&context);
    let err = thread::spawn(move || other.write_lock(42, Duration::from_millis(200)))
        .join()
        .unwrap()
        .unwrap_err();
    assert!(err.is_timeout());
    context.write_unlock(42, false)?;
    Ok(())
}

#[test]
fn test_missing_ids() -> Result<()> {
    let (context, cache, _dir) = create_context(512)?;
    let mut record = Record::new().with("a", 1i64);
    let id = context.add(&mut record)?;
    let control = context.control();
    let dirty = cache.dirty_pages();

    assert!(!context.delete(id + 1)?);
    assert_eq!(context.get(id + 1)?, None);
    assert_eq!(context.control(), control);
    assert_eq!(cache.dirty_pages(), dirty);
    assert_eq!(context.ids()?, vec![id]);
    Ok(())
}

#[test]
fn test_multi_page_round_trip_and_versions() -> Result<()> {
    let (context, _cache, _dir) = create_context(256)?;

    let payload: Vec<u8> = (0..10_000).map(|i| (i * 7 % 256) as u8).collect();
    let mut record = Record::with_class("Document")
        .with("title", "large")
        .with("body", payload.clone())
        .with(
            "links",
            Value::List(vec![Value::Ref(FIRST_OBJECT_ID), Value::Null]),
        );
    let id = context.add(&mut record)?;

    let loaded = context.get(id)?.unwrap();
    assert_eq!(loaded, record);

    for version in 2..6 {
        record.set("rev", version as i64);
        assert_eq!(context.update(&record)?, Some(version));
        assert_eq!(context.get_version(id)?, Some(version));
        context.get(id)?;
        assert_eq!(context.get_version(id)?, Some(version));
    }
    assert_eq!(context.get(id)?.unwrap().get("body"), Some(&Value::Bytes(payload)));
    Ok(())
}

#[test]
fn test_database_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("objects.db");
    let config = DatabaseConfig {
        page_size: 1024,
        description: Some("reopen".to_string()),
        ..DatabaseConfig::default()
    };

    let mut ids = Vec::new();
    {
        let db = Database::create(&path, config)?;
        for i in 0..200i64 {
            let mut record = Record::with_class("Row")
                .with("i", i)
                .with("pad", vec![i as u8; (i as usize * 37) % 3000]);
            ids.push(db.add(&mut record)?);
        }
        for id in ids.iter().step_by(3) {
            assert!(db.delete(*id)?);
        }
        db.context()
            .update_root(&Record::new().with("first", Value::Ref(ids[1])))?;
        db.close()?;
    }

    let db = Database::open(&path, DatabaseConfig::default())?;
    assert_eq!(db.context().description(), Some("reopen"));
    for (i, id) in ids.iter().enumerate() {
        let record = db.get(*id)?;
        if i % 3 == 0 {
            assert!(record.is_none());
        } else {
            assert_eq!(record.unwrap().get("i"), Some(&Value::Int(i as i64)));
        }
    }
    assert_eq!(
        db.context().get_root()?.unwrap().get("first"),
        Some(&Value::Ref(ids[1]))
    );
    db.context().check()?;

    // Freed pages are reused before the file grows.
    let free = db.context().free_pages()?.len();
    assert!(free > 0);
    let mut record = padded(500);
    db.add(&mut record)?;
    assert!(db.context().free_pages()?.len() < free);
    Ok(())
}

#[test]
fn test_concurrent_workers() -> Result<()> {
    let (context, _cache, _dir) = create_context(512)?;
    let context = Arc::new(context);
    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let context = Arc::clone(&context);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<Vec<i64>> {
                barrier.wait();
                let mut kept = Vec::new();
                for i in 0..60i64 {
                    let mut record = padded((i as usize * 131) % 1500).with("worker", worker as i64);
                    let id = context.add(&mut record)?;

                    record.set("i", i);
                    assert_eq!(context.update(&record)?, Some(2));
                    let loaded = context.get(id)?.unwrap();
                    assert_eq!(loaded.get("i"), Some(&Value::Int(i)));

                    if i % 4 == 0 {
                        assert!(context.delete(id)?);
                    } else {
                        kept.push(id);
                    }
                }
                Ok(kept)
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap()?);
    }
    all.sort_unstable();
    assert_eq!(context.ids()?, all);
    context.check()?;

    let free: HashSet<PageId> = context.free_pages()?.into_iter().collect();
    assert_eq!(free.len(), context.free_pages()?.len());
    Ok(())
}
