use dupewatch::duplicates::{Comparator, ComparatorConfig, FinderConfig, ShareScanner};
use dupewatch::events::{
    CancellationRegistry, ChangeEvent, EventPipeline, EventQueue, OrderingKey, PipelineConfig,
    QueueConfig,
};
use dupewatch::hasher::{digest_bytes, HashPool};
use dupewatch::scanner::FileStat;
use dupewatch::shares::ShareMap;
use dupewatch::store::{MetadataRepository, RetryPolicy, SqliteRepository};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

struct Fixture {
    queue: EventQueue,
    comparator: Arc<Comparator>,
    repo: Arc<SqliteRepository>,
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let repo = Arc::new(SqliteRepository::open(&dir.path().join("db/files.db")).unwrap());
        let registry = Arc::new(CancellationRegistry::new());
        let comparator = Arc::new(
            Comparator::new(
                Arc::new(HashPool::new(2).unwrap()),
                Arc::clone(&registry),
                ComparatorConfig::default().with_chunk_size(3),
            )
            .unwrap(),
        );
        let shares = ShareMap::default().with_share("data", dir.path().join("data"));
        let pipeline = Arc::new(EventPipeline::new(
            repo.clone(),
            Arc::clone(&comparator),
            registry,
            PipelineConfig {
                shares,
                retry: RetryPolicy::immediate(2),
            },
        ));
        let queue = EventQueue::start(
            pipeline,
            QueueConfig {
                partitions: 4,
                max_delivery_attempts: 3,
                redelivery_backoff: Duration::from_millis(5),
            },
        )
        .unwrap();
        fs::create_dir(dir.path().join("data")).unwrap();
        Self {
            queue,
            comparator,
            repo,
            dir,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join("data").join(name)
    }

    fn write(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn push(&self, event: ChangeEvent) {
        self.queue.push(event).unwrap();
    }

    fn settle(&self) {
        assert!(self.queue.wait_idle_timeout(Duration::from_secs(30)));
    }

    fn hash_of(&self, path: &Path) -> Option<[u8; 32]> {
        self.repo.find_by_path(path).unwrap().and_then(|r| r.hash)
    }
}

fn upsert(path: &Path) -> ChangeEvent {
    ChangeEvent::Upsert {
        path: path.to_path_buf(),
    }
}

fn remove(path: &Path) -> ChangeEvent {
    ChangeEvent::Remove {
        path: path.to_path_buf(),
    }
}

#[test]
fn test_event_stream_builds_duplicate_sets() {
    let fx = Fixture::new();
    let a = fx.write("a", b"twin content");
    let b = fx.write("b", b"twin content");
    let c = fx.write("c", b"other conten");

    fx.push(upsert(&a));
    fx.settle();
    fx.push(upsert(&b));
    fx.settle();
    fx.push(upsert(&c));
    fx.settle();

    let expected = digest_bytes(b"twin content");
    assert_eq!(fx.hash_of(&a), Some(expected));
    assert_eq!(fx.hash_of(&b), Some(expected));
    assert_eq!(fx.hash_of(&c), None);

    let sets = fx.repo.find_duplicate_sets().unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].records.len(), 2);
    assert_eq!(fx.queue.stats().delivered, 3);
}

#[test]
fn test_removing_a_twin_clears_nothing_but_its_record() {
    let fx = Fixture::new();
    let a = fx.write("a", b"twin");
    let b = fx.write("b", b"twin");
    fx.push(upsert(&a));
    fx.settle();
    fx.push(upsert(&b));
    fx.settle();

    fs::remove_file(&b).unwrap();
    fx.push(remove(&b));
    fx.settle();

    assert!(fx.repo.find_by_path(&b).unwrap().is_none());
    assert_eq!(fx.repo.count().unwrap(), 1);
    // a keeps its digest; it is simply no longer part of a set
    assert!(fx.hash_of(&a).is_some());
    assert!(fx.repo.find_duplicate_sets().unwrap().is_empty());
}

#[test]
fn test_same_path_events_apply_in_order() {
    let fx = Fixture::new();
    let a = fx.write("a", b"payload");

    // Ordered: the remove must land after the upsert
    for _ in 0..5 {
        fx.push(upsert(&a));
        fx.push(remove(&a));
    }
    fx.settle();
    assert!(fx.repo.find_by_path(&a).unwrap().is_none());

    fx.push(upsert(&a));
    fx.settle();
    assert!(fx.repo.find_by_path(&a).unwrap().is_some());
}

#[test]
fn test_rename_keeps_hash_and_moves_share() {
    let fx = Fixture::new();
    let a = fx.write("a", b"renamed twin");
    let b = fx.write("b", b"renamed twin");
    fx.push(upsert(&a));
    fx.settle();
    fx.push(upsert(&b));
    fx.settle();
    let before = fx.hash_of(&a);
    assert!(before.is_some());

    let moved = fx.path("moved");
    fs::rename(&a, &moved).unwrap();
    fx.push(ChangeEvent::Rename {
        from: a.clone(),
        to: moved.clone(),
    });
    fx.settle();

    assert!(fx.repo.find_by_path(&a).unwrap().is_none());
    let record = fx.repo.find_by_path(&moved).unwrap().unwrap();
    assert_eq!(record.hash, before);
    assert_eq!(record.shares(), &[Some("data".to_string())]);
}

#[test]
fn test_unresolvable_rename_is_redelivered_then_dropped() {
    let fx = Fixture::new();
    fx.push(ChangeEvent::Rename {
        from: fx.path("never-seen"),
        to: fx.path("also-missing"),
    });
    fx.settle();

    let stats = fx.queue.stats();
    assert_eq!(stats.redelivered, 2);
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.delivered, 0);
}

#[test]
fn test_new_hardlink_name_is_merged_by_identity() {
    let fx = Fixture::new();
    let a = fx.write("a", b"linked");
    let b = fx.write("b", b"linked");
    fx.push(upsert(&a));
    fx.settle();
    fx.push(upsert(&b));
    fx.settle();

    let link = fx.path("a-link");
    fs::hard_link(&a, &link).unwrap();
    let ino = FileStat::from_path(&link).unwrap().id;
    fx.queue
        .push_keyed(&OrderingKey::File(ino), upsert(&link))
        .unwrap();
    fx.settle();

    let record = fx.repo.get(ino).unwrap().unwrap();
    assert_eq!(record.paths.len(), 2);
    assert!(record.hash.is_some());
    assert_eq!(fx.repo.count().unwrap(), 2);
}

#[test]
fn test_events_after_full_scan() {
    let fx = Fixture::new();
    let a = fx.write("a", b"version one");
    let b = fx.write("b", b"version one");

    let scanner = ShareScanner::new(
        Arc::clone(&fx.comparator),
        fx.repo.clone(),
        ShareMap::default().with_share("data", fx.dir.path().join("data")),
        FinderConfig::default(),
    );
    assert_eq!(scanner.scan().unwrap().duplicate_groups, 1);

    // Same size, different content: the pair dissolves
    fs::write(&b, b"version two").unwrap();
    filetime::set_file_mtime(&b, filetime::FileTime::from_unix_time(2_000_000_000, 0)).unwrap();
    fx.push(upsert(&b));
    fx.settle();

    assert_eq!(fx.hash_of(&a), None);
    assert_eq!(fx.hash_of(&b), None);
    assert!(fx.repo.find_duplicate_sets().unwrap().is_empty());
}
