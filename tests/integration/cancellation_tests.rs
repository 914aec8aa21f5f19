use dupewatch::duplicates::{CompareMember, Comparator, ComparatorConfig, Verdict};
use dupewatch::events::{
    CancelKey, CancellationRegistry, EventOutcome, EventPipeline, PipelineConfig, SkipReason,
};
use dupewatch::hasher::{digest_bytes, HashPool};
use dupewatch::scanner::FileStat;
use dupewatch::store::{MetadataRepository, RetryPolicy, SqliteRepository};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

// Many tiny rounds keep the session alive long enough for the publisher.
const SIZE: usize = 256 * 1024;
const CHUNK: usize = 16;

#[test]
fn test_removal_during_comparison_drops_member() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    let content = vec![0x5a; SIZE];
    fs::write(&a, &content).unwrap();
    fs::write(&b, &content).unwrap();
    let id_a = FileStat::from_path(&a).unwrap().id;
    let id_b = FileStat::from_path(&b).unwrap().id;

    let registry = Arc::new(CancellationRegistry::new());
    let pool = Arc::new(HashPool::new(2).unwrap());
    let comparator = Comparator::new(
        Arc::clone(&pool),
        Arc::clone(&registry),
        ComparatorConfig::default().with_chunk_size(CHUNK),
    )
    .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let publisher = {
        let registry = Arc::clone(&registry);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                registry.publish(CancelKey::File(id_b));
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let outcome = comparator.compare(
        SIZE as u64,
        vec![CompareMember::new(id_a, a), CompareMember::new(id_b, b)],
    );
    done.store(true, Ordering::SeqCst);
    publisher.join().unwrap();

    assert_eq!(outcome.verdict(id_b), Some(Verdict::Cancelled));
    assert_eq!(outcome.verdict(id_a), Some(Verdict::Unique));
    assert!(outcome.groups.is_empty());
    assert!((outcome.rounds as usize) < SIZE / CHUNK);
    assert_eq!(pool.live_accumulators(), 0);
}

#[test]
fn test_path_signal_drops_only_that_member() {
    let dir = tempdir().unwrap();
    let paths: Vec<_> = ["a", "b", "c"].iter().map(|n| dir.path().join(n)).collect();
    let content = vec![0x11; SIZE];
    for path in &paths {
        fs::write(path, &content).unwrap();
    }
    let members: Vec<_> = paths
        .iter()
        .map(|p| CompareMember::new(FileStat::from_path(p).unwrap().id, p.clone()))
        .collect();
    let removed = members[2].clone();

    let registry = Arc::new(CancellationRegistry::new());
    let comparator = Comparator::new(
        Arc::new(HashPool::new(2).unwrap()),
        Arc::clone(&registry),
        ComparatorConfig::default().with_chunk_size(CHUNK),
    )
    .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let publisher = {
        let registry = Arc::clone(&registry);
        let done = Arc::clone(&done);
        let path = removed.path.clone();
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                registry.publish(CancelKey::Path(path.clone()));
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let outcome = comparator.compare(SIZE as u64, members.clone());
    done.store(true, Ordering::SeqCst);
    publisher.join().unwrap();

    assert_eq!(outcome.verdict(removed.id), Some(Verdict::Cancelled));
    assert_eq!(outcome.groups.len(), 1);
    assert_eq!(outcome.groups[0].members.len(), 2);
    assert!(matches!(
        outcome.verdict(members[0].id),
        Some(Verdict::Confirmed(_))
    ));
}

#[test]
fn test_signal_for_unrelated_file_changes_nothing() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    fs::write(&a, b"equal bytes").unwrap();
    fs::write(&b, b"equal bytes").unwrap();

    let registry = Arc::new(CancellationRegistry::new());
    let comparator = Comparator::new(
        Arc::new(HashPool::new(1).unwrap()),
        Arc::clone(&registry),
        ComparatorConfig::default().with_chunk_size(2),
    )
    .unwrap();
    let members = vec![
        CompareMember::new(FileStat::from_path(&a).unwrap().id, a),
        CompareMember::new(FileStat::from_path(&b).unwrap().id, b),
    ];
    registry.publish(CancelKey::Path(dir.path().join("unrelated")));

    let outcome = comparator.compare(11, members);
    assert_eq!(outcome.groups.len(), 1);
    assert_eq!(registry.publish(CancelKey::Path(dir.path().join("later"))), 0);
}

#[test]
fn test_finished_sessions_leave_no_subscriptions() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    fs::write(&a, b"left").unwrap();
    fs::write(&b, b"rite").unwrap();
    let members = vec![
        CompareMember::new(FileStat::from_path(&a).unwrap().id, a),
        CompareMember::new(FileStat::from_path(&b).unwrap().id, b),
    ];

    // Nothing is ever published, as during a full scan.
    let registry = Arc::new(CancellationRegistry::new());
    let comparator = Comparator::new(
        Arc::new(HashPool::new(2).unwrap()),
        Arc::clone(&registry),
        ComparatorConfig::default().with_chunk_size(2),
    )
    .unwrap();

    for _ in 0..1000 {
        let outcome = comparator.compare(4, members.clone());
        assert!(outcome.groups.is_empty());
    }
    assert_eq!(registry.subscriber_count(), 0);
}

fn slow_pipeline() -> (EventPipeline, Arc<SqliteRepository>) {
    let registry = Arc::new(CancellationRegistry::new());
    let comparator = Arc::new(
        Comparator::new(
            Arc::new(HashPool::new(2).unwrap()),
            Arc::clone(&registry),
            ComparatorConfig::default().with_chunk_size(CHUNK),
        )
        .unwrap(),
    );
    let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
    let config = PipelineConfig {
        retry: RetryPolicy::immediate(1),
        ..PipelineConfig::default()
    };
    let pipeline = EventPipeline::new(repo.clone(), comparator, registry, config);
    (pipeline, repo)
}

#[test]
fn test_unlinking_one_name_does_not_cancel_live_identity() {
    let dir = tempdir().unwrap();
    let content = vec![0x3c; SIZE];
    let y1 = dir.path().join("y1");
    let y2 = dir.path().join("y2");
    let c = dir.path().join("c");
    fs::write(&y1, &content).unwrap();
    fs::hard_link(&y1, &y2).unwrap();
    fs::write(&c, &content).unwrap();

    let (pipeline, repo) = slow_pipeline();
    pipeline.upsert(&y1).unwrap();
    pipeline.upsert(&y2).unwrap();

    let (removed, upserted) = thread::scope(|s| {
        let upsert = s.spawn(|| pipeline.upsert(&c).unwrap());
        let removed = pipeline.remove(&y1).unwrap();
        (removed, upsert.join().unwrap())
    });

    let expected = digest_bytes(&content);
    assert!(matches!(removed, EventOutcome::Removed { deleted: false, .. }));
    assert!(matches!(upserted, EventOutcome::Stored { hash: Some(h), .. } if h == expected));
    let y = repo.find_by_path(&y2).unwrap().unwrap();
    assert_eq!(y.paths, vec![y2]);
    assert_eq!(y.hash, Some(expected));
    assert_eq!(repo.find_by_path(&c).unwrap().unwrap().hash, Some(expected));
}

#[test]
fn test_candidate_removed_during_upsert_stays_deleted() {
    let dir = tempdir().unwrap();
    let content = vec![0x7e; SIZE];
    let old = dir.path().join("old");
    let new = dir.path().join("new");
    fs::write(&old, &content).unwrap();
    fs::write(&new, &content).unwrap();
    let old_id = FileStat::from_path(&old).unwrap().id;

    let (pipeline, repo) = slow_pipeline();
    pipeline.upsert(&old).unwrap();

    let done = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                pipeline.remove(&old).unwrap();
                thread::sleep(Duration::from_millis(1));
            }
        });
        pipeline.upsert(&new).unwrap();
        done.store(true, Ordering::SeqCst);
    });

    assert!(repo.get(old_id).unwrap().is_none());
    assert!(repo.find_by_path(&old).unwrap().is_none());
    assert_eq!(repo.count().unwrap(), 1);
}

#[test]
fn test_upserted_file_removed_mid_comparison_is_not_stored() {
    let dir = tempdir().unwrap();
    let content = vec![0x42; SIZE];
    let kept = dir.path().join("kept");
    let doomed = dir.path().join("doomed");
    fs::write(&kept, &content).unwrap();
    fs::write(&doomed, &content).unwrap();
    let doomed_id = FileStat::from_path(&doomed).unwrap().id;

    let (pipeline, repo) = slow_pipeline();
    pipeline.upsert(&kept).unwrap();

    // Not stored yet, so each remove only signals the path.
    let done = AtomicBool::new(false);
    let outcome = thread::scope(|s| {
        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                pipeline.remove(&doomed).unwrap();
                thread::sleep(Duration::from_millis(1));
            }
        });
        let outcome = pipeline.upsert(&doomed).unwrap();
        done.store(true, Ordering::SeqCst);
        outcome
    });

    assert_eq!(
        outcome,
        EventOutcome::Skipped {
            path: doomed.clone(),
            reason: SkipReason::RemovedDuringComparison,
        }
    );
    assert!(repo.get(doomed_id).unwrap().is_none());
    assert_eq!(repo.find_by_path(&kept).unwrap().unwrap().hash, None);
}
