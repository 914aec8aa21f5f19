use dupewatch::duplicates::{
    Comparator, ComparatorConfig, FinderConfig, FinderError, ScanSummary, ShareScanner,
};
use dupewatch::events::CancellationRegistry;
use dupewatch::hasher::{digest_bytes, HashPool, EMPTY_DIGEST};
use dupewatch::scanner::{FileStat, WalkerConfig};
use dupewatch::shares::ShareMap;
use dupewatch::store::{MetadataRepository, SqliteRepository};
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::tempdir;

fn comparator(chunk_size: usize) -> Arc<Comparator> {
    Arc::new(
        Comparator::new(
            Arc::new(HashPool::new(2).unwrap()),
            Arc::new(CancellationRegistry::new()),
            ComparatorConfig::default()
                .with_chunk_size(chunk_size)
                .with_io_threads(2),
        )
        .unwrap(),
    )
}

fn scan_with(
    shares: ShareMap,
    chunk_size: usize,
    config: FinderConfig,
) -> (Result<ScanSummary, FinderError>, Arc<SqliteRepository>) {
    let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
    let scanner = ShareScanner::new(comparator(chunk_size), repo.clone(), shares, config);
    (scanner.scan(), repo)
}

fn scan(root: &Path, chunk_size: usize) -> (ScanSummary, Arc<SqliteRepository>) {
    let shares = ShareMap::default().with_share("test", root);
    let (summary, repo) = scan_with(shares, chunk_size, FinderConfig::default());
    (summary.unwrap(), repo)
}

fn hash_at(repo: &SqliteRepository, path: &Path) -> Option<[u8; 32]> {
    repo.find_by_path(path).unwrap().unwrap().hash
}

#[test]
fn test_scan_empty_share() {
    let dir = tempdir().unwrap();
    let (summary, repo) = scan(dir.path(), 1024);

    assert_eq!(summary.total_files, 0);
    assert_eq!(summary.duplicate_groups, 0);
    assert_eq!(repo.count().unwrap(), 0);
}

#[test]
fn test_hardlinks_merge_into_one_record() {
    let dir = tempdir().unwrap();
    let original = dir.path().join("original.bin");
    let link = dir.path().join("link.bin");
    let other = dir.path().join("other.bin");
    fs::write(&original, b"same length A").unwrap();
    fs::hard_link(&original, &link).unwrap();
    fs::write(&other, b"same length B").unwrap();

    let (summary, repo) = scan(dir.path(), 4);

    assert_eq!(summary.total_files, 3);
    assert_eq!(summary.hardlinks_merged, 1);
    assert_eq!(summary.duplicate_groups, 0);
    assert_eq!(repo.count().unwrap(), 2);

    let record = repo.find_by_path(&link).unwrap().unwrap();
    assert_eq!(record.id, FileStat::from_path(&original).unwrap().id);
    assert!(record.has_path(&original));
    assert_eq!(record.paths.len(), 2);
    assert_eq!(record.hash, None);
    assert_eq!(repo.find_with_multiple_paths().unwrap().len(), 1);
}

#[test]
fn test_hardlinks_alone_are_not_duplicates() {
    let dir = tempdir().unwrap();
    let original = dir.path().join("a");
    fs::write(&original, b"only one identity").unwrap();
    fs::hard_link(&original, dir.path().join("b")).unwrap();
    fs::hard_link(&original, dir.path().join("c")).unwrap();

    let (summary, repo) = scan(dir.path(), 4);

    assert_eq!(summary.duplicate_groups, 0);
    assert_eq!(summary.compared_groups, 0);
    assert_eq!(repo.count().unwrap(), 1);
    assert!(repo.find_duplicate_sets().unwrap().is_empty());
}

#[test]
fn test_zero_byte_files_share_empty_digest() {
    let dir = tempdir().unwrap();
    for name in ["e1", "e2", "e3"] {
        fs::write(dir.path().join(name), b"").unwrap();
    }
    fs::write(dir.path().join("not-empty"), b"x").unwrap();

    let (summary, repo) = scan(dir.path(), 4);

    assert_eq!(summary.empty_files, 3);
    assert_eq!(summary.duplicate_groups, 1);
    assert_eq!(summary.duplicate_files, 2);
    assert_eq!(hash_at(&repo, &dir.path().join("e2")), Some(EMPTY_DIGEST));
    assert_eq!(hash_at(&repo, &dir.path().join("not-empty")), None);

    let sets = repo.find_duplicate_sets().unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].size, 0);
    assert_eq!(sets[0].records.len(), 3);
}

#[test]
fn test_three_identical_files_confirmed() {
    let dir = tempdir().unwrap();
    let content = b"identical payload spanning several chunks";
    for name in ["a", "b", "c"] {
        fs::write(dir.path().join(name), content).unwrap();
    }
    let mut different = content.to_vec();
    different[0] = b'I';
    fs::write(dir.path().join("d"), &different).unwrap();

    let (summary, repo) = scan(dir.path(), 8);

    assert_eq!(summary.compared_groups, 1);
    assert_eq!(summary.duplicate_groups, 1);
    assert_eq!(summary.duplicate_files, 2);
    assert_eq!(summary.reclaimable_space, 2 * content.len() as u64);
    assert_eq!(summary.rounds, content.len().div_ceil(8) as u64);

    let expected = digest_bytes(content);
    for name in ["a", "b", "c"] {
        assert_eq!(hash_at(&repo, &dir.path().join(name)), Some(expected));
    }
    assert_eq!(hash_at(&repo, &dir.path().join("d")), None);
}

#[test]
fn test_divergence_after_ten_chunks() {
    let dir = tempdir().unwrap();
    let chunk = 4;
    let mut a = vec![b'x'; chunk * 10];
    let mut b = a.clone();
    a.extend_from_slice(b"aaaaaaaa");
    b.extend_from_slice(b"bbbbbbbb");
    let c = vec![b'y'; a.len()];
    fs::write(dir.path().join("a"), &a).unwrap();
    fs::write(dir.path().join("b"), &b).unwrap();
    fs::write(dir.path().join("c"), &c).unwrap();

    let (summary, repo) = scan(dir.path(), chunk);

    // c splits off in round 1, a and b in round 11
    assert_eq!(summary.rounds, 11);
    assert_eq!(summary.bytes_compared, 3 * 4 + 2 * 4 * 10);
    assert_eq!(summary.duplicate_groups, 0);
    for name in ["a", "b", "c"] {
        assert_eq!(hash_at(&repo, &dir.path().join(name)), None);
    }
}

#[test]
fn test_duplicates_across_shares() {
    let one = tempdir().unwrap();
    let two = tempdir().unwrap();
    fs::write(one.path().join("movie.mkv"), b"frames and frames").unwrap();
    fs::write(two.path().join("copy.mkv"), b"frames and frames").unwrap();

    let shares = ShareMap::default()
        .with_share("one", one.path())
        .with_share("two", two.path());
    let (summary, repo) = scan_with(shares, 1024, FinderConfig::default());
    let summary = summary.unwrap();

    assert_eq!(summary.duplicate_groups, 1);
    let record = repo
        .find_by_path(&two.path().join("copy.mkv"))
        .unwrap()
        .unwrap();
    assert_eq!(record.shares(), &[Some("two".to_string())]);
}

#[test]
fn test_rescan_is_stable() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a"), b"dup").unwrap();
    fs::write(dir.path().join("b"), b"dup").unwrap();
    fs::write(dir.path().join("c"), b"unique content").unwrap();

    let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
    let shares = ShareMap::default().with_share("test", dir.path());
    for _ in 0..2 {
        let scanner = ShareScanner::new(
            comparator(2),
            repo.clone(),
            shares.clone(),
            FinderConfig::default(),
        );
        let summary = scanner.scan().unwrap();
        assert_eq!(summary.duplicate_groups, 1);
    }
    assert_eq!(repo.count().unwrap(), 3);
    assert_eq!(repo.find_duplicate_sets().unwrap().len(), 1);
}

#[test]
fn test_ignore_patterns_and_hidden_files() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("keep.bin"), b"payload").unwrap();
    fs::write(dir.path().join("skip.tmp"), b"payload").unwrap();
    fs::write(dir.path().join(".hidden"), b"payload").unwrap();

    let config = FinderConfig::default().with_walker_config(
        WalkerConfig::default()
            .with_skip_hidden(true)
            .with_ignore_patterns(vec!["*.tmp".to_string()]),
    );
    let shares = ShareMap::default().with_share("test", dir.path());
    let (summary, repo) = scan_with(shares, 1024, config);
    let summary = summary.unwrap();

    assert_eq!(summary.total_files, 1);
    assert_eq!(summary.duplicate_groups, 0);
    assert_eq!(repo.count().unwrap(), 1);
}

#[test]
fn test_missing_share_root() {
    let dir = tempdir().unwrap();
    let shares = ShareMap::default().with_share("gone", dir.path().join("nope"));
    let (result, _) = scan_with(shares, 1024, FinderConfig::default());
    assert!(matches!(result, Err(FinderError::ShareNotFound { ref name, .. }) if name == "gone"));
}

#[test]
fn test_no_shares_configured() {
    let (result, _) = scan_with(ShareMap::default(), 1024, FinderConfig::default());
    assert!(matches!(result, Err(FinderError::NoShares)));
}

#[test]
fn test_interrupted_scan() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a"), b"x").unwrap();
    let config = FinderConfig::default().with_shutdown_flag(Arc::new(AtomicBool::new(true)));
    let shares = ShareMap::default().with_share("test", dir.path());
    let (result, _) = scan_with(shares, 1024, config);
    assert!(matches!(result, Err(FinderError::Interrupted)));
}
