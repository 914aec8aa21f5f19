use dupewatch::duplicates::{Comparator, ComparatorConfig, FinderConfig, ShareScanner};
use dupewatch::events::CancellationRegistry;
use dupewatch::hasher::{hash_to_hex, HashPool, EMPTY_DIGEST};
use dupewatch::output::export_groups;
use dupewatch::shares::ShareMap;
use dupewatch::store::{MetadataRepository, SqliteRepository};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

fn scanned_repo(root: &std::path::Path) -> Arc<SqliteRepository> {
    let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
    let comparator = Arc::new(
        Comparator::new(
            Arc::new(HashPool::new(1).unwrap()),
            Arc::new(CancellationRegistry::new()),
            ComparatorConfig::default().with_chunk_size(64),
        )
        .unwrap(),
    );
    ShareScanner::new(
        comparator,
        repo.clone(),
        ShareMap::default().with_share("share", root),
        FinderConfig::default(),
    )
    .scan()
    .unwrap();
    repo
}

#[test]
fn test_export_lists_every_path_of_every_group() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.txt");
    fs::write(&a, b"group one").unwrap();
    fs::hard_link(&a, dir.path().join("a-link.txt")).unwrap();
    fs::write(dir.path().join("b.txt"), b"group one").unwrap();
    fs::write(dir.path().join("e1"), b"").unwrap();
    fs::write(dir.path().join("e2"), b"").unwrap();
    fs::write(dir.path().join("lonely.txt"), b"no partner here").unwrap();

    let repo = scanned_repo(dir.path());
    let export = export_groups(repo.as_ref()).unwrap();

    assert_eq!(export.total_groups, 2);
    assert_eq!(export.total_files, 5);
    assert_eq!(export.reclaimable_bytes, 9);

    let text = export.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    let groups = value["groups"].as_array().unwrap();
    let empty = groups
        .iter()
        .find(|g| g["hash"] == hash_to_hex(&EMPTY_DIGEST))
        .unwrap();
    assert_eq!(empty["size"], 0);
    assert_eq!(empty["files"].as_array().unwrap().len(), 2);
    assert!(!text.contains("lonely.txt"));
}

#[test]
fn test_keep_designation_marks_all_names_of_identity() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a");
    let link = dir.path().join("a2");
    let b = dir.path().join("b");
    fs::write(&a, b"keep me").unwrap();
    fs::hard_link(&a, &link).unwrap();
    fs::write(&b, b"keep me").unwrap();

    let repo = scanned_repo(dir.path());
    let record = repo.find_by_path(&a).unwrap().unwrap();
    repo.designate_keep(&record.hash.unwrap(), record.id).unwrap();

    let export = export_groups(repo.as_ref()).unwrap();
    let files = &export.groups[0].files;
    let kept: Vec<_> = files.iter().filter(|f| f.keep).map(|f| f.path.clone()).collect();
    assert_eq!(kept.len(), 2);
    assert!(kept.contains(&a.to_string_lossy().into_owned()));
    assert!(kept.contains(&link.to_string_lossy().into_owned()));
    assert!(files
        .iter()
        .any(|f| f.path == b.to_string_lossy() && !f.keep));
}

#[test]
fn test_export_is_recomputed_per_call() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a");
    fs::write(&a, b"twins").unwrap();
    fs::write(dir.path().join("b"), b"twins").unwrap();

    let repo = scanned_repo(dir.path());
    assert_eq!(export_groups(repo.as_ref()).unwrap().total_groups, 1);

    let record = repo.find_by_path(&a).unwrap().unwrap();
    repo.delete(record.id).unwrap();
    assert_eq!(export_groups(repo.as_ref()).unwrap().total_groups, 0);
}
