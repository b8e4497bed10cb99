use ferry_metadata::SqliteStore;
use tempfile::TempDir;

/// A migrated store in a fresh temp directory. Keep the directory alive for
/// as long as the store is used.
pub async fn temp_store() -> (SqliteStore, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("metadata.db"), None)
        .await
        .unwrap();
    (store, dir)
}

/// A 64-char hex string derived from `n`, shaped like a chunk hash.
pub fn fake_hash(n: u64) -> String {
    format!("{n:064x}")
}
