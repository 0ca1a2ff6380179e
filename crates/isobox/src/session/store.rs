//! Filesystem-backed session store.

use chrono::Utc;
use tracing::{debug, instrument, warn};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{Session, StoreError, StoreResult};

/// Record file inside each session directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Session records stored as `<root>/<container_name>/metadata.json`.
///
/// Records are always replaced whole (temp file, fsync, rename) so readers
/// never observe a partially written record. Records living under another
/// directory name are still found by a scan of the root.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a new record. Fails with `AlreadyExists` if a readable record for
    /// the container is present; unreadable leftovers are replaced.
    #[instrument(skip(self, session), fields(container = %session.container_name))]
    pub async fn create(&self, session: &Session) -> StoreResult<()> {
        let name = &session.container_name;
        let dir = self.session_dir(name)?;

        if let Some((existing_dir, _)) = self.locate(name).await? {
            debug!("session record for {} already in {}", name, existing_dir.display());
            return Err(StoreError::AlreadyExists(name.clone()));
        }

        fs::create_dir_all(&dir).await?;
        let path = dir.join(METADATA_FILE);
        let data = serde_json::to_vec_pretty(session)?;

        match create_new(&path, &data).await {
            Ok(()) => {}
            Err(StoreError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {
                match read_record(&path).await {
                    Ok(Some(existing)) if existing.container_name == *name => {
                        return Err(StoreError::AlreadyExists(name.clone()));
                    }
                    Ok(_) => warn!("replacing stray session record at {}", path.display()),
                    Err(e) => warn!("replacing unreadable session record {}: {}", path.display(), e),
                }
                write_atomic(&path, &data).await?;
            }
            Err(e) => return Err(e),
        }

        debug!("created session record {} for {}", session.session_id, name);
        Ok(())
    }

    /// Look up a record by container name. Malformed records are skipped.
    pub async fn find_by_container_name(&self, name: &str) -> StoreResult<Option<Session>> {
        Ok(self.locate(name).await?.map(|(_, session)| session))
    }

    /// All readable records, oldest first.
    pub async fn list(&self) -> StoreResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .scan()
            .await?
            .into_iter()
            .map(|(_, session)| session)
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// Mark a session persistent. Idempotent; bumps `updated_at`.
    #[instrument(skip(self))]
    pub async fn set_persistent(&self, name: &str) -> StoreResult<Session> {
        self.update(name, |session| session.persistent = true).await
    }

    /// Bump `updated_at`, e.g. when a stopped session is resumed.
    pub async fn touch(&self, name: &str) -> StoreResult<Session> {
        self.update(name, |_| {}).await
    }

    /// Remove a record. Returns `false` when there was nothing to remove.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> StoreResult<bool> {
        let primary = self.session_dir(name)?;
        let dir = match self.locate(name).await? {
            Some((dir, _)) => dir,
            // A directory without a readable record is garbage for this name.
            None if fs::try_exists(&primary).await? => primary,
            None => return Ok(false),
        };

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        debug!("deleted session record for {}", name);
        Ok(true)
    }

    async fn update<F>(&self, name: &str, apply: F) -> StoreResult<Session>
    where
        F: FnOnce(&mut Session),
    {
        let (dir, mut session) = self
            .locate(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        apply(&mut session);
        session.updated_at = Utc::now();

        let data = serde_json::to_vec_pretty(&session)?;
        write_atomic(&dir.join(METADATA_FILE), &data).await?;
        Ok(session)
    }

    fn session_dir(&self, name: &str) -> StoreResult<PathBuf> {
        validate_key(name)?;
        Ok(self.root.join(name))
    }

    async fn locate(&self, name: &str) -> StoreResult<Option<(PathBuf, Session)>> {
        let primary = self.session_dir(name)?;
        match read_record(&primary.join(METADATA_FILE)).await {
            Ok(Some(session)) if session.container_name == name => {
                return Ok(Some((primary, session)));
            }
            Ok(_) => {}
            Err(e) => warn!("skipping malformed session record in {}: {}", primary.display(), e),
        }

        Ok(self
            .scan()
            .await?
            .into_iter()
            .find(|(dir, session)| session.container_name == name && *dir != primary))
    }

    async fn scan(&self) -> StoreResult<Vec<(PathBuf, Session)>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir = entry.path();
            match read_record(&dir.join(METADATA_FILE)).await {
                Ok(Some(session)) => found.push((dir, session)),
                Ok(None) => {}
                Err(e) => warn!("skipping malformed session record in {}: {}", dir.display(), e),
            }
        }
        Ok(found)
    }
}

fn validate_key(name: &str) -> StoreResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

async fn read_record(path: &Path) -> StoreResult<Option<Session>> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.{}.tmp",
        file_name,
        uuid::Uuid::new_v4().simple()
    ))
}

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

/// Replace `path` with `data` in one step.
async fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let tmp = temp_path(path);
    let result = match write_synced(&tmp, data).await {
        Ok(()) => fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Publish `data` at `path` only if nothing is there yet.
///
/// The record is fully written before the link makes it visible.
async fn create_new(path: &Path, data: &[u8]) -> StoreResult<()> {
    let tmp = temp_path(path);
    let result = match write_synced(&tmp, data).await {
        Ok(()) => fs::hard_link(&tmp, path).await,
        Err(e) => Err(e),
    };
    let _ = fs::remove_file(&tmp).await;
    result.map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkMode;
    use tempfile::TempDir;

    fn session(name: &str) -> Session {
        Session::new(name, "/home/dev/project", 1, "images:ubuntu/24.04", NetworkMode::Open)
    }

    fn store() -> (TempDir, SessionStore) {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::new(temp.path().join("sessions"));
        (temp, store)
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let (_temp, store) = store();
        let s = session("isobox-abc-1");
        store.create(&s).await.unwrap();

        let found = store.find_by_container_name("isobox-abc-1").await.unwrap().unwrap();
        assert_eq!(found, s);
        assert!(!found.persistent);
        assert!(store.root().join("isobox-abc-1").join(METADATA_FILE).exists());
    }

    #[tokio::test]
    async fn test_find_missing_returns_none() {
        let (_temp, store) = store();
        assert!(store.find_by_container_name("isobox-abc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let (_temp, store) = store();
        store.create(&session("isobox-abc-1")).await.unwrap();
        let err = store.create(&session("isobox-abc-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_replaces_malformed_record() {
        let (_temp, store) = store();
        let dir = store.root().join("isobox-abc-1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(METADATA_FILE), b"{ truncated").unwrap();

        let s = session("isobox-abc-1");
        store.create(&s).await.unwrap();
        let found = store.find_by_container_name("isobox-abc-1").await.unwrap().unwrap();
        assert_eq!(found.session_id, s.session_id);
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped() {
        let (_temp, store) = store();
        store.create(&session("isobox-abc-1")).await.unwrap();
        store.create(&session("isobox-abc-2")).await.unwrap();

        let bad = store.root().join("isobox-bad-1");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join(METADATA_FILE), b"not json").unwrap();
        std::fs::write(store.root().join("stray.txt"), b"x").unwrap();

        assert_eq!(store.list().await.unwrap().len(), 2);
        assert!(store.find_by_container_name("isobox-abc-2").await.unwrap().is_some());
        assert!(store.find_by_container_name("isobox-bad-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_under_session_id_directory_is_found() {
        let (_temp, store) = store();
        let s = session("isobox-abc-3");
        let dir = store.root().join(&s.session_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(METADATA_FILE), serde_json::to_vec(&s).unwrap()).unwrap();

        let found = store.find_by_container_name("isobox-abc-3").await.unwrap().unwrap();
        assert_eq!(found.session_id, s.session_id);

        store.set_persistent("isobox-abc-3").await.unwrap();
        let raw: Session =
            serde_json::from_slice(&std::fs::read(dir.join(METADATA_FILE)).unwrap()).unwrap();
        assert!(raw.persistent);

        assert!(store.delete("isobox-abc-3").await.unwrap());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_set_persistent_is_idempotent() {
        let (_temp, store) = store();
        let s = session("isobox-abc-1");
        store.create(&s).await.unwrap();

        let first = store.set_persistent("isobox-abc-1").await.unwrap();
        assert!(first.persistent);
        assert!(first.updated_at >= s.updated_at);

        let second = store.set_persistent("isobox-abc-1").await.unwrap();
        assert!(second.persistent);
        assert_eq!(second.session_id, s.session_id);
        assert_eq!(second.created_at, s.created_at);
    }

    #[tokio::test]
    async fn test_set_persistent_missing_is_not_found() {
        let (_temp, store) = store();
        let err = store.set_persistent("isobox-abc-1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let (_temp, store) = store();
        store.create(&session("isobox-abc-1")).await.unwrap();
        assert!(store.delete("isobox-abc-1").await.unwrap());
        assert!(!store.delete("isobox-abc-1").await.unwrap());
        assert!(store.find_by_container_name("isobox-abc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writes_leave_no_temp_files() {
        let (_temp, store) = store();
        store.create(&session("isobox-abc-1")).await.unwrap();
        store.set_persistent("isobox-abc-1").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(store.root().join("isobox-abc-1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![METADATA_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let (_temp, store) = store();
        for name in ["", "../etc", "a/b", ".hidden"] {
            assert!(matches!(
                store.find_by_container_name(name).await,
                Err(StoreError::InvalidName(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_list_sorted_oldest_first() {
        let (_temp, store) = store();
        let mut older = session("isobox-abc-2");
        older.created_at = older.created_at - chrono::Duration::minutes(5);
        store.create(&session("isobox-abc-1")).await.unwrap();
        store.create(&older).await.unwrap();

        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.container_name)
            .collect();
        assert_eq!(names, vec!["isobox-abc-2", "isobox-abc-1"]);
    }
}
