use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;

use ingest_core::Result;

/// 滚动日志
///
/// JSON 数组文件，每次追加后只保留最近 `cap` 条，最旧的条目
/// 静默丢弃。文件缺失或损坏时从空日志重新开始。
/// 追加是读-改-写整个文件，并发追加必须串行化，否则互相覆盖丢条目。
pub struct RollingJournal {
    path: PathBuf,
    cap: usize,
    write_lock: Mutex<()>,
}

impl RollingJournal {
    pub fn new(path: impl Into<PathBuf>, cap: usize) -> Self {
        Self {
            path: path.into(),
            cap: cap.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append<T: Serialize>(&self, entry: &T) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut entries = self.read_all().await?;
        entries.push(serde_json::to_value(entry)?);

        if entries.len() > self.cap {
            let excess = entries.len() - self.cap;
            entries.drain(..excess);
        }

        fs::write(&self.path, serde_json::to_vec_pretty(&entries)?).await?;
        Ok(())
    }

    pub async fn read_all(&self) -> Result<Vec<serde_json::Value>> {
        match fs::read(&self.path).await {
            Ok(data) => Ok(serde_json::from_slice(&data).unwrap_or_default()),
            Err(_) => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RollingJournal::new(dir.path().join("issues.json"), 10);

        journal.append(&json!({"job_id": "a"})).await.unwrap();
        journal.append(&json!({"job_id": "b"})).await.unwrap();

        let entries = journal.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["job_id"], "a");
        assert_eq!(entries[1]["job_id"], "b");
    }

    #[tokio::test]
    async fn test_cap_drops_oldest_entries() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RollingJournal::new(dir.path().join("health.json"), 3);

        for i in 0..5 {
            journal.append(&json!({"seq": i})).await.unwrap();
        }

        let entries = journal.read_all().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["seq"], 2);
        assert_eq!(entries[2]["seq"], 4);
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let journal = RollingJournal::new(&path, 10);
        assert!(journal.read_all().await.unwrap().is_empty());

        journal.append(&json!({"ok": true})).await.unwrap();
        assert_eq!(journal.read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_appends_preserve_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(RollingJournal::new(dir.path().join("issues.json"), 100));

        let mut handles = Vec::new();
        for seq in 0..20 {
            let journal = Arc::clone(&journal);
            handles.push(tokio::spawn(async move {
                journal.append(&json!({ "seq": seq })).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entries = journal.read_all().await.unwrap();
        assert_eq!(entries.len(), 20, "并发追加不能丢条目");
    }
}
