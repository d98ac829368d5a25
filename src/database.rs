use crate::context::ObjectContext;
use crate::record::Record;
use crate::storage::buffer::{CacheConfig, PageCache};
use crate::storage::disk::{PageManager, DEFAULT_PAGE_SIZE};
use crate::storage::provider::PageProvider;
use crate::storage::stats::Statistics;
use anyhow::{bail, Context as _, Result};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Page size for new files. Existing files keep their own.
    pub page_size: usize,
    pub cache: CacheConfig,
    /// Timeout for object latches and the index lock. Zero waits forever.
    pub lock_timeout: Duration,
    /// Stored on the control page when the file is created.
    pub description: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            page_size: DEFAULT_PAGE_SIZE,
            cache: CacheConfig::default(),
            lock_timeout: Duration::from_secs(30),
            description: None,
        }
    }
}

/// Object database backed by a single file.
pub struct Database {
    path: PathBuf,
    cache: Arc<PageCache>,
    context: ObjectContext,
}

impl Database {
    /// Create a new database file
    pub fn create(path: &Path, config: DatabaseConfig) -> Result<Self> {
        if path.exists() {
            bail!("Database file already exists at {:?}", path);
        }

        let page_manager = PageManager::create(path, config.page_size)
            .with_context(|| format!("Failed to create {:?}", path))?;
        let cache = Arc::new(PageCache::new(Box::new(page_manager), config.cache));
        let provider: Arc<dyn PageProvider> = cache.clone();
        let context = ObjectContext::create(
            provider,
            config.description.as_deref(),
            config.lock_timeout,
        )?;
        info!("Created database {:?}", path);

        Ok(Self {
            path: path.to_path_buf(),
            cache,
            context,
        })
    }

    /// Open an existing database file
    pub fn open(path: &Path, config: DatabaseConfig) -> Result<Self> {
        if !path.exists() {
            bail!("Database file does not exist at {:?}", path);
        }

        let page_manager =
            PageManager::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let cache = Arc::new(PageCache::new(Box::new(page_manager), config.cache));
        let provider: Arc<dyn PageProvider> = cache.clone();
        let context = ObjectContext::open(provider, config.lock_timeout)?;
        info!(
            "Opened database {:?} with {} objects",
            path,
            context.object_count()
        );

        Ok(Self {
            path: path.to_path_buf(),
            cache,
            context,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn context(&self) -> &ObjectContext {
        &self.context
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn add(&self, record: &mut Record) -> Result<i64> {
        Ok(self.context.add(record)?)
    }

    pub fn get(&self, id: i64) -> Result<Option<Record>> {
        Ok(self.context.get(id)?)
    }

    pub fn update(&self, record: &Record) -> Result<Option<u32>> {
        Ok(self.context.update(record)?)
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        Ok(self.context.delete(id)?)
    }

    /// Object context and page cache counters
    pub fn statistics(&self) -> (Statistics, Statistics) {
        (self.context.statistics(), self.cache.statistics())
    }

    /// Flush all dirty pages to disk
    pub fn flush(&self) -> Result<()> {
        self.context.flush()?;
        Ok(())
    }

    /// Flush and release the file. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        self.context.close()?;
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Best effort close on drop
        if let Err(e) = self.close() {
            warn!("Failed to close {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use tempfile::tempdir;

    fn small_config() -> DatabaseConfig {
        DatabaseConfig {
            page_size: 512,
            description: Some("unit test".to_string()),
            ..DatabaseConfig::default()
        }
    }

    #[test]
    fn test_create_database() -> Result<()> {
        let dir = tempdir()?;
        let db_path = dir.path().join("test.db");

        let db = Database::create(&db_path, small_config())?;
        assert!(db_path.exists());
        assert_eq!(db.context().description(), Some("unit test"));
        assert_eq!(db.context().object_count(), 0);
        assert_eq!(db.cache().page_size(), 512);

        Ok(())
    }

    #[test]
    fn test_create_duplicate_database() -> Result<()> {
        let dir = tempdir()?;
        let db_path = dir.path().join("test.db");

        let _db = Database::create(&db_path, small_config())?;

        let result = Database::create(&db_path, small_config());
        assert!(result.is_err());
        let err_msg = result.err().unwrap().to_string();
        assert!(err_msg.contains("already exists"));

        Ok(())
    }

    #[test]
    fn test_open_nonexistent_database() -> Result<()> {
        let dir = tempdir()?;
        let db_path = dir.path().join("nonexistent.db");

        let result = Database::open(&db_path, DatabaseConfig::default());
        assert!(result.is_err());
        let err_msg = result.err().unwrap().to_string();
        assert!(err_msg.contains("does not exist"));

        Ok(())
    }

    #[test]
    fn test_invalid_page_size() -> Result<()> {
        let dir = tempdir()?;
        let config = DatabaseConfig {
            page_size: 1000,
            ..DatabaseConfig::default()
        };
        assert!(Database::create(&dir.path().join("test.db"), config).is_err());
        Ok(())
    }

    #[test]
    fn test_object_operations() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::create(&dir.path().join("test.db"), small_config())?;

        let mut record = Record::with_class("Item").with("name", "lamp");
        let id = db.add(&mut record)?;

        record.set("price", 12.5);
        assert_eq!(db.update(&record)?, Some(2));
        assert_eq!(db.get(id)?.unwrap().get("price"), Some(&Value::Float(12.5)));

        assert!(db.delete(id)?);
        assert_eq!(db.get(id)?, None);

        let (objects, _) = db.statistics();
        assert_eq!(objects.count, 4);
        Ok(())
    }

    #[test]
    fn test_persistence() -> Result<()> {
        let dir = tempdir()?;
        let db_path = dir.path().join("test.db");

        let id = {
            let db = Database::create(&db_path, small_config())?;
            let mut record = Record::new().with("data", "Persistent data");
            let id = db.add(&mut record)?;
            db.flush()?;
            id
        };

        {
            let db = Database::open(&db_path, DatabaseConfig::default())?;
            assert_eq!(db.cache().page_size(), 512);
            assert_eq!(db.context().description(), Some("unit test"));

            let record = db.get(id)?.expect("Data should persist");
            assert_eq!(
                record.get("data"),
                Some(&Value::Text("Persistent data".to_string()))
            );
        }

        Ok(())
    }

    #[test]
    fn test_close_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::create(&dir.path().join("test.db"), small_config())?;
        db.close()?;
        db.close()?;
        assert!(db.add(&mut Record::new()).is_err());
        Ok(())
    }
}
