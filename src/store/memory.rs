//! In-memory stores.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::{FileStore, LoadTestStore};
use crate::error::{AppError, AppResult};
use crate::models::{FileContent, FileUpload, LoadTest, QueryLoadTestsParams, TestFile};

#[derive(Default)]
pub struct MemoryLoadTestStore {
    tests: RwLock<HashMap<Uuid, LoadTest>>,
}

impl MemoryLoadTestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoadTestStore for MemoryLoadTestStore {
    async fn get(&self, id: Uuid) -> AppResult<Option<LoadTest>> {
        Ok(self.tests.read().expect("Store lock poisoned").get(&id).cloned())
    }

    async fn insert(&self, test: &LoadTest) -> AppResult<()> {
        let mut tests = self.tests.write().expect("Store lock poisoned");
        if tests.contains_key(&test.id) {
            return Err(AppError::InvalidInput(format!(
                "Load test {} already exists",
                test.id
            )));
        }
        tests.insert(test.id, test.clone());
        Ok(())
    }

    async fn update(&self, test: &LoadTest) -> AppResult<bool> {
        let mut tests = self.tests.write().expect("Store lock poisoned");
        match tests.get_mut(&test.id) {
            Some(existing) => {
                *existing = test.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> AppResult<bool> {
        Ok(self
            .tests
            .write()
            .expect("Store lock poisoned")
            .remove(&id)
            .is_some())
    }

    async fn list(&self, params: &QueryLoadTestsParams) -> AppResult<Vec<LoadTest>> {
        let mut matching: Vec<LoadTest> = self
            .tests
            .read()
            .expect("Store lock poisoned")
            .values()
            .filter(|t| params.matches(t))
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));

        Ok(matching
            .into_iter()
            .skip(params.clamped_offset())
            .take(params.clamped_limit())
            .collect())
    }

    async fn count(&self) -> AppResult<u64> {
        Ok(self.tests.read().expect("Store lock poisoned").len() as u64)
    }
}

#[derive(Default)]
struct FileTables {
    metadata: HashMap<Uuid, TestFile>,
    content: HashMap<Uuid, Vec<u8>>,
    /// test id -> current file id
    links: HashMap<Uuid, Uuid>,
}

#[derive(Default)]
pub struct MemoryFileStore {
    tables: RwLock<FileTables>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the content of a file while keeping its metadata.
    pub fn remove_content(&self, file_id: Uuid) -> bool {
        self.tables
            .write()
            .expect("Store lock poisoned")
            .content
            .remove(&file_id)
            .is_some()
    }

    /// Number of stored files, linked or not.
    pub fn file_count(&self) -> usize {
        self.tables.read().expect("Store lock poisoned").metadata.len()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn get_metadata_by_test_id(&self, test_id: Uuid) -> AppResult<Option<TestFile>> {
        let tables = self.tables.read().expect("Store lock poisoned");
        Ok(tables
            .links
            .get(&test_id)
            .and_then(|file_id| tables.metadata.get(file_id))
            .cloned())
    }

    async fn get_content(&self, file_id: Uuid) -> AppResult<Option<FileContent>> {
        let tables = self.tables.read().expect("Store lock poisoned");
        Ok(tables.content.get(&file_id).map(|bytes| FileContent {
            file_id,
            content: bytes.clone(),
        }))
    }

    async fn save_file(&self, test_id: Uuid, upload: FileUpload) -> AppResult<TestFile> {
        let now = Utc::now();
        let file = TestFile {
            id: Uuid::now_v7(),
            test_id,
            name: upload.original_name.clone(),
            file_type: upload.file_type.clone(),
            size: upload.size(),
            created_at: now,
            updated_at: now,
        };

        let mut tables = self.tables.write().expect("Store lock poisoned");
        tables.metadata.insert(file.id, file.clone());
        tables.content.insert(file.id, upload.bytes);

        Ok(file)
    }

    async fn link(&self, test_id: Uuid, file_id: Uuid) -> AppResult<()> {
        let mut tables = self.tables.write().expect("Store lock poisoned");
        match tables.metadata.get(&file_id) {
            Some(file) if file.test_id == test_id => {
                tables.links.insert(test_id, file_id);
                Ok(())
            }
            Some(file) => Err(AppError::PreconditionFailed(format!(
                "file {} belongs to load test {}, not {}",
                file_id, file.test_id, test_id
            ))),
            None => Err(AppError::InvalidInput(format!("Unknown file {}", file_id))),
        }
    }

    async fn delete_file(&self, file_id: Uuid) -> AppResult<bool> {
        let mut tables = self.tables.write().expect("Store lock poisoned");
        tables.content.remove(&file_id);
        tables.links.retain(|_, f| *f != file_id);
        Ok(tables.metadata.remove(&file_id).is_some())
    }

    async fn delete_by_test_id(&self, test_id: Uuid) -> AppResult<u64> {
        let mut tables = self.tables.write().expect("Store lock poisoned");
        tables.links.remove(&test_id);

        let file_ids: Vec<Uuid> = tables
            .metadata
            .values()
            .filter(|f| f.test_id == test_id)
            .map(|f| f.id)
            .collect();

        for id in &file_ids {
            tables.metadata.remove(id);
            tables.content.remove(id);
        }

        Ok(file_ids.len() as u64)
    }
}
