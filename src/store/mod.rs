//! Storage seams for load test definitions and their files.
//!
//! The orchestrator only reads through these traits; persistence schemas for
//! definitions and files belong to whoever provides the implementation.

pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{FileContent, FileUpload, LoadTest, QueryLoadTestsParams, TestFile};

pub use memory::{MemoryFileStore, MemoryLoadTestStore};

/// Load test definitions.
#[async_trait]
pub trait LoadTestStore: Send + Sync {
    async fn get(&self, id: Uuid) -> AppResult<Option<LoadTest>>;

    async fn insert(&self, test: &LoadTest) -> AppResult<()>;

    /// Replace an existing definition. Returns false when it does not exist.
    async fn update(&self, test: &LoadTest) -> AppResult<bool>;

    async fn delete(&self, id: Uuid) -> AppResult<bool>;

    /// Filtered page, most recently updated first.
    async fn list(&self, params: &QueryLoadTestsParams) -> AppResult<Vec<LoadTest>>;

    async fn count(&self) -> AppResult<u64>;
}

/// Test file metadata, content and the test-to-file association.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Metadata of the file currently linked to a load test.
    async fn get_metadata_by_test_id(&self, test_id: Uuid) -> AppResult<Option<TestFile>>;

    async fn get_content(&self, file_id: Uuid) -> AppResult<Option<FileContent>>;

    /// Store metadata and content for a file belonging to `test_id`.
    /// The file is not linked until [`FileStore::link`] is called.
    async fn save_file(&self, test_id: Uuid, upload: FileUpload) -> AppResult<TestFile>;

    /// Make `file_id` the current file of `test_id`.
    async fn link(&self, test_id: Uuid, file_id: Uuid) -> AppResult<()>;

    /// Remove a stored file and any link to it.
    async fn delete_file(&self, file_id: Uuid) -> AppResult<bool>;

    /// Remove the link and every file stored for `test_id`. Returns the number
    /// of files removed.
    async fn delete_by_test_id(&self, test_id: Uuid) -> AppResult<u64>;
}
