//! Run context: the immutable snapshot an engine needs for one run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{FileContent, LoadTest, TestFile};

/// Everything an engine needs to execute one run.
///
/// Built fresh for every run request and never persisted. Cloning is cheap,
/// the file content is shared.
#[derive(Clone)]
pub struct RunContext {
    test_id: Uuid,
    test_name: String,
    project_id: String,
    file_id: Uuid,
    file_name: String,
    file_type: String,
    content: Arc<[u8]>,
    params: BTreeMap<String, String>,
}

impl RunContext {
    /// Build a context from a load test, its associated file and the file content.
    ///
    /// Fails with `PreconditionFailed` when the three do not belong together.
    pub fn build(test: &LoadTest, file: &TestFile, content: FileContent) -> AppResult<Self> {
        if file.test_id != test.id {
            return Err(AppError::PreconditionFailed(format!(
                "file {} is associated with load test {}, not {}",
                file.id, file.test_id, test.id
            )));
        }

        if content.file_id != file.id {
            return Err(AppError::PreconditionFailed(format!(
                "content belongs to file {}, expected file {}",
                content.file_id, file.id
            )));
        }

        Ok(Self {
            test_id: test.id,
            test_name: test.name.clone(),
            project_id: test.project_id.clone(),
            file_id: file.id,
            file_name: file.name.clone(),
            file_type: file.file_type.clone(),
            content: Arc::from(content.content),
            params: BTreeMap::new(),
        })
    }

    /// Attach engine-specific parameters.
    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn test_id(&self) -> Uuid {
        self.test_id
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn file_id(&self) -> Uuid {
        self.file_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_type(&self) -> &str {
        &self.file_type
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("test_id", &self.test_id)
            .field("test_name", &self.test_name)
            .field("file_id", &self.file_id)
            .field("file_type", &self.file_type)
            .field("content_len", &self.content.len())
            .field("params", &self.params)
            .finish()
    }
}
