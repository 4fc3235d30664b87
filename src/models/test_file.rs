//! Test file models: declared file types, file metadata and content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// File types known to this server.
///
/// The declared type on a [`TestFile`] is stored as a string so that files of
/// types without a registered engine can still be stored and reported on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoadTestFileType {
    /// Apache JMeter test plan.
    Jmx,
}

impl LoadTestFileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jmx => "JMX",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match normalize_file_type(s).as_str() {
            "JMX" => Some(Self::Jmx),
            _ => None,
        }
    }
}

impl std::fmt::Display for LoadTestFileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical form of a declared file type (trimmed, upper case).
pub fn normalize_file_type(s: &str) -> String {
    s.trim().to_uppercase()
}

/// Metadata of the file currently associated with a load test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TestFile {
    pub id: Uuid,
    /// Load test this file is associated with.
    pub test_id: Uuid,
    /// Original file name.
    pub name: String,
    /// Declared file type, e.g. `JMX`.
    pub file_type: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw file content.
#[derive(Debug, Clone, PartialEq)]
pub struct FileContent {
    pub file_id: Uuid,
    pub content: Vec<u8>,
}

/// An uploaded file as supplied by the caller of save/edit.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub original_name: String,
    pub file_type: String,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    /// Create a JMX upload.
    pub fn jmx(original_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(original_name, LoadTestFileType::Jmx.as_str(), bytes)
    }

    pub fn new(
        original_name: impl Into<String>,
        file_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            original_name: original_name.into(),
            file_type: normalize_file_type(&file_type.into()),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> i64 {
        self.bytes.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
