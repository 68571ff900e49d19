//! Document names

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Document name - UTF-8 string, max 512 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentName(String);

impl DocumentName {
    /// Create a new document name, validating the format
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(Error::InvalidDocumentName("Document name cannot be empty".into()));
        }

        if name.len() > 512 {
            return Err(Error::InvalidDocumentName("Document name exceeds 512 bytes".into()));
        }

        // Validate pattern: [a-zA-Z0-9:_.-]+
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.'))
        {
            return Err(Error::InvalidDocumentName(
                "Document name must match pattern [a-zA-Z0-9:_.-]+".into(),
            ));
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DocumentName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DocumentName> for String {
    fn from(name: DocumentName) -> Self {
        name.0
    }
}

impl std::fmt::Display for DocumentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_name_valid() {
        assert!(DocumentName::new("notes:123").is_ok());
        assert!(DocumentName::new("draft_2024-01.md").is_ok());
    }

    #[test]
    fn test_document_name_invalid() {
        assert!(DocumentName::new("").is_err());
        assert!(DocumentName::new("notes/123").is_err()); // invalid char
        assert!(DocumentName::new("a".repeat(513)).is_err()); // too long
    }

    #[test]
    fn test_document_name_deserialize_validates() {
        assert!(serde_json::from_str::<DocumentName>("\"ok:1\"").is_ok());
        assert!(serde_json::from_str::<DocumentName>("\"bad name\"").is_err());
    }
}
