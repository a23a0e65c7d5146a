use crate::error::{EscrowError, Result};
use serde::{Deserialize, Serialize};

/// Reference to an already-uploaded attachment.
///
/// The upload collaborator hands these back; the core never fetches or
/// interprets the content, it only records the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub url: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
}

impl FileRef {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(EscrowError::InvalidArgument(
                "file reference has empty url".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(EscrowError::InvalidArgument(
                "file reference has empty name".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty_fields() {
        let file = FileRef {
            url: String::new(),
            name: "report.pdf".to_string(),
            content_id: None,
        };
        assert!(file.validate().is_err());

        let file = FileRef {
            url: "https://blobs.example/abc".to_string(),
            name: " ".to_string(),
            content_id: None,
        };
        assert!(file.validate().is_err());

        let file = FileRef {
            url: "https://blobs.example/abc".to_string(),
            name: "report.pdf".to_string(),
            content_id: Some("bafy123".to_string()),
        };
        assert!(file.validate().is_ok());
    }
}
