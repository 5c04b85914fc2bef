//! Documents handed to the ranker
//!
//! The ranker only reads identity fields and `text`, and only ever writes `score`.

use crate::error::{Result, TierankError};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;

/// A unit to be ranked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable external handle (DOI, URL, global id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    /// Descriptive title, used for the composite identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Authors in source order; only the first one participates in identity
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,

    /// Internal surrogate id assigned by the source layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surrogate_id: Option<String>,

    /// Text the embedding vector is derived from
    #[serde(default)]
    pub text: String,

    /// Similarity to the query, attached by the ranker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,

    /// Opaque caller metadata, carried through untouched
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Document {
    /// Create a document with only a text payload
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            external_id: None,
            title: None,
            authors: Vec::new(),
            surrogate_id: None,
            text: text.into(),
            score: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.authors.push(author.into());
        self
    }

    pub fn with_surrogate_id(mut self, id: impl Into<String>) -> Self {
        self.surrogate_id = Some(id.into());
        self
    }

    /// First author, if any
    pub fn first_author(&self) -> Option<&str> {
        self.authors.first().map(|a| a.as_str())
    }
}

/// Load documents from a JSON-lines file (one document per line, blank lines skipped)
pub fn load_jsonl(path: &Path) -> Result<Vec<Document>> {
    let file = std::fs::File::open(path).map_err(|e| TierankError::Io {
        source: e,
        context: format!("Failed to open document file: {}", path.display()),
    })?;

    let reader = std::io::BufReader::new(file);
    let mut documents = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| TierankError::Io {
            source: e,
            context: format!("Failed to read line {} of {}", line_no + 1, path.display()),
        })?;

        if line.trim().is_empty() {
            continue;
        }

        let doc: Document = serde_json::from_str(&line).map_err(|e| TierankError::Json {
            source: e,
            context: format!("Invalid document on line {}", line_no + 1),
        })?;
        documents.push(doc);
    }

    Ok(documents)
}
