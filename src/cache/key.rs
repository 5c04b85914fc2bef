// Cache key derivation
//
// Priority: external id → normalized title + first author → surrogate id.
// Documents with none of these are never cached.

use crate::document::Document;

/// Maximum number of title characters that participate in the composite identity
const TITLE_MAX_CHARS: usize = 96;

/// Derive the stable identity string of a document
///
/// The identity is stored inside each cache entry and compared on read, so two
/// documents that hash to the same storage key can never be served each
/// other's vectors.
pub fn derive_identity(doc: &Document) -> Option<String> {
    if let Some(external) = doc.external_id.as_deref() {
        let external = external.trim().to_lowercase();
        if !external.is_empty() {
            return Some(format!("ext:{}", external));
        }
    }

    let title = doc.title.as_deref().map(normalize).unwrap_or_default();
    let author = doc.first_author().map(normalize).unwrap_or_default();
    if !title.is_empty() && !author.is_empty() {
        let title: String = title.chars().take(TITLE_MAX_CHARS).collect();
        return Some(format!("meta:{}|{}", title.trim_end(), author));
    }

    if let Some(surrogate) = doc.surrogate_id.as_deref() {
        let surrogate = surrogate.trim();
        if !surrogate.is_empty() {
            return Some(format!("sid:{}", surrogate));
        }
    }

    None
}

/// Namespaced, schema-versioned storage key for an identity
///
/// Bumping the schema version orphans every entry written under the old one.
pub fn storage_key(namespace: &str, schema_version: u32, identity: &str) -> String {
    let hash = blake3::hash(identity.as_bytes());
    format!("{}:v{}:{:.32}", namespace, schema_version, hash.to_hex())
}

/// Lowercase, replace punctuation with spaces and collapse whitespace
pub fn normalize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
