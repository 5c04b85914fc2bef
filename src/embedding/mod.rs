/// Embedding providers
///
/// - EmbeddingProvider trait shared by pool workers and the fallback path
/// - FastEmbedProvider for local model inference (all-MiniLM-L6-v2, 384-dim)
/// - HashEmbedProvider for deterministic offline vectors
/// - Cosine similarity used by the tier scorer
mod provider;
mod similarity;

pub use provider::{EmbeddingError, EmbeddingProvider, FastEmbedProvider, HashEmbedProvider};
pub use similarity::cosine_similarity;

use std::sync::Arc;

/// Build the provider named by the configuration
///
/// `mode = "hash"` never touches the network; any other mode loads the
/// FastEmbed model named by `model`.
pub fn provider_from_config(
    config: &crate::config::EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    match config.mode.as_str() {
        "hash" => Ok(Arc::new(HashEmbedProvider::new(config.dimension))),
        _ => {
            let provider = FastEmbedProvider::new(&config.model)?;
            if provider.dimension() != config.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: config.dimension,
                    actual: provider.dimension(),
                });
            }
            Ok(Arc::new(provider))
        }
    }
}
