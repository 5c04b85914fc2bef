// Vector resolution and ordering shared by the tier scorer and the
// single-shot ranker

use super::embedder::Embedder;
use super::RankError;
use crate::cache::VectorCache;
use crate::document::Document;
use crate::embedding::cosine_similarity;
use std::cmp::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A document's position in the caller's input and its similarity score
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Scored {
    pub position: usize,
    pub score: f32,
}

/// Vectors for a slice of documents plus where they came from
#[derive(Debug, Default)]
pub(crate) struct Resolved {
    pub vectors: Vec<Option<Vec<f32>>>,
    pub cache_hits: usize,
    pub computed: usize,
    pub failed: usize,
    pub degraded: bool,
}

/// Cache first, embedder for the misses, then write new vectors back
///
/// Vectors whose length differs from `dimension` are unusable: from the
/// cache they become misses, from the embedder they count as failed.
pub(crate) async fn resolve_vectors(
    cache: &VectorCache,
    embedder: &Embedder,
    documents: &[Document],
    dimension: usize,
    cancel: &CancellationToken,
) -> Result<Resolved, RankError> {
    let lookup = cache.get_many(documents).await;
    let mut vectors: Vec<Option<Vec<f32>>> = vec![None; documents.len()];
    let mut misses = lookup.misses;
    let mut cache_hits = 0;

    for (idx, vector) in lookup.hits {
        if vector.len() == dimension {
            vectors[idx] = Some(vector);
            cache_hits += 1;
        } else {
            misses.push(idx);
        }
    }
    misses.sort_unstable();

    // Blank texts have nothing to embed and would sink the whole batch
    let (misses, blank): (Vec<usize>, Vec<usize>) = misses
        .into_iter()
        .partition(|&i| !documents[i].text.trim().is_empty());
    if !blank.is_empty() {
        warn!("{} documents have no text to embed, leaving them unranked", blank.len());
    }

    let texts = misses.iter().map(|&i| documents[i].text.clone()).collect();
    let embedded = embedder.embed(texts, cancel).await?;

    let mut computed = Vec::with_capacity(misses.len());
    let mut failed = blank.len();
    for (&idx, vector) in misses.iter().zip(embedded.vectors) {
        match vector {
            Some(v) if v.len() == dimension => {
                vectors[idx] = Some(v);
                computed.push(idx);
            }
            Some(v) => {
                warn!(
                    "Discarding vector of dimension {} (expected {})",
                    v.len(),
                    dimension
                );
                failed += 1;
            }
            None => failed += 1,
        }
    }

    let writes: Vec<(&Document, &[f32])> = computed
        .iter()
        .filter_map(|&i| vectors[i].as_deref().map(|v| (&documents[i], v)))
        .collect();
    cache.set_many(&writes).await;

    Ok(Resolved {
        vectors,
        cache_hits,
        computed: computed.len(),
        failed,
        degraded: lookup.degraded || embedded.degraded,
    })
}

/// Score resolved vectors against the query, skipping the unresolved
pub(crate) fn score_vectors(
    query: &[f32],
    offset: usize,
    vectors: &[Option<Vec<f32>>],
) -> Vec<Scored> {
    vectors
        .iter()
        .enumerate()
        .filter_map(|(i, vector)| {
            vector.as_ref().map(|v| Scored {
                position: offset + i,
                score: cosine_similarity(query, v),
            })
        })
        .collect()
}

/// Descending score; equal scores keep input order
pub(crate) fn sort_scored(scored: &mut [Scored]) {
    scored.sort_by(|a, b| match b.score.total_cmp(&a.score) {
        Ordering::Equal => a.position.cmp(&b.position),
        other => other,
    });
}

/// Copies of the scored documents, in ranked order, with `score` attached
pub(crate) fn materialize(documents: &[Document], scored: &[Scored]) -> Vec<Document> {
    scored
        .iter()
        .map(|s| {
            let mut doc = documents[s.position].clone();
            doc.score = Some(s.score);
            doc
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ties_keep_input_order() {
        let mut scored = vec![
            Scored { position: 2, score: 0.5 },
            Scored { position: 0, score: 0.5 },
            Scored { position: 1, score: 0.9 },
            Scored { position: 3, score: -0.1 },
        ];
        sort_scored(&mut scored);

        let order: Vec<usize> = scored.iter().map(|s| s.position).collect();
        assert_eq!(order, vec![1, 0, 2, 3]);
    }

    #[test]
    fn test_score_vectors_skips_missing() {
        let query = vec![1.0, 0.0];
        let vectors = vec![Some(vec![1.0, 0.0]), None, Some(vec![0.0, 1.0])];

        let scored = score_vectors(&query, 10, &vectors);
        assert_eq!(scored.len(), 2);
        assert_eq!(scored[0].position, 10);
        assert!((scored[0].score - 1.0).abs() < 1e-6);
        assert_eq!(scored[1].position, 12);
    }

    #[test]
    fn test_materialize_attaches_scores() {
        let docs = vec![Document::new("a"), Document::new("b")];
        let scored = vec![
            Scored { position: 1, score: 0.7 },
            Scored { position: 0, score: 0.2 },
        ];

        let ranked = materialize(&docs, &scored);
        assert_eq!(ranked[0].text, "b");
        assert_eq!(ranked[0].score, Some(0.7));
        assert_eq!(ranked[1].score, Some(0.2));
        assert_eq!(docs[0].score, None);
    }
}
