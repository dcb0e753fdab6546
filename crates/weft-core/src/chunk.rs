//! Token chunks and the allocation pool behind them.
//!
//! Streams produce many short-lived chunks; the pool recycles their token
//! vectors instead of allocating fresh ones per chunk. A recycled vector is
//! cleared before it leaves the pool, so no tokens leak between streams.

use std::ops::Deref;
use std::sync::{Arc, Mutex};

use weft_proto::notify::ChunkParams;

/// Token storage on loan from a [`ChunkPool`]; returns itself on drop.
pub struct PooledTokens {
    texts: Vec<String>,
    pool: Arc<Mutex<Vec<Vec<String>>>>,
}

impl Deref for PooledTokens {
    type Target = [String];

    fn deref(&self) -> &[String] {
        &self.texts
    }
}

impl std::fmt::Debug for PooledTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.texts.iter()).finish()
    }
}

impl Drop for PooledTokens {
    fn drop(&mut self) {
        let mut texts = std::mem::take(&mut self.texts);
        texts.clear();
        let mut free = self.pool.lock().expect("pool lock");
        if free.len() < MAX_POOLED {
            free.push(texts);
        }
    }
}

const MAX_POOLED: usize = 256;

/// One routed chunk of a token stream.
#[derive(Debug)]
pub struct TokenChunk {
    pub tokens: PooledTokens,
    pub is_final: bool,
}

impl TokenChunk {
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Concatenated text of the chunk.
    pub fn text(&self) -> String {
        self.tokens.concat()
    }
}

/// Recycles token vectors across chunks.
#[derive(Clone, Default)]
pub struct ChunkPool {
    free: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ChunkPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a chunk from a runtime `stream.chunk` notification.
    pub fn chunk_from(&self, params: &ChunkParams) -> TokenChunk {
        let mut texts = self
            .free
            .lock()
            .expect("pool lock")
            .pop()
            .unwrap_or_default();
        debug_assert!(texts.is_empty());
        if let Some(one) = &params.token {
            texts.push(one.clone());
        } else if let Some(batch) = &params.tokens {
            texts.extend(batch.iter().cloned());
        }
        TokenChunk {
            tokens: PooledTokens {
                texts,
                pool: Arc::clone(&self.free),
            },
            is_final: params.is_final,
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::StreamId;

    fn params(tokens: &[&str]) -> ChunkParams {
        ChunkParams {
            stream_id: StreamId::new("s"),
            token: None,
            tokens: Some(tokens.iter().map(|t| (*t).to_owned()).collect()),
            is_final: false,
        }
    }

    #[test]
    fn dropping_a_chunk_recycles_its_vector() {
        let pool = ChunkPool::new();
        let chunk = pool.chunk_from(&params(&["a", "b"]));
        assert_eq!(chunk.token_count(), 2);
        drop(chunk);
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn recycled_storage_is_empty_on_reuse() {
        let pool = ChunkPool::new();
        drop(pool.chunk_from(&params(&["secret", "tokens"])));

        let fresh = pool.chunk_from(&params(&[]));
        assert_eq!(fresh.token_count(), 0, "no leakage from the earlier stream");
    }

    #[test]
    fn chunk_text_concatenates_in_order() {
        let pool = ChunkPool::new();
        let chunk = pool.chunk_from(&params(&["he", "llo"]));
        assert_eq!(chunk.text(), "hello");
    }
}
