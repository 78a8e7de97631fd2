//! Minimal namespaced vocabulary
//!
//! The dispatcher only needs token-index and token-count lookups by namespace
//! plus a padding-token identity; full vocabulary management (counting,
//! pruning, serialization) lives outside this crate.

use std::collections::HashMap;

/// Token reserved for padding. Always index 0 in every namespace.
pub const PADDING_TOKEN: &str = "@@PADDING@@";

/// Token reserved for out-of-vocabulary words. Always index 1.
pub const UNK_TOKEN: &str = "@@UNKNOWN@@";

/// Namespaced token/index mapping
#[derive(Debug, Clone, Default)]
pub struct Vocab {
    tokens: HashMap<String, Vec<String>>,
    indices: HashMap<String, HashMap<String, usize>>,
}

impl Vocab {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_namespace(&mut self, namespace: &str) {
        if !self.tokens.contains_key(namespace) {
            self.tokens.insert(namespace.to_string(), Vec::new());
            self.indices.insert(namespace.to_string(), HashMap::new());
            self.add_token(namespace, PADDING_TOKEN);
            self.add_token(namespace, UNK_TOKEN);
        }
    }

    /// Add a token to a namespace, returning its index.
    /// Adding an existing token returns the existing index.
    pub fn add_token(&mut self, namespace: &str, token: &str) -> usize {
        self.ensure_namespace(namespace);
        let index_map = self.indices.get_mut(namespace).unwrap();
        if let Some(&idx) = index_map.get(token) {
            return idx;
        }
        let toks = self.tokens.get_mut(namespace).unwrap();
        let idx = toks.len();
        toks.push(token.to_string());
        index_map.insert(token.to_string(), idx);
        idx
    }

    /// Number of tokens in a namespace (0 if the namespace does not exist).
    pub fn size(&self, namespace: &str) -> usize {
        self.tokens.get(namespace).map_or(0, Vec::len)
    }

    /// Index of a token in a namespace, falling back to the unknown token.
    pub fn index(&self, namespace: &str, token: &str) -> usize {
        self.indices
            .get(namespace)
            .and_then(|m| m.get(token).copied())
            .unwrap_or(1)
    }

    /// The padding index shared by every namespace.
    pub fn padding_index(&self) -> usize {
        0
    }

    /// Build a vocabulary with `n` synthetic word tokens, for tests and demos.
    pub fn with_n_words(n: usize) -> Self {
        let mut vocab = Self::new();
        for i in 0..n {
            vocab.add_token("tokens", &format!("w{i}"));
        }
        vocab
    }
}
