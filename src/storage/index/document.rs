// Copyright 2025 Rangekv Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Inverted document index
//!
//! Text fields are tokenized into lowercase terms; each (field, term)
//! pair maps to a posting set of document ids. Queries match documents
//! containing every query term in the target field, ranked by how many
//! occurrences of distinct query terms the document's other fields add.

use std::fs;
use std::path::Path;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::core::{DocumentWithId, Error, Result, ScalarValue};
use crate::storage::index::rowcodec::{decode_document_row, encode_document_row};
use crate::storage::index::PreFilter;

const FILE_MAGIC: &[u8; 8] = b"RKVDOCS1";

/// Lowercased alphanumeric terms
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// A ranked match
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentHit {
    pub id: i64,
    pub score: f32,
}

/// In-memory inverted index over document rows
pub struct DocumentIndex {
    docs: FxHashMap<i64, DocumentWithId>,
    /// field → term → posting set
    postings: FxHashMap<String, FxHashMap<String, FxHashSet<i64>>>,
}

impl DocumentIndex {
    pub fn new() -> Self {
        Self {
            docs: FxHashMap::default(),
            postings: FxHashMap::default(),
        }
    }

    fn index_doc(&mut self, doc: &DocumentWithId) {
        for (field, value) in &doc.fields {
            if let ScalarValue::Text(text) = value {
                let field_postings = self.postings.entry(field.clone()).or_default();
                for term in tokenize(text) {
                    field_postings.entry(term).or_default().insert(doc.id);
                }
            }
        }
    }

    fn unindex_doc(&mut self, doc: &DocumentWithId) {
        for (field, value) in &doc.fields {
            if let ScalarValue::Text(text) = value {
                if let Some(field_postings) = self.postings.get_mut(field) {
                    for term in tokenize(text) {
                        if let Some(set) = field_postings.get_mut(&term) {
                            set.remove(&doc.id);
                            if set.is_empty() {
                                field_postings.remove(&term);
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn add_or_upsert(&mut self, rows: &[DocumentWithId]) -> Result<()> {
        for row in rows {
            if let Some(old) = self.docs.remove(&row.id) {
                self.unindex_doc(&old);
            }
            self.index_doc(row);
            self.docs.insert(row.id, row.clone());
        }
        Ok(())
    }

    pub fn delete(&mut self, ids: &[i64]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            if let Some(old) = self.docs.remove(id) {
                self.unindex_doc(&old);
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn get(&self, id: i64) -> Option<&DocumentWithId> {
        self.docs.get(&id)
    }

    /// All live document ids
    pub fn ids(&self) -> Vec<i64> {
        self.docs.keys().copied().collect()
    }

    /// Documents in `field` containing *all* query terms, best first.
    /// Top-k is taken over the filtered set.
    pub fn search(
        &self,
        field: &str,
        query: &str,
        top_k: usize,
        filter: Option<&dyn PreFilter>,
    ) -> Result<Vec<DocumentHit>> {
        let terms = tokenize(query);
        if terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let Some(field_postings) = self.postings.get(field) else {
            return Ok(Vec::new());
        };

        // Intersect posting sets, smallest first
        let mut sets: Vec<&FxHashSet<i64>> = Vec::with_capacity(terms.len());
        for term in &terms {
            match field_postings.get(term) {
                Some(set) => sets.push(set),
                None => return Ok(Vec::new()),
            }
        }
        sets.sort_by_key(|s| s.len());

        let mut hits: Vec<DocumentHit> = sets[0]
            .iter()
            .filter(|id| sets[1..].iter().all(|s| s.contains(id)))
            .filter(|id| filter.map(|f| f.matches(**id)).unwrap_or(true))
            .map(|&id| DocumentHit {
                id,
                score: self.score(id, &terms),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Distinct query terms found across all text fields of the document
    fn score(&self, id: i64, terms: &[String]) -> f32 {
        let Some(doc) = self.docs.get(&id) else {
            return 0.0;
        };
        let mut score = 0usize;
        for value in doc.fields.values() {
            if let ScalarValue::Text(text) = value {
                let doc_terms: FxHashSet<String> = tokenize(text).into_iter().collect();
                score += terms.iter().filter(|t| doc_terms.contains(*t)).count();
            }
        }
        score as f32
    }

    pub fn count(&self) -> usize {
        self.docs.len()
    }

    pub fn memory_size(&self) -> usize {
        let postings: usize = self
            .postings
            .values()
            .map(|f| {
                f.iter()
                    .map(|(term, set)| term.len() + set.len() * 8 + 48)
                    .sum::<usize>()
            })
            .sum();
        self.docs.len() * 64 + postings
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(FILE_MAGIC);
        buf.extend_from_slice(&(self.docs.len() as u64).to_be_bytes());
        let mut ids: Vec<&i64> = self.docs.keys().collect();
        ids.sort();
        for id in ids {
            let row = encode_document_row(&self.docs[id]);
            buf.extend_from_slice(&(row.len() as u32).to_be_bytes());
            buf.extend_from_slice(&row);
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        fs::write(path, buf)?;
        Ok(())
    }

    pub fn load(&mut self, path: &Path) -> Result<()> {
        let data = fs::read(path)?;
        if data.len() < 20 {
            return Err(Error::internal("document index file truncated"));
        }
        let (body, crc_raw) = data.split_at(data.len() - 4);
        let stored_crc = u32::from_le_bytes([crc_raw[0], crc_raw[1], crc_raw[2], crc_raw[3]]);
        if crc32fast::hash(body) != stored_crc {
            return Err(Error::internal("document index file checksum mismatch"));
        }
        if &body[..8] != FILE_MAGIC {
            return Err(Error::internal("document index file bad magic"));
        }
        let mut b8 = [0u8; 8];
        b8.copy_from_slice(&body[8..16]);
        let count = u64::from_be_bytes(b8) as usize;

        let mut docs = Vec::with_capacity(count);
        let mut pos = 16usize;
        for _ in 0..count {
            if pos + 4 > body.len() {
                return Err(Error::internal("document index file truncated"));
            }
            let mut b4 = [0u8; 4];
            b4.copy_from_slice(&body[pos..pos + 4]);
            let len = u32::from_be_bytes(b4) as usize;
            pos += 4;
            if pos + len > body.len() {
                return Err(Error::internal("document index file truncated"));
            }
            docs.push(decode_document_row(&body[pos..pos + len])?);
            pos += len;
        }

        self.docs.clear();
        self.postings.clear();
        self.add_or_upsert(&docs)?;
        Ok(())
    }

    pub fn need_to_save(&self, log_behind: i64, threshold: i64) -> bool {
        !self.docs.is_empty() && log_behind > threshold
    }
}

impl Default for DocumentIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: i64, title: &str, body: &str) -> DocumentWithId {
        DocumentWithId::new(id)
            .with_field("title", ScalarValue::Text(title.to_string()))
            .with_field("body", ScalarValue::Text(body.to_string()))
    }

    fn sample() -> DocumentIndex {
        let mut index = DocumentIndex::new();
        index
            .add_or_upsert(&[
                doc(1, "storage engines", "lsm trees and b-trees compared"),
                doc(2, "vector search", "hnsw graphs for nearest neighbors"),
                doc(3, "storage internals", "write ahead logs in storage engines"),
            ])
            .unwrap();
        index
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Hello, World!"), vec!["hello", "world"]);
        assert_eq!(tokenize("  "), Vec::<String>::new());
        assert_eq!(tokenize("b-trees"), vec!["b", "trees"]);
    }

    #[test]
    fn test_all_terms_must_match() {
        let index = sample();
        let hits = index.search("title", "storage engines", 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);

        let hits = index.search("title", "storage", 10, None).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_ranking_prefers_denser_match() {
        let index = sample();
        // "storage" appears in doc 3's title and body: scores higher
        let hits = index.search("title", "storage", 10, None).unwrap();
        assert_eq!(hits[0].id, 3);
    }

    #[test]
    fn test_upsert_and_delete_update_postings() {
        let mut index = sample();
        index
            .add_or_upsert(&[doc(1, "graph databases", "adjacency lists")])
            .unwrap();
        assert!(index.search("title", "storage engines", 10, None).unwrap().is_empty());
        assert_eq!(index.search("title", "graph", 10, None).unwrap().len(), 1);

        assert_eq!(index.delete(&[1]).unwrap(), 1);
        assert_eq!(index.delete(&[1]).unwrap(), 0);
        assert!(index.search("title", "graph", 10, None).unwrap().is_empty());
        assert_eq!(index.count(), 2);
    }

    #[test]
    fn test_filter_applied_before_top_k() {
        struct Only(i64);
        impl PreFilter for Only {
            fn matches(&self, id: i64) -> bool {
                id == self.0
            }
        }
        let index = sample();
        let hits = index.search("title", "storage", 1, Some(&Only(1))).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs.idx");
        let index = sample();
        index.save(&path).unwrap();

        let mut restored = DocumentIndex::new();
        restored.load(&path).unwrap();
        assert_eq!(restored.count(), 3);
        let hits = restored.search("body", "storage engines", 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 3);
    }
}
