use std::collections::VecDeque;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{check_dimension, cosine_similarity, sort_matches, SemanticIndex, SemanticMatch, SemanticRecord};
use crate::entry::now_millis;
use crate::error::CacheError;

/// Exact brute-force index, bounded with oldest-first eviction.
#[derive(Debug)]
pub struct LinearScanIndex {
    dimension: usize,
    capacity: usize,
    records: RwLock<VecDeque<SemanticRecord>>,
}

impl LinearScanIndex {
    pub fn new(dimension: usize, capacity: usize) -> Self {
        Self {
            dimension,
            capacity: capacity.max(1),
            records: RwLock::new(VecDeque::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, VecDeque<SemanticRecord>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, VecDeque<SemanticRecord>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SemanticIndex for LinearScanIndex {
    fn add(&self, record: SemanticRecord) -> Result<(), CacheError> {
        check_dimension(self.dimension, record.vector.len())?;
        let mut records = self.write();
        records.retain(|existing| existing.key != record.key);
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }

    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<SemanticMatch>, CacheError> {
        check_dimension(self.dimension, query.len())?;
        let now = now_millis();

        let mut matches: Vec<SemanticMatch> = self
            .read()
            .iter()
            .filter(|record| record.is_live_at(now))
            .map(|record| SemanticMatch {
                key: record.key.clone(),
                text: record.text.clone(),
                vector: record.vector.clone(),
                similarity: cosine_similarity(query, &record.vector),
            })
            .collect();

        sort_matches(&mut matches);
        matches.truncate(k);
        Ok(matches)
    }

    fn remove_where(&self, doomed: &dyn Fn(&SemanticRecord) -> bool) -> usize {
        let mut records = self.write();
        let before = records.len();
        records.retain(|record| !doomed(record));
        before - records.len()
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    fn kind(&self) -> &'static str {
        "linear"
    }
}
