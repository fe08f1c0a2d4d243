//! HNSW-backed semantic index.
//!
//! hnsw_rs graphs are append-only, so removals become tombstones and the graph
//! is rebuilt from the live records once tombstones exceed a quarter of the
//! capacity. Below `min_vectors_for_ann` live records the index scans linearly.

use hnsw_rs::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{check_dimension, cosine_similarity, sort_matches, SemanticIndex, SemanticMatch, SemanticRecord};
use crate::entry::{now_millis, CacheKey};
use crate::error::CacheError;

/// Graph construction and search parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HnswParams {
    /// Neighbors per node.
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Live records needed before the graph is used at all.
    pub min_vectors_for_ann: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            min_vectors_for_ann: 1000,
        }
    }
}

impl HnswParams {
    pub fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self
    }

    pub fn with_ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }

    pub fn with_min_vectors_for_ann(mut self, min: usize) -> Self {
        self.min_vectors_for_ann = min;
        self
    }
}

struct Inner {
    graph: Option<Hnsw<'static, f32, DistCosine>>,
    /// Graph id → record; `None` is a tombstone.
    slots: Vec<Option<SemanticRecord>>,
    /// Insertion order, oldest first. May still list tombstoned ids.
    order: VecDeque<usize>,
    by_key: HashMap<CacheKey, usize>,
    tombstones: usize,
}

impl Inner {
    fn live(&self) -> usize {
        self.slots.len() - self.tombstones
    }

    fn bury(&mut self, id: usize) -> Option<SemanticRecord> {
        let record = self.slots.get_mut(id)?.take()?;
        self.by_key.remove(&record.key);
        self.tombstones += 1;
        Some(record)
    }
}

/// Approximate nearest-neighbor index.
pub struct HnswIndex {
    dimension: usize,
    capacity: usize,
    params: HnswParams,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dimension", &self.dimension)
            .field("capacity", &self.capacity)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl HnswIndex {
    pub fn new(dimension: usize, capacity: usize, params: HnswParams) -> Self {
        Self {
            dimension,
            capacity: capacity.max(1),
            params,
            inner: Mutex::new(Inner {
                graph: None,
                slots: Vec::new(),
                order: VecDeque::new(),
                by_key: HashMap::new(),
                tombstones: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether searches currently go through the graph.
    pub fn uses_graph(&self) -> bool {
        let inner = self.lock();
        inner.graph.is_some() && inner.live() >= self.params.min_vectors_for_ann
    }

    fn max_elements(&self) -> usize {
        self.capacity + self.capacity / 4 + 1
    }

    fn new_graph(&self) -> Hnsw<'static, f32, DistCosine> {
        let max_elements = self.max_elements();
        let nb_layer = 16.min(((max_elements as f32).ln().trunc() as usize).max(1));
        Hnsw::<f32, DistCosine>::new(
            self.params.m,
            max_elements,
            nb_layer,
            self.params.ef_construction,
            DistCosine {},
        )
    }

    /// Compact the slots and rebuild the graph from live records.
    fn rebuild(&self, inner: &mut Inner) {
        let mut slots = Vec::with_capacity(inner.live());
        let mut order = VecDeque::with_capacity(inner.live());
        let mut by_key = HashMap::with_capacity(inner.live());

        for id in std::mem::take(&mut inner.order) {
            if let Some(record) = inner.slots.get_mut(id).and_then(Option::take) {
                let new_id = slots.len();
                by_key.insert(record.key.clone(), new_id);
                order.push_back(new_id);
                slots.push(Some(record));
            }
        }

        inner.slots = slots;
        inner.order = order;
        inner.by_key = by_key;
        inner.tombstones = 0;
        inner.graph = None;

        if inner.live() >= self.params.min_vectors_for_ann {
            let graph = self.new_graph();
            let data: Vec<(&Vec<f32>, usize)> = inner
                .slots
                .iter()
                .enumerate()
                .filter_map(|(id, slot)| slot.as_ref().map(|record| (&record.vector, id)))
                .filter(|(vector, _)| has_norm(vector))
                .collect();
            graph.parallel_insert(&data);
            inner.graph = Some(graph);
        }

        tracing::debug!(live = inner.live(), graph = inner.graph.is_some(), "semantic index rebuilt");
    }

    fn maybe_rebuild(&self, inner: &mut Inner) {
        let tombstones_high = inner.tombstones > self.capacity / 4;
        let graph_due = inner.graph.is_none() && inner.live() >= self.params.min_vectors_for_ann;
        if tombstones_high || graph_due {
            self.rebuild(inner);
        }
    }

    fn linear(&self, inner: &Inner, query: &[f32], now: u64) -> Vec<SemanticMatch> {
        inner
            .slots
            .iter()
            .flatten()
            .filter(|record| record.is_live_at(now))
            .map(|record| to_match(record, query))
            .collect()
    }
}

impl SemanticIndex for HnswIndex {
    fn add(&self, record: SemanticRecord) -> Result<(), CacheError> {
        check_dimension(self.dimension, record.vector.len())?;
        let mut inner = self.lock();

        let existing = inner.by_key.get(&record.key).copied();
        if let Some(existing) = existing {
            inner.bury(existing);
        }
        while inner.live() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.bury(oldest);
                }
                None => break,
            }
        }

        let id = inner.slots.len();
        if let Some(graph) = inner.graph.as_ref() {
            if has_norm(&record.vector) {
                graph.parallel_insert(&[(&record.vector, id)]);
            }
        }
        inner.by_key.insert(record.key.clone(), id);
        inner.order.push_back(id);
        inner.slots.push(Some(record));

        self.maybe_rebuild(&mut inner);
        Ok(())
    }

    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<SemanticMatch>, CacheError> {
        check_dimension(self.dimension, query.len())?;
        let now = now_millis();
        let inner = self.lock();

        let mut matches = match inner.graph.as_ref() {
            Some(graph) if inner.live() >= self.params.min_vectors_for_ann && has_norm(query) => {
                // Over-fetch so tombstones and expired records don't starve k.
                let fetch = (k + inner.tombstones).max(k * 2).min(inner.slots.len().max(1));
                graph
                    .search(query, fetch, self.params.ef_search.max(fetch))
                    .into_iter()
                    .filter_map(|neighbour| {
                        inner.slots.get(neighbour.get_origin_id())?.as_ref()
                    })
                    .filter(|record| record.is_live_at(now))
                    .map(|record| to_match(record, query))
                    .collect()
            }
            _ => self.linear(&inner, query, now),
        };

        sort_matches(&mut matches);
        matches.truncate(k);
        Ok(matches)
    }

    fn remove_where(&self, doomed: &dyn Fn(&SemanticRecord) -> bool) -> usize {
        let mut inner = self.lock();
        let ids: Vec<usize> = inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().filter(|record| doomed(*record)).map(|_| id))
            .collect();
        for &id in &ids {
            inner.bury(id);
        }
        self.maybe_rebuild(&mut inner);
        ids.len()
    }

    fn len(&self) -> usize {
        self.lock().live()
    }

    fn kind(&self) -> &'static str {
        "hnsw"
    }
}

fn to_match(record: &SemanticRecord, query: &[f32]) -> SemanticMatch {
    SemanticMatch {
        key: record.key.clone(),
        text: record.text.clone(),
        vector: record.vector.clone(),
        similarity: cosine_similarity(query, &record.vector),
    }
}

fn has_norm(vector: &[f32]) -> bool {
    vector.iter().any(|x| *x != 0.0)
}
