/// Fixed overhead charged to every item on top of its text and output vector.
pub const ITEM_OVERHEAD_BYTES: usize = 256;

/// Bytes one text is expected to occupy while in flight: UTF-16-sized text,
/// the `f32` output vector and a fixed overhead.
pub fn estimate_item_bytes(chars: usize, dimension: usize) -> usize {
    2 * chars + 4 * dimension + ITEM_OVERHEAD_BYTES
}

/// Converts a budget in megabytes to bytes.
pub fn budget_bytes(memory_budget_mb: f64) -> usize {
    (memory_budget_mb.max(0.0) * 1024.0 * 1024.0) as usize
}

/// Groups items into batches that stay under a memory budget.
///
/// An item that would push the open batch over budget closes it; `add`
/// returns the closed batch and the item starts the next one. An item larger
/// than the whole budget is still accepted into an empty batch, so nothing is
/// ever dropped.
#[derive(Debug)]
pub struct MemoryAwareBatcher<T> {
    budget_bytes: usize,
    dimension: usize,
    max_items: usize,
    current: Vec<T>,
    current_bytes: usize,
}

impl<T: AsRef<str>> MemoryAwareBatcher<T> {
    pub fn new(memory_budget_mb: f64, dimension: usize) -> Self {
        Self::with_budget_bytes(budget_bytes(memory_budget_mb), dimension)
    }

    pub fn with_budget_bytes(budget_bytes: usize, dimension: usize) -> Self {
        Self {
            budget_bytes,
            dimension,
            max_items: usize::MAX,
            current: Vec::new(),
            current_bytes: 0,
        }
    }

    /// Also close a batch once it holds `max_items`.
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items.max(1);
        self
    }

    pub fn estimate(&self, item: &T) -> usize {
        estimate_item_bytes(item.as_ref().chars().count(), self.dimension)
    }

    pub fn add(&mut self, item: T) -> Option<Vec<T>> {
        let cost = self.estimate(&item);
        let overflows = self.current_bytes + cost > self.budget_bytes
            || self.current.len() >= self.max_items;

        let completed = if overflows && !self.current.is_empty() {
            self.current_bytes = 0;
            Some(std::mem::take(&mut self.current))
        } else {
            None
        };

        self.current_bytes += cost;
        self.current.push(item);
        completed
    }

    /// Close and return the open batch, if it holds anything.
    pub fn flush(&mut self) -> Option<Vec<T>> {
        if self.current.is_empty() {
            return None;
        }
        self.current_bytes = 0;
        Some(std::mem::take(&mut self.current))
    }

    pub fn current_memory(&self) -> usize {
        self.current_bytes
    }

    pub fn budget(&self) -> usize {
        self.budget_bytes
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}
