/// One text waiting for a vector. `slot` indexes the request's distinct texts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanItem {
    pub slot: usize,
    pub text: String,
}

impl PlanItem {
    pub fn new(slot: usize, text: impl Into<String>) -> Self {
        Self {
            slot,
            text: text.into(),
        }
    }
}

impl AsRef<str> for PlanItem {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

/// Items bound for one backend call on one device.
#[derive(Debug, Clone, PartialEq)]
pub struct SubBatch {
    pub device: String,
    pub items: Vec<PlanItem>,
    /// Bytes, per the batcher's estimate.
    pub estimated_memory: usize,
}

impl SubBatch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn texts(&self) -> Vec<String> {
        self.items.iter().map(|item| item.text.clone()).collect()
    }

    pub fn mean_text_length(&self) -> f64 {
        mean_chars(&self.items)
    }
}

/// Ordered partition of a request's cache misses into sub-batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPlan {
    pub sub_batches: Vec<SubBatch>,
}

impl BatchPlan {
    pub fn len(&self) -> usize {
        self.sub_batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_batches.is_empty()
    }

    pub fn total_items(&self) -> usize {
        self.sub_batches.iter().map(SubBatch::len).sum()
    }

    /// Device ids in first-use order, without repeats.
    pub fn devices(&self) -> Vec<&str> {
        let mut devices: Vec<&str> = Vec::new();
        for batch in &self.sub_batches {
            if !devices.contains(&batch.device.as_str()) {
                devices.push(&batch.device);
            }
        }
        devices
    }

    /// Sub-batches grouped per device, each group keeping plan order.
    pub fn into_partitions(self) -> Vec<(String, Vec<SubBatch>)> {
        let mut partitions: Vec<(String, Vec<SubBatch>)> = Vec::new();
        for batch in self.sub_batches {
            match partitions.iter_mut().find(|(device, _)| *device == batch.device) {
                Some((_, batches)) => batches.push(batch),
                None => partitions.push((batch.device.clone(), vec![batch])),
            }
        }
        partitions
    }
}

pub(crate) fn mean_chars(items: &[PlanItem]) -> f64 {
    if items.is_empty() {
        return 0.0;
    }
    let total: usize = items.iter().map(|item| item.text.chars().count()).sum();
    total as f64 / items.len() as f64
}

/// Split `total` items in proportion to `1 / latency` per device, largest
/// remainder first. Counts always sum to `total`.
pub(crate) fn proportional_counts(total: usize, latencies: &[f64]) -> Vec<usize> {
    if latencies.is_empty() {
        return Vec::new();
    }
    let speeds: Vec<f64> = latencies
        .iter()
        .map(|latency| 1.0 / latency.max(1e-9))
        .collect();
    let sum: f64 = speeds.iter().sum();

    let exact: Vec<f64> = speeds.iter().map(|speed| total as f64 * speed / sum).collect();
    let mut counts: Vec<usize> = exact.iter().map(|share| share.floor() as usize).collect();
    let assigned: usize = counts.iter().sum();

    let mut order: Vec<usize> = (0..latencies.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
    });
    for &index in order.iter().cycle().take(total.saturating_sub(assigned)) {
        counts[index] += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_follow_inverse_latency() {
        // GPU five times faster than CPU.
        let counts = proportional_counts(60, &[0.010, 0.002]);
        assert_eq!(counts, vec![10, 50]);

        let uneven = proportional_counts(7, &[0.01, 0.01, 0.01]);
        assert_eq!(uneven.iter().sum::<usize>(), 7);
        assert!(uneven.iter().all(|&c| c == 2 || c == 3));
    }

    #[test]
    fn partitions_group_by_device_in_order() {
        let batch = |device: &str, slot: usize| SubBatch {
            device: device.into(),
            items: vec![PlanItem::new(slot, "t")],
            estimated_memory: 1,
        };
        let plan = BatchPlan {
            sub_batches: vec![batch("gpu:0", 0), batch("cpu", 1), batch("gpu:0", 2)],
        };
        assert_eq!(plan.devices(), vec!["gpu:0", "cpu"]);
        assert_eq!(plan.total_items(), 3);

        let partitions = plan.into_partitions();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].0, "gpu:0");
        assert_eq!(partitions[0].1.len(), 2);
        assert_eq!(partitions[0].1[1].items[0].slot, 2);
    }

    #[test]
    fn mean_length_in_chars() {
        let items = vec![PlanItem::new(0, "ab"), PlanItem::new(1, "世界世界")];
        assert_eq!(mean_chars(&items), 3.0);
    }
}
