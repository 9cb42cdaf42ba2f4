use crate::sample::TelemetrySample;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

/// `{nid, data}` wrapper served by the latest-value endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestEntry {
    pub nid: String,
    pub data: TelemetrySample,
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    sample: TelemetrySample,
}

#[derive(Debug, Default)]
struct CacheInner {
    nodes: HashMap<String, Slot>,
    seq: u64,
    last: Option<String>,
}

/// Most recent sample per node. One writer (ingest or generator), many readers.
///
/// No history is kept: `put` overwrites the node's slot, and reads before the
/// first `put` return `None` ("not yet available").
#[derive(Debug, Default)]
pub struct LatestCache {
    inner: RwLock<CacheInner>,
}

impl LatestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, sample: TelemetrySample) {
        let mut inner = self.inner.write();
        inner.seq += 1;
        let seq = inner.seq;
        let node_id = sample.node_id.clone();
        inner.nodes.insert(node_id.clone(), Slot { seq, sample });
        inner.last = Some(node_id);
    }

    /// Most recently stored sample, whatever the node.
    pub fn get(&self) -> Option<TelemetrySample> {
        let inner = self.inner.read();
        let last = inner.last.as_ref()?;
        inner.nodes.get(last).map(|slot| slot.sample.clone())
    }

    pub fn get_node(&self, node_id: &str) -> Option<TelemetrySample> {
        self.inner.read().nodes.get(node_id).map(|slot| slot.sample.clone())
    }

    /// One sample per node, oldest update first.
    pub fn snapshot(&self) -> Vec<TelemetrySample> {
        let inner = self.inner.read();
        let mut slots: Vec<&Slot> = inner.nodes.values().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.into_iter().map(|slot| slot.sample.clone()).collect()
    }

    /// `{nid, data}` for the given node, or for the last updated node when `None`.
    pub fn entry(&self, node_id: Option<&str>) -> Option<LatestEntry> {
        let data = match node_id {
            Some(nid) => self.get_node(nid)?,
            None => self.get()?,
        };
        Some(LatestEntry {
            nid: data.node_id.clone(),
            data,
        })
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }
}
