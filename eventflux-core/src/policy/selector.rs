use std::sync::atomic::{AtomicUsize, Ordering};

use super::PartitionSelectorPolicy;
use crate::{
    error::{FluxError, PolicyKind, Result},
    metadata::Metadata,
};

fn check_partitions(partitions: usize) -> Result<()> {
    if partitions == 0 {
        return Err(FluxError::Validation("topic has no partitions".into()));
    }
    Ok(())
}

fn honor_request(requested: Option<usize>, partitions: usize) -> Result<Option<usize>> {
    match requested {
        Some(index) if index >= partitions => Err(FluxError::Validation(format!(
            "requested partition {index} but topic has {partitions}"
        ))),
        other => Ok(other),
    }
}

fn bucket(bytes: &[u8], partitions: usize) -> usize {
    let digest = blake3::hash(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    (u64::from_le_bytes(head) % partitions as u64) as usize
}

/// Built-in selector: the requested partition when given, otherwise a
/// blake3 hash of the metadata's compact JSON rendering.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashSelector;

impl PartitionSelectorPolicy for HashSelector {
    fn select(&self, metadata: &Metadata, partitions: usize, requested: Option<usize>) -> Result<usize> {
        check_partitions(partitions)?;
        if let Some(index) = honor_request(requested, partitions)? {
            return Ok(index);
        }
        Ok(bucket(metadata.to_json_string().as_bytes(), partitions))
    }
}

/// Hashes a single metadata field (`{"key": "user.id"}`), so all events
/// sharing that field land on the same partition. Events without the field
/// go to partition 0.
#[derive(Debug, Clone)]
pub struct KeySelector {
    key: String,
}

impl KeySelector {
    pub fn from_config(config: &Metadata) -> Result<Self> {
        let key = config
            .get_str("key")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| FluxError::InvalidPolicyConfig {
                kind: PolicyKind::PartitionSelector,
                reason: "key selector config requires a non-empty \"key\" string".into(),
            })?;
        Ok(KeySelector { key: key.to_string() })
    }
}

impl PartitionSelectorPolicy for KeySelector {
    fn select(&self, metadata: &Metadata, partitions: usize, requested: Option<usize>) -> Result<usize> {
        check_partitions(partitions)?;
        if let Some(index) = honor_request(requested, partitions)? {
            return Ok(index);
        }
        Ok(match metadata.get(&self.key) {
            Some(value) => bucket(value.to_string().as_bytes(), partitions),
            None => 0,
        })
    }
}

/// Cycles through partitions regardless of content. Not deterministic per
/// event, so Strict ordering only holds per producer, not per key.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl PartitionSelectorPolicy for RoundRobinSelector {
    fn select(&self, _metadata: &Metadata, partitions: usize, requested: Option<usize>) -> Result<usize> {
        check_partitions(partitions)?;
        if let Some(index) = honor_request(requested, partitions)? {
            return Ok(index);
        }
        Ok(self.next.fetch_add(1, Ordering::Relaxed) % partitions)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn hash_selector_is_deterministic() {
        let md = Metadata::new(json!({"x": 1, "y": "abc"}));
        let first = HashSelector.select(&md, 7, None).expect("select");
        for _ in 0..10 {
            assert_eq!(HashSelector.select(&md, 7, None).expect("select"), first);
        }
        assert!(first < 7);
    }

    #[test]
    fn hash_selector_spreads_events() {
        let mut seen = [false; 4];
        for i in 0..64 {
            let idx = HashSelector
                .select(&Metadata::new(json!({"i": i})), 4, None)
                .expect("select");
            seen[idx] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn requested_partition_wins_and_is_checked() {
        let md = Metadata::empty();
        assert_eq!(HashSelector.select(&md, 3, Some(2)).expect("in range"), 2);
        assert!(matches!(
            HashSelector.select(&md, 3, Some(3)),
            Err(FluxError::Validation(_))
        ));
        assert!(HashSelector.select(&md, 0, None).is_err());
    }

    #[test]
    fn key_selector_groups_by_field() {
        let sel = KeySelector::from_config(&Metadata::new(json!({"key": "user.id"})))
            .expect("valid config");
        let a1 = Metadata::new(json!({"user": {"id": "alice"}, "n": 1}));
        let a2 = Metadata::new(json!({"user": {"id": "alice"}, "n": 2}));
        assert_eq!(
            sel.select(&a1, 16, None).expect("select"),
            sel.select(&a2, 16, None).expect("select")
        );
        assert_eq!(sel.select(&Metadata::empty(), 16, None).expect("select"), 0);
        assert!(KeySelector::from_config(&Metadata::empty()).is_err());
    }

    #[test]
    fn round_robin_cycles() {
        let sel = RoundRobinSelector::default();
        let picks: Vec<usize> = (0..6)
            .map(|_| sel.select(&Metadata::empty(), 3, None).expect("select"))
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }
}
