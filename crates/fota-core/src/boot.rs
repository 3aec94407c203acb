//! Boot layout and next-boot selection.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Descriptor of one application partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Partition-table label, e.g. `ota_0`.
    pub label: String,
    /// Capacity in bytes.
    pub size: u64,
}

#[derive(Error, Debug)]
pub enum BootError {
    #[error("no updatable partition in the boot layout")]
    NoUpdatablePartition,

    #[error("unknown partition {0:?}")]
    UnknownPartition(String),

    #[error("boot selection failed: {0}")]
    SelectFailed(String),
}

/// Bootloader binding.
///
/// `set_next_boot` is the single commit point of an update: it is invoked at
/// most once per session, only from `finish`, only after the written image
/// validated. Everything before it is abandonable.
pub trait BootSelector: Send {
    /// Resolve the next updatable application partition.
    fn next_update_partition(&self) -> Result<Partition, BootError>;

    /// Mark `partition` as the boot target for the next restart.
    fn set_next_boot(&mut self, partition: &Partition) -> Result<(), BootError>;
}

struct Inner {
    slots: Vec<Partition>,
    active: usize,
    next_boot: Option<String>,
}

/// Fixed in-memory boot layout for tests and the host-side harness.
///
/// Update partitions rotate round-robin away from the active slot. Clones
/// share state so a caller can observe the selection after the session
/// consumed its boxed handle.
#[derive(Clone)]
pub struct StaticBootLayout {
    inner: Arc<Mutex<Inner>>,
}

impl StaticBootLayout {
    pub fn new(slots: Vec<Partition>, active: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slots,
                active,
                next_boot: None,
            })),
        }
    }

    /// Conventional `ota_0` (active) / `ota_1` layout with equal-sized slots.
    pub fn two_slot(slot_size: u64) -> Self {
        Self::new(
            vec![
                Partition {
                    label: "ota_0".into(),
                    size: slot_size,
                },
                Partition {
                    label: "ota_1".into(),
                    size: slot_size,
                },
            ],
            0,
        )
    }

    /// Label selected as next boot target, if any.
    pub fn next_boot(&self) -> Option<String> {
        self.inner.lock().unwrap().next_boot.clone()
    }
}

impl BootSelector for StaticBootLayout {
    fn next_update_partition(&self) -> Result<Partition, BootError> {
        let inner = self.inner.lock().unwrap();
        if inner.slots.len() < 2 {
            return Err(BootError::NoUpdatablePartition);
        }
        Ok(inner.slots[(inner.active + 1) % inner.slots.len()].clone())
    }

    fn set_next_boot(&mut self, partition: &Partition) -> Result<(), BootError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.slots.iter().any(|s| s.label == partition.label) {
            return Err(BootError::UnknownPartition(partition.label.clone()));
        }
        inner.next_boot = Some(partition.label.clone());
        Ok(())
    }
}
