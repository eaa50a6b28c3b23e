//! Per-patient write serialization.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;

/// Lazily created async mutex per patient.
///
/// Entries are evicted when the last holder releases and nobody is waiting,
/// so the map only holds patients with writes in flight.
#[derive(Clone, Default)]
pub struct PatientLocks {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl PatientLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, patient_id: &str) -> PatientGuard {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(patient_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = slot.clone().lock_owned().await;
        PatientGuard {
            slots: self.slots.clone(),
            patient_id: patient_id.to_string(),
            slot: Some(slot),
            guard: Some(guard),
        }
    }

    /// Patients with a live entry.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// Exclusive write access to one patient's memories.
pub struct PatientGuard {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    patient_id: String,
    slot: Option<Slot>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl PatientGuard {
    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }
}

impl Drop for PatientGuard {
    fn drop(&mut self) {
        // Every reference this guard owns is released under the map lock, so
        // the count below cannot race with another guard or a new waiter.
        let mut slots = self.slots.lock();
        drop(self.guard.take());
        let Some(slot) = self.slot.take() else {
            return;
        };
        // Remaining references: the map entry and `slot`.
        let idle = Arc::strong_count(&slot) == 2
            && slots
                .get(&self.patient_id)
                .is_some_and(|current| Arc::ptr_eq(current, &slot));
        drop(slot);
        if idle {
            slots.remove(&self.patient_id);
        }
    }
}
