//! Load/save hooks for state that outlives a session.
//!
//! The engine does not decide where state lives. The host supplies a
//! [`StateStore`]; the engine hands it a [`PersistedState`] when something
//! worth keeping changed and restores from it at startup.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModbusResult;
use crate::learner::LearnedTimeout;

/// Everything the engine wants back after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Addresses the device declared unsupported.
    #[serde(default)]
    pub failed_registers: BTreeSet<u16>,
    #[serde(default)]
    pub learned_timeouts: Vec<LearnedTimeout>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.failed_registers.is_empty() && self.learned_timeouts.is_empty()
    }
}

/// Host-provided storage.
pub trait StateStore: Send + Sync {
    /// Previously saved state, `None` on first run.
    fn load(&self) -> ModbusResult<Option<PersistedState>>;

    fn save(&self, state: &PersistedState) -> ModbusResult<()>;
}

/// Store that keeps the state in memory; clones share it.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    slot: Arc<Mutex<Option<PersistedState>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(state))),
        }
    }

    /// Last saved state.
    pub fn snapshot(&self) -> Option<PersistedState> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> ModbusResult<Option<PersistedState>> {
        Ok(self.snapshot())
    }

    fn save(&self, state: &PersistedState) -> ModbusResult<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryStateStore::new();
        assert_eq!(store.load().unwrap(), None);

        let state = PersistedState {
            failed_registers: BTreeSet::from([0x0105]),
            ..Default::default()
        };
        store.save(&state).unwrap();
        assert_eq!(store.clone().load().unwrap(), Some(state));
    }

    #[test]
    fn test_json_shape() {
        let state = PersistedState {
            failed_registers: BTreeSet::from([0x0105, 0x0200]),
            learned_timeouts: vec![LearnedTimeout {
                operation: "modbus_read".into(),
                timeout_ms: 620,
                samples: 40,
                p95_ms: 413.3,
                default_ms: 1500,
            }],
            saved_at: None,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"failed_registers\":[261,512]"));
        let back: PersistedState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);

        // Missing fields default, so older files still load.
        let empty: PersistedState = serde_json::from_str("{}").unwrap();
        assert!(empty.is_empty());
    }
}
