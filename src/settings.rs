//! Persistent machine state: work-coordinate offsets, stored positions and
//! the tool table, keyed by stable numeric identifiers. Storage itself is
//! left to the host platform; the in-memory store is used by the simulator
//! and tests, and can be snapshotted to JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::AXES;

/// G54..G59 occupy ids NVM_COORD_BASE..NVM_COORD_BASE+5.
pub const NVM_COORD_BASE: u32 = 100;
pub const NVM_G28_POSITION: u32 = 110;
pub const NVM_G30_POSITION: u32 = 111;
pub const NVM_G92_OFFSET: u32 = 112;
/// Tool n lives at NVM_TOOL_BASE + n.
pub const NVM_TOOL_BASE: u32 = 200;

pub trait SettingsStore: Send {
    fn load(&self, id: u32) -> Option<[f64; AXES]>;
    fn save(&mut self, id: u32, value: &[f64; AXES]);
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MemoryStore {
    entries: BTreeMap<u32, [f64; AXES]>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self, id: u32) -> Option<[f64; AXES]> {
        self.entries.get(&id).copied()
    }

    fn save(&mut self, id: u32, value: &[f64; AXES]) {
        self.entries.insert(id, *value);
    }
}
