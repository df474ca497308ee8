//! Module registry.
//!
//! A module is a loaded real-time plugin that owns tasks. Module handles are
//! slot indices biased by [`MODULE_OFFSET`] so they can never be mistaken for
//! task ids.

use core::fmt;
use core::fmt::Write as _;

use log::debug;

use crate::config::{MODULE_OFFSET, NAME_LEN};
use crate::error::{RtapiError, RtapiResult};

pub const MODULE_MAGIC: u32 = 30812;

/// Fixed-capacity name used for modules and tasks.
pub type Name = heapless::String<NAME_LEN>;

/// Copies `name` into a [`Name`], dropping whatever does not fit.
pub fn bounded_name(name: &str) -> Name {
    let mut out = Name::new();
    for ch in name.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// Handle of a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(i32);

impl ModuleId {
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    fn from_slot(slot: usize) -> Self {
        Self(slot as i32 + MODULE_OFFSET)
    }

    fn slot(self) -> Option<usize> {
        usize::try_from(self.0.checked_sub(MODULE_OFFSET)?).ok()
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct ModuleSlot {
    magic: u32,
    name: Name,
}

/// Module slots. Callers hold the registry lock.
pub(crate) struct ModuleTable {
    slots: Vec<ModuleSlot>,
}

impl ModuleTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| ModuleSlot::default()).collect(),
        }
    }

    pub(crate) fn init(&mut self, name: &str) -> RtapiResult<ModuleId> {
        let Some(n) = self.slots.iter().position(|m| m.magic != MODULE_MAGIC) else {
            return Err(RtapiError::ResourceExhausted(format!(
                "reached module limit {}",
                self.slots.len()
            )));
        };
        let id = ModuleId::from_slot(n);
        let slot = &mut self.slots[n];
        slot.magic = MODULE_MAGIC;
        slot.name = if name.is_empty() {
            let mut made_up = Name::new();
            let _ = write!(made_up, "ULMOD{:03}", id.raw());
            made_up
        } else {
            bounded_name(name)
        };
        debug!("module '{}' loaded, ID: {}", slot.name, id);
        Ok(id)
    }

    pub(crate) fn exit(&mut self, id: ModuleId) -> RtapiResult<()> {
        let slot = self
            .live_slot(id)
            .ok_or(RtapiError::InvalidHandle(id.raw() as i64))?;
        let slot = &mut self.slots[slot];
        slot.magic = 0;
        debug!("freed module slot {}, was {}", id, slot.name);
        slot.name.clear();
        Ok(())
    }

    pub(crate) fn is_loaded(&self, id: ModuleId) -> bool {
        self.live_slot(id).is_some()
    }

    pub(crate) fn name(&self, id: ModuleId) -> Option<Name> {
        self.live_slot(id).map(|n| self.slots[n].name.clone())
    }

    pub(crate) fn loaded_count(&self) -> usize {
        self.slots.iter().filter(|m| m.magic == MODULE_MAGIC).count()
    }

    fn live_slot(&self, id: ModuleId) -> Option<usize> {
        let n = id.slot()?;
        (self.slots.get(n)?.magic == MODULE_MAGIC).then_some(n)
    }
}
