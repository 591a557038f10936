//! Process-wide slot for the active manager.
//!
//! Applications that need a single "current vault" hold a registry instead of
//! a global. Setting a new manager does not close the previous one; it is
//! returned to the caller.

use crate::manager::SessionManager;
use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct ManagerRegistry {
    slot: RwLock<Option<SessionManager>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `manager`, returning whichever one it replaced.
    pub fn set(&self, manager: SessionManager) -> Option<SessionManager> {
        self.slot.write().replace(manager)
    }

    pub fn get(&self) -> Option<SessionManager> {
        self.slot.read().clone()
    }

    pub fn clear(&self) -> Option<SessionManager> {
        self.slot.write().take()
    }

    pub fn is_set(&self) -> bool {
        self.slot.read().is_some()
    }
}
