//! Single-flight guard: one holder at a time, conflicting starts are refused
//! rather than queued.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Idle,
    Running(String),
}

/// Returned when a slot is already held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Busy {
    pub holder: String,
}

#[derive(Debug, Clone, Default)]
pub struct Slot {
    state: Arc<Mutex<SlotState>>,
}

impl Slot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves Idle -> Running(`id`) in one step, or reports the current holder.
    pub fn try_acquire(&self, id: &str) -> Result<SlotGuard, Busy> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let SlotState::Running(holder) = &*state {
            return Err(Busy {
                holder: holder.clone(),
            });
        }
        *state = SlotState::Running(id.to_string());
        Ok(SlotGuard {
            state: Arc::clone(&self.state),
        })
    }

    pub fn state(&self) -> SlotState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn holder(&self) -> Option<String> {
        match self.state() {
            SlotState::Running(id) => Some(id),
            SlotState::Idle => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.holder().is_some()
    }
}

/// Held while the slot is Running; dropping it returns the slot to Idle.
#[derive(Debug)]
pub struct SlotGuard {
    state: Arc<Mutex<SlotState>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SlotState::Idle;
    }
}
