use std::collections::HashMap;

use tracing::debug;
use wasmtime::ResourceLimiter;

use crate::internal::channel::{ChannelRegistry, Envelope};

/// The bridge ABI uses no tables; this only stops a guest from growing its
/// own without bound.
const MAX_TABLE_ELEMENTS: usize = 10_000;

/// Guest-visible message handles. Handles are only valid during the guest
/// call that created or received them.
#[derive(Default)]
pub struct MessageTable {
    next: i32,
    entries: HashMap<i32, Envelope>,
}

impl MessageTable {
    pub fn insert(&mut self, envelope: Envelope) -> i32 {
        loop {
            self.next = if self.next >= i32::MAX { 1 } else { self.next + 1 };
            if !self.entries.contains_key(&self.next) {
                break;
            }
        }
        self.entries.insert(self.next, envelope);
        self.next
    }

    pub fn get(&self, handle: i32) -> Option<&Envelope> {
        self.entries.get(&handle)
    }

    pub fn get_mut(&mut self, handle: i32) -> Option<&mut Envelope> {
        self.entries.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: i32) -> Option<Envelope> {
        self.entries.remove(&handle)
    }

    /// Put back an envelope the host could not take, under its old handle.
    pub fn restore(&mut self, handle: i32, envelope: Envelope) {
        self.entries.insert(handle, envelope);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub struct ScopeState {
    pub channels: ChannelRegistry,
    pub messages: MessageTable,
    memory_cap: usize,
    memory_peak: usize,
}

impl ScopeState {
    pub fn new(memory_cap: usize, outbound_capacity: usize) -> Self {
        Self {
            channels: ChannelRegistry::new(outbound_capacity),
            messages: MessageTable::default(),
            memory_cap,
            memory_peak: 0,
        }
    }

    /// Largest linear memory the guest has been allowed to grow to.
    pub const fn memory_peak(&self) -> usize {
        self.memory_peak
    }
}

impl ResourceLimiter for ScopeState {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.memory_cap {
            debug!(current, desired, cap = self.memory_cap, "refused memory growth");
            return Ok(false);
        }
        self.memory_peak = self.memory_peak.max(desired);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }
}
