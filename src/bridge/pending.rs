//! Single-slot command buffer

/// Holds at most one item; a newer item replaces the older one.
#[derive(Debug)]
pub struct PendingSlot<T> {
    slot: Option<T>,
}

impl<T> PendingSlot<T> {
    pub fn new() -> Self {
        Self { slot: None }
    }

    /// Store `item`, returning the entry it superseded
    pub fn replace(&mut self, item: T) -> Option<T> {
        self.slot.replace(item)
    }

    pub fn take(&mut self) -> Option<T> {
        self.slot.take()
    }

    pub fn peek(&self) -> Option<&T> {
        self.slot.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
}

impl<T> Default for PendingSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
