//! Fixed-capacity ring queue of raw samples.
//!
//! Shared between the timer context and foreground commands, so every
//! operation takes the global mask internally; callers never lock around
//! it. Capacity is fixed at construction, storage is heap-allocated once
//! and never resized. A write into a full queue evicts the oldest
//! element rather than failing, which is what both the sample history
//! and the event-code queues want.

use rig_common::error::RigError;

use crate::critical;

pub struct RingQueue {
    in_use: u16,
    read_index: u16,
    write_index: u16,
    buffer: Box<[u16]>,
}

impl RingQueue {
    /// Allocate a queue holding up to `size` elements.
    pub fn new(size: u16) -> Result<Self, RigError> {
        if size == 0 {
            return Err(RigError::Config("ring queue size must be > 0"));
        }
        Ok(Self {
            in_use: 0,
            read_index: 0,
            write_index: 0,
            buffer: vec![0u16; usize::from(size)].into_boxed_slice(),
        })
    }

    /// Discard all queued elements. The storage is kept.
    pub fn reset(&mut self) {
        let _mask = critical::enter();
        self.in_use = 0;
        self.read_index = 0;
        self.write_index = 0;
    }

    /// Append one element, evicting the oldest if the queue is full.
    pub fn write(&mut self, value: u16) {
        let _mask = critical::enter();
        let size = self.size();
        self.buffer[usize::from(self.write_index)] = value;
        self.write_index = (self.write_index + 1) % size;
        if self.in_use == size {
            // Overwrote the oldest element; the read cursor moves with it.
            self.read_index = (self.read_index + 1) % size;
        } else {
            self.in_use += 1;
        }
    }

    /// Append a block of elements. Refused if the block cannot fit in
    /// the queue at all; eviction of older elements is still fine.
    pub fn write_block(&mut self, values: &[u16]) -> Result<(), RigError> {
        let _mask = critical::enter();
        if values.len() > usize::from(self.size()) {
            return Err(RigError::Capacity("block larger than ring queue"));
        }
        for &value in values {
            self.write(value);
        }
        Ok(())
    }

    /// Remove and return the oldest element.
    pub fn read(&mut self) -> Option<u16> {
        let _mask = critical::enter();
        if self.in_use == 0 {
            return None;
        }
        let value = self.buffer[usize::from(self.read_index)];
        self.read_index = (self.read_index + 1) % self.size();
        self.in_use -= 1;
        Some(value)
    }

    /// Remove the `out.len()` oldest elements into `out`, oldest first.
    /// Refused without side effects if fewer elements are queued.
    pub fn read_block(&mut self, out: &mut [u16]) -> Result<(), RigError> {
        let _mask = critical::enter();
        if out.len() > usize::from(self.in_use) {
            return Err(RigError::Capacity("ring queue holds fewer elements"));
        }
        for slot in out.iter_mut() {
            // Cannot fail: occupancy was checked under the same mask.
            *slot = self.buffer[usize::from(self.read_index)];
            self.read_index = (self.read_index + 1) % self.size();
            self.in_use -= 1;
        }
        Ok(())
    }

    #[inline]
    pub fn size(&self) -> u16 {
        self.buffer.len() as u16
    }

    #[inline]
    pub fn in_use(&self) -> u16 {
        self.in_use
    }

    #[inline]
    pub fn available(&self) -> u16 {
        self.size() - self.in_use
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.in_use == self.size()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
