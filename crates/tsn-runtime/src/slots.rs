//! External value slots shared with the pub/sub engine.
//!
//! Each slot is a fixed memory location holding one 64-bit counter plus a
//! validity marker. The engine reads and writes the slot directly while
//! encoding or decoding a frame instead of going through its normal value
//! API.
//!
//! # Threading Model
//!
//! Slots are not protected by a lock. Ownership is handed over by phase
//! within each cycle:
//!
//! ```text
//!  0 %            30 %                      60 %                 100 %
//!  |-- subscriber -|--- user application ----|---- publisher ------|
//!  writes sub-*     writes pub-*, reads sub-*  reads pub-*
//! ```
//!
//! Each slot has at most one writer per phase window and the windows never
//! overlap, so plain atomic loads and stores are sufficient. Reordering the
//! phases in the configuration silently breaks this; `TsnConfig::validate`
//! rejects such configurations.

use crossbeam_utils::CachePadded;
use static_assertions::assert_impl_all;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tsn_common::config::REPEATED_COUNTERS;
use tsn_common::error::{TsnError, TsnResult};

/// Initial value of the publisher's repeated counters.
pub const REPEATED_COUNTER_START: u64 = 10;

/// One externally visible 64-bit value.
#[derive(Debug, Default)]
pub struct ValueSlot {
    value: AtomicU64,
    valid: AtomicBool,
}

impl ValueSlot {
    /// Create an empty, invalid slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current raw value, regardless of validity.
    #[inline]
    #[must_use]
    pub fn load(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Current value if the slot has been written.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<u64> {
        if self.valid.load(Ordering::Acquire) {
            Some(self.load())
        } else {
            None
        }
    }

    /// Store a value and mark the slot valid.
    #[inline]
    pub fn store(&self, value: u64) {
        self.value.store(value, Ordering::Release);
        self.valid.store(true, Ordering::Release);
    }

    /// Add one and return the new value.
    ///
    /// A plain load/store pair: only the task owning the current phase
    /// window may call this.
    #[inline]
    pub fn increment(&self) -> u64 {
        let next = self.load().wrapping_add(1);
        self.store(next);
        next
    }

    /// Whether the slot currently holds a value.
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the slot as holding no value.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// The memory location the engine binds to its data source.
    #[must_use]
    pub fn as_atomic(&self) -> &AtomicU64 {
        &self.value
    }
}

/// Index of a slot inside a [`ValueSlotArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    /// Position in the arena.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Fixed set of slots allocated once at topology setup.
#[derive(Debug)]
pub struct ValueSlotArena {
    slots: Box<[CachePadded<ValueSlot>]>,
}

assert_impl_all!(ValueSlotArena: Send, Sync);

impl ValueSlotArena {
    /// Allocate `count` empty slots.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::SlotAllocation`] if the memory cannot be reserved.
    pub fn try_new(count: usize) -> TsnResult<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(count)
            .map_err(|e| TsnError::SlotAllocation(format!("{count} slots: {e}")))?;
        slots.extend((0..count).map(|_| CachePadded::new(ValueSlot::new())));
        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the arena holds no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot by id, or `None` if the id belongs to a different arena.
    #[must_use]
    pub fn get(&self, id: SlotId) -> Option<&ValueSlot> {
        self.slots.get(id.0).map(|slot| &**slot)
    }

    /// Ids of all slots in allocation order.
    pub fn ids(&self) -> impl Iterator<Item = SlotId> {
        (0..self.slots.len()).map(SlotId)
    }
}

/// How the engine is notified about reads and writes of a slot.
///
/// Values are exchanged through direct memory access, so the default
/// implementations accept everything and do nothing.
pub trait ValueSourceHooks: Send + Sync {
    /// Called before the engine reads a slot through its value API.
    ///
    /// # Errors
    ///
    /// An error makes the engine reject the read.
    fn on_read(&self, _slot: SlotId) -> TsnResult<()> {
        Ok(())
    }

    /// Called when a value is written through the engine's value API.
    ///
    /// # Errors
    ///
    /// An error makes the engine reject the write.
    fn on_write(&self, _slot: SlotId, _value: u64) -> TsnResult<()> {
        Ok(())
    }
}

/// Hooks for slots updated only through direct memory access.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectMemoryAccess;

impl ValueSourceHooks for DirectMemoryAccess {}

/// Name under which a slot is exposed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotBinding {
    /// Node name in the engine's address space.
    pub name: String,
    /// Slot backing the node.
    pub slot: SlotId,
}

/// The publisher- and subscriber-facing counters of one topology.
///
/// Cloning is cheap; every clone refers to the same arena.
#[derive(Debug, Clone)]
pub struct CounterSlots {
    arena: Arc<ValueSlotArena>,
    publisher: SlotId,
    publisher_repeated: [SlotId; REPEATED_COUNTERS],
    subscriber: SlotId,
    subscriber_repeated: [SlotId; REPEATED_COUNTERS],
}

impl CounterSlots {
    /// Allocate the counter slots.
    ///
    /// The publisher counters start valid (main at 0, repeated at
    /// [`REPEATED_COUNTER_START`]); the subscriber counters stay invalid
    /// until the first frame is decoded.
    ///
    /// # Errors
    ///
    /// Returns [`TsnError::SlotAllocation`] if the arena cannot be allocated.
    pub fn allocate() -> TsnResult<Self> {
        let per_direction = 1 + REPEATED_COUNTERS;
        let arena = ValueSlotArena::try_new(2 * per_direction)?;
        let ids: Vec<SlotId> = arena.ids().collect();

        let publisher = ids[0];
        let subscriber = ids[per_direction];
        let publisher_repeated: [SlotId; REPEATED_COUNTERS] = std::array::from_fn(|i| ids[1 + i]);
        let subscriber_repeated: [SlotId; REPEATED_COUNTERS] =
            std::array::from_fn(|i| ids[per_direction + 1 + i]);

        let slots = Self {
            arena: Arc::new(arena),
            publisher,
            publisher_repeated,
            subscriber,
            subscriber_repeated,
        };
        slots.reset_publisher();
        Ok(slots)
    }

    /// Set the publisher counters to their start values.
    pub fn reset_publisher(&self) {
        self.publisher_counter().store(0);
        for slot in self.publisher_repeated() {
            slot.store(REPEATED_COUNTER_START);
        }
    }

    /// The underlying arena.
    #[must_use]
    pub fn arena(&self) -> &Arc<ValueSlotArena> {
        &self.arena
    }

    fn slot(&self, id: SlotId) -> &ValueSlot {
        // Ids are only ever produced from this arena in `allocate`.
        &self.arena.slots[id.0]
    }

    /// Main publisher counter.
    #[must_use]
    pub fn publisher_counter(&self) -> &ValueSlot {
        self.slot(self.publisher)
    }

    /// Slot id of the main publisher counter.
    #[must_use]
    pub fn publisher_counter_id(&self) -> SlotId {
        self.publisher
    }

    /// Slot id of the main subscriber counter.
    #[must_use]
    pub fn subscriber_counter_id(&self) -> SlotId {
        self.subscriber
    }

    /// Repeated publisher counters.
    pub fn publisher_repeated(&self) -> impl Iterator<Item = &ValueSlot> {
        self.publisher_repeated.iter().map(|&id| self.slot(id))
    }

    /// Main subscriber counter.
    #[must_use]
    pub fn subscriber_counter(&self) -> &ValueSlot {
        self.slot(self.subscriber)
    }

    /// Repeated subscriber counters.
    pub fn subscriber_repeated(&self) -> impl Iterator<Item = &ValueSlot> {
        self.subscriber_repeated.iter().map(|&id| self.slot(id))
    }

    /// Advance every publisher-facing counter by one. Returns the new main
    /// counter value.
    pub fn increment_publisher(&self) -> u64 {
        let value = self.publisher_counter().increment();
        for slot in self.publisher_repeated() {
            slot.increment();
        }
        value
    }

    /// Node names and slots the engine binds as external data sources.
    #[must_use]
    pub fn bindings(&self) -> Vec<SlotBinding> {
        let mut bindings = vec![
            SlotBinding {
                name: "PublisherCounter".into(),
                slot: self.publisher,
            },
            SlotBinding {
                name: "SubscriberCounter".into(),
                slot: self.subscriber,
            },
        ];
        bindings.extend(self.publisher_repeated.iter().enumerate().map(|(i, &slot)| SlotBinding {
            name: format!("PublisherRepeatedCounter{i}"),
            slot,
        }));
        bindings.extend(self.subscriber_repeated.iter().enumerate().map(|(i, &slot)| SlotBinding {
            name: format!("SubscriberRepeatedCounter{i}"),
            slot,
        }));
        bindings
    }
}
