//! In-process stand-in for the pub/sub protocol engine.
//!
//! The writer group "transmits" the publisher counters into a shared frame
//! buffer; the reader group "receives" that frame into the subscriber
//! counters. Both sides reach the counters through the external value slots
//! exactly as a real engine would, and register their cyclic work through
//! the [`CycleHooks`] of the core.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};
use tsn_common::config::{TsnConfig, REPEATED_COUNTERS};
use tsn_common::error::TsnResult;
use tsn_runtime::engine::{CycleParams, GroupId};
use tsn_runtime::registry::{CycleHandle, CycleHooks};
use tsn_runtime::slots::{CounterSlots, DirectMemoryAccess, SlotId, ValueSourceHooks};

/// The single frame in flight between writer and reader group.
#[derive(Debug, Default)]
pub struct LoopbackFrame {
    present: AtomicBool,
    sequence: AtomicU64,
    counter: AtomicU64,
    repeated: [AtomicU64; REPEATED_COUNTERS],
    transmission_time_ns: AtomicU64,
}

impl LoopbackFrame {
    /// Sequence number of the last transmitted frame.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Egress time requested for the last transmitted frame.
    #[must_use]
    pub fn transmission_time_ns(&self) -> u64 {
        self.transmission_time_ns.load(Ordering::Acquire)
    }
}

struct Publisher {
    slots: CounterSlots,
    frame: Arc<LoopbackFrame>,
    hooks: Arc<dyn ValueSourceHooks>,
    counter_slot: SlotId,
}

impl Publisher {
    fn transmit(&mut self, params: &CycleParams) {
        if self.hooks.on_read(self.counter_slot).is_err() {
            return;
        }
        self.frame
            .counter
            .store(self.slots.publisher_counter().load(), Ordering::Release);
        for (wire, slot) in self.frame.repeated.iter().zip(self.slots.publisher_repeated()) {
            wire.store(slot.load(), Ordering::Release);
        }
        if let Some(transport) = params.transport {
            self.frame
                .transmission_time_ns
                .store(transport.transmission_time_ns, Ordering::Release);
        }
        self.frame.sequence.fetch_add(1, Ordering::AcqRel);
        self.frame.present.store(true, Ordering::Release);
        trace!(cycle = params.cycle, "Frame transmitted");
    }
}

struct Subscriber {
    slots: CounterSlots,
    frame: Arc<LoopbackFrame>,
    hooks: Arc<dyn ValueSourceHooks>,
    counter_slot: SlotId,
    last_sequence: u64,
}

impl Subscriber {
    fn receive(&mut self, params: &CycleParams) {
        if !self.frame.present.load(Ordering::Acquire) {
            return;
        }
        let sequence = self.frame.sequence();
        if sequence == self.last_sequence {
            return;
        }
        let counter = self.frame.counter.load(Ordering::Acquire);
        if self.hooks.on_write(self.counter_slot, counter).is_err() {
            return;
        }
        self.slots.subscriber_counter().store(counter);
        for (slot, wire) in self.slots.subscriber_repeated().zip(&self.frame.repeated) {
            slot.store(wire.load(Ordering::Acquire));
        }
        self.last_sequence = sequence;
        trace!(cycle = params.cycle, sequence, counter, "Frame received");
    }
}

/// Loopback engine with one writer group and one reader group.
pub struct LoopbackEngine {
    slots: CounterSlots,
    frame: Arc<LoopbackFrame>,
    hooks: Arc<dyn ValueSourceHooks>,
    writer_group: GroupId,
    reader_group: GroupId,
    interval_ms: f64,
}

impl LoopbackEngine {
    /// Build the engine topology on top of the counter slots.
    #[must_use]
    pub fn new(slots: CounterSlots, config: &TsnConfig) -> Self {
        for binding in slots.bindings() {
            debug!(node = %binding.name, slot = binding.slot.index(), "External data source bound");
        }
        info!(
            interface = config.transport.interface.as_deref().unwrap_or("<none>"),
            socket_priority = config.transport.socket_priority,
            publish = %config.transport.publish_address,
            subscribe = %config.transport.subscribe_address,
            so_txtime = config.transport.so_txtime,
            "Loopback engine configured"
        );
        Self {
            slots,
            frame: Arc::new(LoopbackFrame::default()),
            hooks: Arc::new(DirectMemoryAccess),
            writer_group: GroupId(config.transport.writer_group_id),
            reader_group: GroupId(config.transport.reader_group_id),
            interval_ms: config.cycle_time_ms,
        }
    }

    /// The shared frame buffer.
    #[must_use]
    pub fn frame(&self) -> &Arc<LoopbackFrame> {
        &self.frame
    }

    fn publisher(&self) -> Publisher {
        Publisher {
            slots: self.slots.clone(),
            frame: Arc::clone(&self.frame),
            hooks: Arc::clone(&self.hooks),
            counter_slot: self.slots.publisher_counter_id(),
        }
    }

    fn subscriber(&self) -> Subscriber {
        Subscriber {
            slots: self.slots.clone(),
            frame: Arc::clone(&self.frame),
            hooks: Arc::clone(&self.hooks),
            counter_slot: self.slots.subscriber_counter_id(),
            last_sequence: 0,
        }
    }

    /// Register the reader and writer group with the core.
    ///
    /// The reader group is registered first. If the writer group fails, the
    /// reader cycle is removed again before the error is returned.
    ///
    /// # Errors
    ///
    /// Propagates registration failures from `hooks`.
    pub fn start(&self, hooks: &dyn CycleHooks) -> TsnResult<Vec<CycleHandle>> {
        let mut subscriber = self.subscriber();
        let reader = hooks.add_cycle(
            self.reader_group,
            Box::new(move |params: &CycleParams| subscriber.receive(params)),
            self.interval_ms,
        )?;

        let mut publisher = self.publisher();
        let writer = hooks.add_cycle(
            self.writer_group,
            Box::new(move |params: &CycleParams| publisher.transmit(params)),
            self.interval_ms,
        );
        match writer {
            Ok(writer) => Ok(vec![reader, writer]),
            Err(e) => {
                hooks.remove_cycle(reader);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsn_common::time::AbsoluteWakeTime;
    use tsn_runtime::engine::TransportParams;

    fn params(cycle: u64, transport: Option<TransportParams>) -> CycleParams {
        CycleParams {
            cycle,
            wake_time: AbsoluteWakeTime::new(1, 0),
            transport,
        }
    }

    #[test]
    fn test_frame_carries_publisher_counters() {
        let slots = CounterSlots::allocate().unwrap();
        let engine = LoopbackEngine::new(slots.clone(), &TsnConfig::default());
        let mut publisher = engine.publisher();
        let mut subscriber = engine.subscriber();

        // Nothing sent yet
        subscriber.receive(&params(0, None));
        assert_eq!(slots.subscriber_counter().get(), None);

        slots.increment_publisher();
        publisher.transmit(&params(
            0,
            Some(TransportParams {
                txtime_enabled: true,
                transmission_time_ns: 42,
            }),
        ));
        subscriber.receive(&params(1, None));

        assert_eq!(slots.subscriber_counter().get(), Some(1));
        assert!(slots.subscriber_repeated().all(|s| s.get() == Some(11)));
        assert_eq!(engine.frame().sequence(), 1);
        assert_eq!(engine.frame().transmission_time_ns(), 42);
    }

    #[test]
    fn test_stale_frame_not_reapplied() {
        let slots = CounterSlots::allocate().unwrap();
        let engine = LoopbackEngine::new(slots.clone(), &TsnConfig::default());
        let mut publisher = engine.publisher();
        let mut subscriber = engine.subscriber();

        slots.increment_publisher();
        publisher.transmit(&params(0, None));
        subscriber.receive(&params(1, None));

        // Local overwrite survives until a new frame arrives
        slots.subscriber_counter().store(99);
        subscriber.receive(&params(2, None));
        assert_eq!(slots.subscriber_counter().load(), 99);

        publisher.transmit(&params(1, None));
        subscriber.receive(&params(3, None));
        assert_eq!(slots.subscriber_counter().load(), 1);
    }
}
