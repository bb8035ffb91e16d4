//! Command barriers: register-write effects deferred past a draw.
//!
//! Real hardware pipelines vertex fetch ahead of register updates; a
//! mid-draw write to a vertex base offset must not affect vertices
//! already latched. Queuing the write and applying it at clause-compile
//! time reproduces that without modeling an actual pipeline.

/// What kind of deferred state a barrier carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    VertexBaseOffset,
    IndexBaseOffset,
    VertexArrayOffset,
    TransformConstantLoad,
}

/// Sentinel: ordering falls back to submission timestamps
pub const NO_ADDRESS: u32 = u32::MAX;

/// A single deferred register write
#[derive(Debug, Clone, Copy)]
pub struct CommandBarrier {
    pub kind: BarrierKind,
    /// Register the captured value re-commits to at apply time
    pub register: u32,
    pub arg: u32,
    /// Sub-resource index (e.g. vertex attribute) for array registers
    pub index: u32,
    /// Guest address for address-keyed barrier types, NO_ADDRESS
    /// otherwise
    pub address: u32,
    /// Submission order within the clause
    pub timestamp: u64,
}

impl CommandBarrier {
    /// Address-keyed barriers apply in address order and sort ahead of
    /// the NO_ADDRESS group, which applies in submission order.
    fn sort_key(&self) -> (u32, u64) {
        (self.address, self.timestamp)
    }
}

/// Queue of deferred writes for the draw currently accumulating
#[derive(Debug, Default)]
pub struct BarrierQueue {
    entries: Vec<CommandBarrier>,
    next_timestamp: u64,
}

impl BarrierQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a deferred write. Legal only while a draw is accumulating
    /// and the written value differs from the current latch; both are
    /// enforced by the dispatch layer.
    pub fn enqueue(
        &mut self,
        kind: BarrierKind,
        register: u32,
        arg: u32,
        index: u32,
        address: Option<u32>,
    ) {
        let timestamp = self.next_timestamp;
        self.next_timestamp += 1;
        self.entries.push(CommandBarrier {
            kind,
            register,
            arg,
            index,
            address: address.unwrap_or(NO_ADDRESS),
            timestamp,
        });
    }

    /// Take every queued barrier in apply order; the queue is empty
    /// afterwards. Barriers never survive past one draw.
    pub fn drain_ordered(&mut self) -> Vec<CommandBarrier> {
        let mut entries = std::mem::take(&mut self.entries);
        entries.sort_by_key(|b| b.sort_key());
        self.next_timestamp = 0;
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
