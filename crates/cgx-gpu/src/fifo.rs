//! FIFO cursor, control block, and command header decoding.
//!
//! The ring buffer itself lives in guest memory and is written by the
//! command producer; this module only tracks position inside it and
//! decodes the word headers that delimit register runs.

use std::sync::atomic::AtomicU32;
use std::time::{Duration, Instant};

const METHOD_COUNT_SHIFT: u32 = 18;
const METHOD_COUNT_MASK: u32 = 0x7FF;
const METHOD_NON_INCREMENT_FLAG: u32 = 0x4000_0000;
const OLD_JUMP_MASK: u32 = 0xE000_0003;
const OLD_JUMP_CMD: u32 = 0x2000_0000;
const JUMP_CMD: u32 = 0x0000_0001;
const CALL_CMD: u32 = 0x0000_0002;
const RETURN_MASK: u32 = 0xFFFF_0003;
const RETURN_CMD: u32 = 0x0002_0000;

/// Shared control block read by the command producer. `put` is written
/// by the producer; `get` and `reference` are published by this core
/// with release ordering once the corresponding work has flushed.
#[derive(Debug, Default)]
pub struct CommandControl {
    pub put: AtomicU32,
    pub get: AtomicU32,
    pub reference: AtomicU32,
}

impl CommandControl {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Decoded FIFO command word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoCommand {
    Nop,
    Jump(u32),
    Call(u32),
    Return,
    Method {
        reg: u32,
        count: u32,
        non_increment: bool,
        unaligned: bool,
    },
}

/// Classify one command word
pub fn decode_header(cmd: u32) -> FifoCommand {
    if cmd == 0 {
        return FifoCommand::Nop;
    }
    if (cmd & OLD_JUMP_MASK) == OLD_JUMP_CMD {
        return FifoCommand::Jump(cmd & 0x1FFF_FFFC);
    }
    if (cmd & 3) == JUMP_CMD {
        return FifoCommand::Jump(cmd & !3);
    }
    if (cmd & 3) == CALL_CMD {
        return FifoCommand::Call(cmd & !3);
    }
    if (cmd & RETURN_MASK) == RETURN_CMD {
        return FifoCommand::Return;
    }
    FifoCommand::Method {
        reg: cmd & 0xFFFC,
        count: (cmd >> METHOD_COUNT_SHIFT) & METHOD_COUNT_MASK,
        non_increment: (cmd & METHOD_NON_INCREMENT_FLAG) != 0,
        unaligned: (cmd & 3) != 0,
    }
}

/// Encode a method header (incrementing register run)
pub fn encode_method(reg: u32, count: u32) -> u32 {
    ((count & METHOD_COUNT_MASK) << METHOD_COUNT_SHIFT) | (reg & 0xFFFC)
}

/// Encode a method header that writes `count` words to one register
pub fn encode_method_non_increment(reg: u32, count: u32) -> u32 {
    encode_method(reg, count) | METHOD_NON_INCREMENT_FLAG
}

/// Encode a jump to an absolute FIFO position
pub fn encode_jump(addr: u32) -> u32 {
    (addr & !3) | JUMP_CMD
}

/// How many words one batched application may consume: bounded by the
/// method's remaining argument count, the words available before the
/// producer pointer, and the register range the handler owns.
pub fn batch_len(args_remaining: u32, words_before_put: u32, method_range: u32) -> u32 {
    args_remaining.min(words_before_put).min(method_range)
}

/// Words published at `arg_addr` and onwards. A producer pointer behind
/// the current header is no forward bound (the stream wrapped); one at
/// or before `arg_addr` means nothing there is published yet.
pub fn words_before_put(header_addr: u32, arg_addr: u32, put: u32) -> u32 {
    if put < header_addr {
        u32::MAX
    } else if put > arg_addr {
        (put - arg_addr) / 4
    } else {
        0
    }
}

/// Position inside the command ring buffer. Advances strictly forward;
/// rewound only by explicit recovery.
#[derive(Debug)]
pub struct FifoCursor {
    /// Byte address of the next command word
    pub get: u32,
    /// Arguments left in the method run currently being processed
    pub remaining: u32,
    /// Producer pointer as of the last control-block read
    pub put_snapshot: u32,
    pub recovery_requested: bool,
    restore_point: u32,
    last_recovery: Option<u32>,
    call_stack: Vec<u32>,
}

impl FifoCursor {
    pub fn new(start: u32) -> Self {
        Self {
            get: start,
            remaining: 0,
            put_snapshot: start,
            recovery_requested: false,
            restore_point: start,
            last_recovery: None,
            call_stack: Vec::new(),
        }
    }

    pub fn begin_method(&mut self, count: u32) {
        self.remaining = count;
    }

    /// Consume `n` argument words; the batch decoder calls this with
    /// n > 1 to skip the words it already applied.
    pub fn consume(&mut self, n: u32) {
        self.remaining = self.remaining.saturating_sub(n);
    }

    /// Mark the current position as safe to restart from
    pub fn set_restore_point(&mut self) {
        self.restore_point = self.get;
        self.last_recovery = None;
    }

    pub fn request_recovery(&mut self) {
        self.recovery_requested = true;
    }

    pub fn call(&mut self, target: u32) {
        self.call_stack.push(self.get + 4);
        self.get = target;
    }

    pub fn ret(&mut self) -> Option<u32> {
        self.call_stack.pop()
    }

    /// Reset to the last known-safe point. If that point already failed
    /// once, the stream is unrecoverable and the queue is discarded up
    /// to the producer pointer.
    pub fn recover(&mut self) {
        self.remaining = 0;
        self.call_stack.clear();
        self.recovery_requested = false;
        if self.last_recovery == Some(self.restore_point) {
            tracing::error!(
                "FIFO failed to recover at 0x{:08x}; discarding queue to put=0x{:08x}",
                self.restore_point,
                self.put_snapshot
            );
            self.get = self.put_snapshot;
            self.last_recovery = None;
        } else {
            tracing::error!("recovering FIFO to restore point 0x{:08x}", self.restore_point);
            self.get = self.restore_point;
            self.last_recovery = Some(self.restore_point);
        }
    }
}

/// Coarse processing state, mirrored into the performance counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoState {
    Running,
    Empty,
    Spinning,
    Nop,
    Paused,
}

/// Idle/busy accounting and event counts for the processing thread
#[derive(Debug)]
pub struct FifoCounters {
    pub state: FifoState,
    /// Accumulated time spent outside of Running
    pub idle_time: Duration,
    idle_since: Option<Instant>,
    epoch: Instant,
    pub methods_processed: u64,
    pub draw_calls: u64,
    pub recoveries: u64,
    pub semaphore_timeouts: u64,
}

impl FifoCounters {
    pub fn new() -> Self {
        Self {
            state: FifoState::Empty,
            idle_time: Duration::ZERO,
            idle_since: Some(Instant::now()),
            epoch: Instant::now(),
            methods_processed: 0,
            draw_calls: 0,
            recoveries: 0,
            semaphore_timeouts: 0,
        }
    }

    /// Transition state, folding any completed idle span into the total
    pub fn set_state(&mut self, state: FifoState) {
        if state == FifoState::Running {
            if let Some(since) = self.idle_since.take() {
                self.idle_time += since.elapsed();
            }
        } else if self.idle_since.is_none() {
            self.idle_since = Some(Instant::now());
        }
        self.state = state;
    }

    /// Microseconds since processor start, used for report timestamps
    pub fn timestamp_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

impl Default for FifoCounters {
    fn default() -> Self {
        Self::new()
    }
}
