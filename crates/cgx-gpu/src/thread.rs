//! The command processing loop.
//!
//! One logical thread owns all mutable processor state; everything it
//! shares with other threads (guest memory, the control block, the stop
//! flag) is atomic. [`CommandProcessor::process`] drains the FIFO until
//! it runs dry, the stream parks, or execution pauses.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cgx_core::config::ProcessorConfig;
use cgx_core::error::GpuError;
use cgx_memory::{GuestMemory, MemoryMap};

use crate::backend::{NullBackend, RenderBackend};
use crate::barrier::BarrierQueue;
use crate::clause::DrawClause;
use crate::fifo::{self, CommandControl, FifoCommand, FifoCounters, FifoCursor, FifoState};
use crate::methods::MethodTable;
use crate::regs::RegisterFile;

/// Debugger-facing execution control
#[derive(Debug, Default)]
pub struct ExecState {
    pub paused: bool,
    /// Pause once the next draw clause closes
    pub step_pending: bool,
}

/// Everything a method handler may touch, borrowed for one dispatch.
///
/// Handlers get the whole processing context rather than narrow views
/// because the interesting methods cut across concerns: a semaphore
/// release reads registers, flushes the backend, and writes memory.
pub struct Context<'a> {
    pub table: &'a MethodTable,
    pub regs: &'a mut RegisterFile,
    pub cursor: &'a mut FifoCursor,
    pub clause: &'a mut DrawClause,
    pub barriers: &'a mut BarrierQueue,
    pub backend: &'a mut dyn RenderBackend,
    pub memory: &'a GuestMemory,
    pub map: &'a MemoryMap,
    pub control: &'a CommandControl,
    pub config: &'a ProcessorConfig,
    pub counters: &'a mut FifoCounters,
    pub exec: &'a mut ExecState,
    pub stop: &'a AtomicBool,
    /// Latch value the current register held before this dispatch;
    /// committing it back is the rollback path
    pub prior: u32,
    /// Set while queued barriers are being re-dispatched so they cannot
    /// defer again
    pub replaying_barriers: bool,
}

/// Owns the register file, FIFO position, and draw state, and drives
/// them from the command stream in guest memory.
pub struct CommandProcessor {
    table: MethodTable,
    regs: RegisterFile,
    cursor: FifoCursor,
    clause: DrawClause,
    barriers: BarrierQueue,
    backend: Box<dyn RenderBackend>,
    memory: Arc<GuestMemory>,
    map: Arc<MemoryMap>,
    control: Arc<CommandControl>,
    config: ProcessorConfig,
    counters: FifoCounters,
    exec: ExecState,
    stop: Arc<AtomicBool>,
}

impl CommandProcessor {
    pub fn new(
        memory: Arc<GuestMemory>,
        map: Arc<MemoryMap>,
        control: Arc<CommandControl>,
        config: ProcessorConfig,
    ) -> Self {
        Self::with_backend(memory, map, control, config, Box::new(NullBackend::new()))
    }

    pub fn with_backend(
        memory: Arc<GuestMemory>,
        map: Arc<MemoryMap>,
        control: Arc<CommandControl>,
        config: ProcessorConfig,
        backend: Box<dyn RenderBackend>,
    ) -> Self {
        Self {
            table: MethodTable::new(),
            regs: RegisterFile::new(),
            cursor: FifoCursor::new(control.get.load(Ordering::Acquire)),
            clause: DrawClause::new(),
            barriers: BarrierQueue::new(),
            backend,
            memory,
            map,
            control,
            config,
            counters: FifoCounters::new(),
            exec: ExecState::default(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn context(&mut self) -> Context<'_> {
        Context {
            table: &self.table,
            regs: &mut self.regs,
            cursor: &mut self.cursor,
            clause: &mut self.clause,
            barriers: &mut self.barriers,
            backend: self.backend.as_mut(),
            memory: self.memory.as_ref(),
            map: self.map.as_ref(),
            control: self.control.as_ref(),
            config: &self.config,
            counters: &mut self.counters,
            exec: &mut self.exec,
            stop: &self.stop,
            prior: 0,
            replaying_barriers: false,
        }
    }

    /// Apply a single register write directly, outside the FIFO. Used
    /// by the embedder for context setup and by tests.
    pub fn execute(&mut self, reg: u32, value: u32) {
        let mut ctx = self.context();
        let table = ctx.table;
        table.dispatch(&mut ctx, reg, value);
        // Direct writes have no stream position to rewind
        if ctx.cursor.recovery_requested {
            ctx.cursor.recovery_requested = false;
            ctx.counters.recoveries += 1;
        }
    }

    /// Drain the FIFO until it is empty, parked, or execution pauses
    pub fn process(&mut self) {
        let mut ctx = self.context();
        pump(&mut ctx);
    }

    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn counters(&self) -> &FifoCounters {
        &self.counters
    }

    pub fn control(&self) -> &CommandControl {
        &self.control
    }

    /// Cooperative shutdown flag, shared with any spinning wait
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn request_single_step(&mut self) {
        self.exec.step_pending = true;
    }

    pub fn resume(&mut self) {
        self.exec.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.exec.paused
    }
}

fn pump(ctx: &mut Context<'_>) {
    let table = ctx.table;
    loop {
        if ctx.exec.paused {
            ctx.counters.set_state(FifoState::Paused);
            return;
        }
        if ctx.stop.load(Ordering::Relaxed) {
            return;
        }

        ctx.control.get.store(ctx.cursor.get, Ordering::Release);
        let put = ctx.control.put.load(Ordering::Acquire);
        ctx.cursor.put_snapshot = put;
        if put == ctx.cursor.get {
            ctx.counters.set_state(FifoState::Empty);
            return;
        }

        let header = match ctx.memory.read32(ctx.cursor.get) {
            Ok(word) => word,
            Err(e) => {
                tracing::error!(
                    "FIFO read at 0x{:08x} failed: {}",
                    ctx.cursor.get,
                    GpuError::BadResourceAddress(e)
                );
                ctx.counters.recoveries += 1;
                ctx.cursor.recover();
                continue;
            }
        };

        match fifo::decode_header(header) {
            FifoCommand::Nop => {
                ctx.counters.set_state(FifoState::Nop);
                ctx.cursor.get += 4;
            }
            FifoCommand::Jump(addr) => {
                if addr == ctx.cursor.get {
                    // Producer parks the stream by jumping to itself
                    ctx.counters.set_state(FifoState::Spinning);
                    return;
                }
                ctx.cursor.get = addr;
            }
            FifoCommand::Call(addr) => {
                ctx.cursor.call(addr);
            }
            FifoCommand::Return => match ctx.cursor.ret() {
                Some(addr) => ctx.cursor.get = addr,
                None => {
                    tracing::error!("RET with an empty call stack, discarding queue");
                    ctx.cursor.get = put;
                }
            },
            FifoCommand::Method {
                reg,
                count,
                non_increment,
                unaligned,
            } => {
                if unaligned {
                    tracing::warn!(
                        "method header 0x{header:08x} at 0x{:08x} has alignment bits set",
                        ctx.cursor.get
                    );
                }
                ctx.counters.set_state(FifoState::Running);
                process_method(ctx, table, reg, count, non_increment, put);
                if ctx.cursor.recovery_requested {
                    ctx.counters.recoveries += 1;
                    ctx.cursor.recover();
                }
            }
        }
    }
}

fn process_method(
    ctx: &mut Context<'_>,
    table: &MethodTable,
    reg: u32,
    count: u32,
    non_increment: bool,
    put: u32,
) {
    let args_base = ctx.cursor.get + 4;
    let end = args_base + count * 4;
    if put >= args_base && put < end {
        // The producer never publishes a half-written method, so this
        // stream is malformed; process what is there anyway.
        tracing::error!("put=0x{put:08x} inside method run 0x{args_base:08x}..0x{end:08x}");
    }

    ctx.cursor.begin_method(count);
    let mut i = 0u32;
    while ctx.cursor.remaining > 0 {
        let arg_addr = args_base + i * 4;
        let cur_reg = if non_increment { reg } else { reg + i * 4 };

        let before_put = fifo::words_before_put(ctx.cursor.get, arg_addr, put);
        let batch = if before_put > 0 {
            table.batch_handler(cur_reg, non_increment)
        } else {
            // Unpublished argument: the span must not cross put, so the
            // word falls back to single dispatch (stale read, logged
            // above as a malformed stream)
            None
        };
        if let Some((batch_fn, window_words)) = batch {
            let n = fifo::batch_len(ctx.cursor.remaining, before_put, window_words);
            match ctx.memory.word_span(arg_addr, n) {
                Ok(span) => {
                    let used = batch_fn(ctx, cur_reg, &span);
                    ctx.counters.methods_processed += u64::from(used);
                    ctx.cursor.consume(used);
                    i += used;
                }
                Err(e) => {
                    tracing::error!(
                        "argument read at 0x{arg_addr:08x} failed: {}",
                        GpuError::BadResourceAddress(e)
                    );
                    ctx.cursor.request_recovery();
                }
            }
        } else {
            match ctx.memory.read32(arg_addr) {
                Ok(value) => {
                    table.dispatch(ctx, cur_reg, value);
                    ctx.cursor.consume(1);
                    i += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "argument read at 0x{arg_addr:08x} failed: {}",
                        GpuError::BadResourceAddress(e)
                    );
                    ctx.cursor.request_recovery();
                }
            }
        }

        if ctx.cursor.recovery_requested {
            return;
        }
    }

    ctx.cursor.get = end;
    ctx.cursor.set_restore_point();
}
