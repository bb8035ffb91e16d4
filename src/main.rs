//! cellgx - software RSX command processor
//!
//! Headless demo driver: builds a small command stream in guest memory,
//! runs it through the processor, and reports what happened.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context as _;

use cgx_core::config::Config;
use cgx_gpu::fifo::{self, CommandControl};
use cgx_gpu::methods::*;
use cgx_gpu::thread::CommandProcessor;
use cgx_memory::dma::CELL_GCM_CONTEXT_DMA_SEMAPHORE_RW;
use cgx_memory::{GuestMemory, MemoryMap};

const STREAM_START: u32 = 0x1000;

struct StreamWriter<'a> {
    memory: &'a GuestMemory,
    addr: u32,
}

impl StreamWriter<'_> {
    fn word(&mut self, word: u32) -> anyhow::Result<()> {
        self.memory
            .write32(self.addr, word)
            .context("command stream overflows guest memory")?;
        self.addr += 4;
        Ok(())
    }

    fn method(&mut self, reg: u32, args: &[u32]) -> anyhow::Result<()> {
        self.word(fifo::encode_method(reg, args.len() as u32))?;
        for &arg in args {
            self.word(arg)?;
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::load(Path::new("cellgx.toml"))
        .map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;
    tracing::info!("Starting cellgx command processor");

    let memory = Arc::new(GuestMemory::new(config.memory.size_kib * 1024));
    let map = Arc::new(MemoryMap::new(
        config.memory.local_base,
        config.memory.label_base,
    ));
    let control = Arc::new(CommandControl::new());
    control.get.store(STREAM_START, Ordering::Release);
    control.put.store(STREAM_START, Ordering::Release);

    let mut processor = CommandProcessor::new(
        memory.clone(),
        map.clone(),
        control.clone(),
        config.processor.clone(),
    );

    // A representative frame fragment: surface setup, a constant
    // upload, one triangle draw, and a fence the producer can wait on.
    let mut w = StreamWriter {
        memory: &memory,
        addr: STREAM_START,
    };
    w.method(NV4097_SET_SURFACE_COLOR_TARGET, &[0x1])?;
    w.method(NV4097_SET_DEPTH_TEST_ENABLE, &[1])?;
    w.method(NV4097_SET_DEPTH_FUNC, &[0x203])?;
    w.method(NV4097_CLEAR_SURFACE, &[0xF3])?;
    w.method(NV4097_SET_TRANSFORM_CONSTANT_LOAD, &[0])?;
    let identity_row = [1.0f32, 0.0, 0.0, 0.0].map(f32::to_bits);
    w.method(NV4097_SET_TRANSFORM_CONSTANT, &identity_row)?;
    w.method(NV4097_SET_BEGIN_END, &[5])?;
    w.method(NV4097_DRAW_ARRAYS, &[2 << 24])?;
    w.method(NV4097_SET_BEGIN_END, &[0])?;
    w.method(
        NV406E_SET_CONTEXT_DMA_SEMAPHORE,
        &[CELL_GCM_CONTEXT_DMA_SEMAPHORE_RW],
    )?;
    w.method(NV406E_SET_REFERENCE, &[0xBEEF])?;
    control.put.store(w.addr, Ordering::Release);

    processor.process();

    let counters = processor.counters();
    tracing::info!(
        "processed {} methods, {} draw calls, {} recoveries, state {:?}",
        counters.methods_processed,
        counters.draw_calls,
        counters.recoveries,
        counters.state,
    );
    tracing::info!(
        "fence reference now 0x{:08x}, get=0x{:08x}",
        control.reference.load(Ordering::Acquire),
        control.get.load(Ordering::Acquire),
    );

    Ok(())
}
