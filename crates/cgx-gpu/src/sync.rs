//! Fences, semaphores, and report writes.
//!
//! These are the only methods whose effects are observable from other
//! execution contexts, so ordering is strict: rendering work is flushed
//! before any value is published, and published values use release
//! stores against the acquire loads of whoever is polling them.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use cgx_core::error::GpuError;
use cgx_memory::dma::CELL_GCM_CONTEXT_DMA_SEMAPHORE_RW;

use crate::fifo::FifoState;
use crate::methods::{
    NV406E_SEMAPHORE_OFFSET, NV406E_SET_CONTEXT_DMA_SEMAPHORE, NV4097_SET_CONTEXT_DMA_REPORT,
    NV4097_SET_SEMAPHORE_OFFSET,
};
use crate::thread::Context;

fn sleep_us(us: u64) {
    if us > 0 {
        std::thread::sleep(Duration::from_micros(us));
    }
}

/// Publish the fence register. The handshake other contexts rely on:
/// once the reference value is visible, all work before it has landed.
pub(crate) fn set_reference(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    ctx.backend.flush();
    ctx.control.get.store(ctx.cursor.get, Ordering::Release);
    ctx.control.reference.store(value, Ordering::Release);
}

fn resolve_semaphore(ctx: &mut Context<'_>, selector: u32, offset: u32) -> Option<u32> {
    match ctx.map.resolve(selector, offset) {
        Ok(addr) => Some(addr),
        Err(e) => {
            tracing::error!("{}", GpuError::BadResourceAddress(e));
            ctx.cursor.request_recovery();
            None
        }
    }
}

/// Block until the watched semaphore holds the expected value.
///
/// The wait is a spin with a configurable poll interval; it gives up on
/// stop, and after the driver-recovery timeout it logs and moves on the
/// way the real driver's watchdog would.
pub(crate) fn semaphore_acquire(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    let offset = ctx.regs.get(NV406E_SEMAPHORE_OFFSET);
    if offset % 4 != 0 {
        tracing::error!("{}", GpuError::UnalignedResource { offset, align: 4 });
        ctx.cursor.request_recovery();
        return;
    }
    let selector = ctx.regs.get(NV406E_SET_CONTEXT_DMA_SEMAPHORE);
    let Some(addr) = resolve_semaphore(ctx, selector, offset) else {
        return;
    };

    match ctx.memory.load_acquire(addr) {
        Ok(v) if v == value => {
            // Already satisfied, nothing to flush. The flip label is a
            // hot-wait target; everything else gets a settle delay so a
            // spinning producer is not starved.
            if addr != ctx.map.flip_semaphore_addr() {
                sleep_us(ctx.config.fifo_wake_delay_us);
            }
            return;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!("{}", GpuError::BadResourceAddress(e));
            ctx.cursor.request_recovery();
            return;
        }
    }

    ctx.backend.flush();
    ctx.counters.set_state(FifoState::Spinning);
    let started = Instant::now();
    let timeout = Duration::from_micros(ctx.config.driver_recovery_timeout_us);
    let poll = Duration::from_micros(ctx.config.semaphore_poll_interval_us);
    loop {
        if ctx.stop.load(Ordering::Relaxed) {
            break;
        }
        match ctx.memory.load_acquire(addr) {
            Ok(v) if v == value => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("{}", GpuError::BadResourceAddress(e));
                break;
            }
        }
        if started.elapsed() >= timeout {
            tracing::error!(
                "{}",
                GpuError::Timeout {
                    addr,
                    expected: value,
                    waited_us: started.elapsed().as_micros() as u64,
                }
            );
            ctx.counters.semaphore_timeouts += 1;
            break;
        }
        std::thread::sleep(poll);
    }
    ctx.counters.set_state(FifoState::Running);
}

/// Writing 0 to the flip label would deadlock the presentation
/// handshake; the real driver never does it and hardware coerces it.
fn coerce_flip_value(ctx: &Context<'_>, addr: u32, value: u32) -> u32 {
    if addr == ctx.map.flip_semaphore_addr() && value == 0 {
        tracing::warn!("release of 0 to the flip label, coercing to 1");
        1
    } else {
        value
    }
}

pub(crate) fn semaphore_release(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    let offset = ctx.regs.get(NV406E_SEMAPHORE_OFFSET);
    if offset % 4 != 0 {
        tracing::error!("{}", GpuError::UnalignedResource { offset, align: 4 });
        ctx.cursor.request_recovery();
        return;
    }
    let selector = ctx.regs.get(NV406E_SET_CONTEXT_DMA_SEMAPHORE);
    let Some(addr) = resolve_semaphore(ctx, selector, offset) else {
        return;
    };
    ctx.backend.flush();
    let value = coerce_flip_value(ctx, addr, value);
    if let Err(e) = ctx.memory.store_release(addr, value) {
        tracing::error!("{}", GpuError::BadResourceAddress(e));
    }
}

/// Full semaphore releases land on 16-byte records; anything else is a
/// corrupt offset register.
fn semaphore_release_addr_4097(ctx: &mut Context<'_>) -> Option<u32> {
    let offset = ctx.regs.get(NV4097_SET_SEMAPHORE_OFFSET);
    if offset % 16 != 0 {
        tracing::error!("{}", GpuError::UnalignedResource { offset, align: 16 });
        ctx.cursor.request_recovery();
        return None;
    }
    resolve_semaphore(ctx, CELL_GCM_CONTEXT_DMA_SEMAPHORE_RW, offset)
}

/// Release ordered behind all rendering. The value crosses the bus
/// through the raster unit, which swaps the outer byte lanes.
pub(crate) fn back_end_write_semaphore_release(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    let Some(addr) = semaphore_release_addr_4097(ctx) else {
        return;
    };
    ctx.backend.flush();
    let swapped = (value & 0xFF00_FF00) | ((value & 0xFF) << 16) | ((value >> 16) & 0xFF);
    let swapped = coerce_flip_value(ctx, addr, swapped);
    if let Err(e) = ctx.memory.store_release(addr, swapped) {
        tracing::error!("{}", GpuError::BadResourceAddress(e));
    }
}

/// Release ordered behind texture reads only; the value passes through
/// unmodified and no flush is required.
pub(crate) fn texture_read_semaphore_release(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    let Some(addr) = semaphore_release_addr_4097(ctx) else {
        return;
    };
    let value = coerce_flip_value(ctx, addr, value);
    if let Err(e) = ctx.memory.store_release(addr, value) {
        tracing::error!("{}", GpuError::BadResourceAddress(e));
    }
}

/// Write a 16-byte report record: 8-byte timestamp (high word first),
/// 4-byte value, 4 bytes of padding. A failed write is logged and
/// skipped; reports are advisory.
pub(crate) fn get_report(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    let report_type = value >> 24;
    let offset = value & 0x00FF_FFFF;
    let selector = ctx.regs.get(NV4097_SET_CONTEXT_DMA_REPORT);
    let addr = match ctx.map.resolve(selector, offset) {
        Ok(addr) => addr,
        Err(e) => {
            tracing::warn!("report skipped: {}", GpuError::BadResourceAddress(e));
            return;
        }
    };
    let timestamp = ctx.counters.timestamp_us();
    let result = ctx
        .memory
        .write64(addr, timestamp)
        .and_then(|_| ctx.memory.write32(addr + 8, 0))
        .and_then(|_| ctx.memory.write32(addr + 12, 0));
    if let Err(e) = result {
        tracing::warn!(
            "report type {report_type} write failed: {}",
            GpuError::BadResourceAddress(e)
        );
    }
}
