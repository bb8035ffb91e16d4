//! End-to-end command stream tests: encoded FIFO words in guest memory,
//! processed against a backend that records every notification.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use cgx_core::config::ProcessorConfig;
use cgx_gpu::backend::RenderBackend;
use cgx_gpu::clause::{DrawClause, DrawCommand, Primitive};
use cgx_gpu::fifo::{self, CommandControl};
use cgx_gpu::methods::*;
use cgx_gpu::regs::RegisterFile;
use cgx_gpu::thread::CommandProcessor;
use cgx_memory::dma::{
    CELL_GCM_CONTEXT_DMA_REPORT_LOCATION_LOCAL, CELL_GCM_CONTEXT_DMA_SEMAPHORE_RW,
    REPORT_LOCAL_OFFSET,
};
use cgx_memory::{GuestMemory, MemoryMap};

const LABEL_BASE: u32 = 0x8000;
const STREAM_START: u32 = 0x100;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Begin,
    End {
        primitive: Option<Primitive>,
        command: DrawCommand,
        ranges: Vec<(u32, u32)>,
        inline_words: usize,
        /// Vertex base offset latch as the renderer sees it at draw end
        base_offset: u32,
    },
    Clear(u32),
    Patch(u32, u32),
    Texture(u32),
    VertexTexture(u32),
    Instanced(bool),
    Flush,
}

#[derive(Clone)]
struct RecordingBackend {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingBackend {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl RenderBackend for RecordingBackend {
    fn begin(&mut self) {
        self.push(Event::Begin);
    }

    fn end(&mut self, draw: &DrawClause, regs: &RegisterFile) {
        self.push(Event::End {
            primitive: draw.primitive,
            command: draw.command,
            ranges: draw.ranges.clone(),
            inline_words: draw.inline_vertex_words.len(),
            base_offset: regs.get(NV4097_SET_VERTEX_DATA_BASE_OFFSET),
        });
    }

    fn clear_surface(&mut self, mask: u32) {
        self.push(Event::Clear(mask));
    }

    fn patch_transform_constants(&mut self, load_slot: u32, count: u32) {
        self.push(Event::Patch(load_slot, count));
    }

    fn on_texture_dirty(&mut self, unit: u32) {
        self.push(Event::Texture(unit));
    }

    fn on_vertex_texture_dirty(&mut self, unit: u32) {
        self.push(Event::VertexTexture(unit));
    }

    fn set_instanced(&mut self, instanced: bool) {
        self.push(Event::Instanced(instanced));
    }

    fn flush(&mut self) {
        self.push(Event::Flush);
    }
}

struct Harness {
    memory: Arc<GuestMemory>,
    control: Arc<CommandControl>,
    processor: CommandProcessor,
    events: Arc<Mutex<Vec<Event>>>,
    wptr: u32,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ProcessorConfig {
            fifo_wake_delay_us: 0,
            ..ProcessorConfig::default()
        })
    }

    fn with_config(config: ProcessorConfig) -> Self {
        let memory = Arc::new(GuestMemory::new(0x1_0000));
        let map = Arc::new(MemoryMap::new(0, LABEL_BASE));
        let control = Arc::new(CommandControl::new());
        control.get.store(STREAM_START, Ordering::Release);
        control.put.store(STREAM_START, Ordering::Release);
        let backend = RecordingBackend::new();
        let events = backend.events.clone();
        let processor = CommandProcessor::with_backend(
            memory.clone(),
            map,
            control.clone(),
            config,
            Box::new(backend),
        );
        Self {
            memory,
            control,
            processor,
            events,
            wptr: STREAM_START,
        }
    }

    fn push_word(&mut self, word: u32) {
        self.memory.write32(self.wptr, word).unwrap();
        self.wptr += 4;
    }

    fn push_method(&mut self, reg: u32, args: &[u32]) {
        self.push_word(fifo::encode_method(reg, args.len() as u32));
        for &arg in args {
            self.push_word(arg);
        }
    }

    fn push_method_non_increment(&mut self, reg: u32, args: &[u32]) {
        self.push_word(fifo::encode_method_non_increment(reg, args.len() as u32));
        for &arg in args {
            self.push_word(arg);
        }
    }

    fn run(&mut self) {
        self.control.put.store(self.wptr, Ordering::Release);
        self.processor.process();
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

fn draw_arrays_arg(first: u32, count: u32) -> u32 {
    ((count - 1) << 24) | first
}

#[test]
fn triangle_stream_produces_one_paired_draw() {
    let mut h = Harness::new();
    h.push_method(NV4097_SET_BEGIN_END, &[5]);
    h.push_method(NV4097_DRAW_ARRAYS, &[draw_arrays_arg(0, 3)]);
    h.push_method(NV4097_SET_BEGIN_END, &[0]);
    h.run();

    assert_eq!(
        h.events(),
        vec![
            Event::Begin,
            Event::End {
                primitive: Some(Primitive::Triangles),
                command: DrawCommand::Array,
                ranges: vec![(0, 3)],
                inline_words: 0,
                base_offset: 0,
            },
        ]
    );
    assert_eq!(h.processor.counters().draw_calls, 1);
}

#[test]
fn empty_clause_reaches_backend_begin_but_not_end() {
    let mut h = Harness::new();
    h.push_method(NV4097_SET_BEGIN_END, &[5]);
    h.push_method(NV4097_SET_BEGIN_END, &[0]);
    h.run();

    assert_eq!(h.events(), vec![Event::Begin]);
    assert_eq!(h.processor.counters().draw_calls, 0);
}

#[test]
fn consecutive_ranges_merge() {
    let mut h = Harness::new();
    h.push_method(NV4097_SET_BEGIN_END, &[6]);
    h.push_method(NV4097_DRAW_ARRAYS, &[draw_arrays_arg(0, 4), draw_arrays_arg(4, 4)]);
    h.push_method(NV4097_SET_BEGIN_END, &[0]);
    h.run();

    match &h.events()[1] {
        Event::End { ranges, .. } => assert_eq!(ranges, &vec![(0, 8)]),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn base_offset_write_is_deferred_past_active_draw() {
    let mut h = Harness::new();
    h.push_method(NV4097_SET_BEGIN_END, &[5]);
    h.push_method(NV4097_SET_VERTEX_DATA_BASE_OFFSET, &[100]);
    h.push_method(NV4097_DRAW_ARRAYS, &[draw_arrays_arg(0, 3)]);
    h.run();
    // Still inside the draw: the latch must not have moved
    assert_eq!(h.processor.regs().get(NV4097_SET_VERTEX_DATA_BASE_OFFSET), 0);

    h.push_method(NV4097_SET_BEGIN_END, &[0]);
    h.run();
    assert_eq!(
        h.processor.regs().get(NV4097_SET_VERTEX_DATA_BASE_OFFSET),
        100
    );
    assert_eq!(h.processor.counters().draw_calls, 1);

    // The deferred write landed before the end hook ran: the renderer
    // already sees the new base offset, while the compiled geometry
    // predates it
    match &h.events()[1] {
        Event::End {
            ranges, base_offset, ..
        } => {
            assert_eq!(ranges, &vec![(0, 3)]);
            assert_eq!(*base_offset, 100);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn deferred_writes_apply_in_submission_order() {
    let mut h = Harness::new();
    h.push_method(NV4097_SET_BEGIN_END, &[5]);
    h.push_method(NV4097_SET_VERTEX_DATA_BASE_INDEX, &[7]);
    h.push_method(NV4097_SET_VERTEX_DATA_BASE_INDEX, &[9]);
    h.push_method(NV4097_DRAW_ARRAYS, &[draw_arrays_arg(0, 3)]);
    h.push_method(NV4097_SET_BEGIN_END, &[0]);
    h.run();

    // Last submission wins after replay
    assert_eq!(h.processor.regs().get(NV4097_SET_VERTEX_DATA_BASE_INDEX), 9);
}

#[test]
fn deferred_writes_land_even_when_the_draw_is_empty() {
    let mut h = Harness::new();
    h.push_method(NV4097_SET_BEGIN_END, &[5]);
    h.push_method(NV4097_SET_VERTEX_DATA_BASE_OFFSET, &[64]);
    h.push_method(NV4097_SET_BEGIN_END, &[0]);
    h.run();

    assert_eq!(h.processor.regs().get(NV4097_SET_VERTEX_DATA_BASE_OFFSET), 64);
    assert_eq!(h.processor.counters().draw_calls, 0);
}

#[test]
fn batched_constant_upload_matches_single_writes() {
    let mut batched = Harness::new();
    let values: Vec<u32> = (0..8).map(|i| 0x3F80_0000 + i).collect();
    batched.push_method(NV4097_SET_TRANSFORM_CONSTANT_LOAD, &[10]);
    batched.push_method(NV4097_SET_TRANSFORM_CONSTANT, &values);
    batched.run();

    let mut single = Harness::new();
    single.processor.execute(NV4097_SET_TRANSFORM_CONSTANT_LOAD, 10);
    for (i, &v) in values.iter().enumerate() {
        single
            .processor
            .execute(NV4097_SET_TRANSFORM_CONSTANT + i as u32 * 4, v);
    }

    let base = 10 * 4;
    for i in 0..8 {
        assert_eq!(
            batched.processor.regs().transform_constants[base + i],
            single.processor.regs().transform_constants[base + i],
        );
        assert_eq!(
            batched.processor.regs().transform_constants[base + i],
            0x3F80_0000 + i as u32
        );
    }
    // The register latches themselves must match too, word for word
    for i in 0..8u32 {
        let reg = NV4097_SET_TRANSFORM_CONSTANT + i * 4;
        assert_eq!(
            batched.processor.regs().get(reg),
            single.processor.regs().get(reg),
        );
        assert_eq!(batched.processor.regs().get(reg), 0x3F80_0000 + i);
    }
    assert_eq!(
        batched.processor.regs().dirty,
        single.processor.regs().dirty
    );
}

#[test]
fn constant_upload_truncates_at_bank_end() {
    let mut h = Harness::new();
    h.push_method(NV4097_SET_TRANSFORM_CONSTANT_LOAD, &[467]);
    let values: Vec<u32> = (1..=8).collect();
    h.push_method(NV4097_SET_TRANSFORM_CONSTANT, &values);
    h.run();

    // The last slot takes four words; the rest are dropped
    let regs = h.processor.regs();
    assert_eq!(&regs.transform_constants[467 * 4..], &[1, 2, 3, 4]);
}

#[test]
fn mid_draw_constant_write_patches_immediately() {
    let mut h = Harness::new();
    h.push_method(NV4097_SET_TRANSFORM_CONSTANT_LOAD, &[3]);
    h.push_method(NV4097_SET_BEGIN_END, &[5]);
    h.push_method(NV4097_SET_TRANSFORM_CONSTANT, &[0x11, 0x22, 0x33, 0x44]);
    h.push_method(NV4097_DRAW_ARRAYS, &[draw_arrays_arg(0, 3)]);
    h.push_method(NV4097_SET_BEGIN_END, &[0]);
    h.run();

    assert!(h.events().contains(&Event::Patch(3, 1)));
    assert_eq!(&h.processor.regs().transform_constants[12..16], &[
        0x11, 0x22, 0x33, 0x44
    ]);
}

#[test]
fn mid_draw_batch_patch_skips_untouched_slots() {
    let mut h = Harness::new();
    h.push_method(NV4097_SET_TRANSFORM_CONSTANT_LOAD, &[8]);
    h.push_method(NV4097_SET_BEGIN_END, &[5]);
    // Slots 8 and 10 change; slot 9 keeps its initial contents
    h.push_method(
        NV4097_SET_TRANSFORM_CONSTANT,
        &[1, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0],
    );
    h.push_method(NV4097_SET_BEGIN_END, &[0]);
    h.run();

    let patches: Vec<Event> = h
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Patch(..)))
        .collect();
    assert_eq!(patches, vec![Event::Patch(8, 1), Event::Patch(10, 1)]);
}

#[test]
fn inline_array_batches_under_non_increment_header() {
    let mut h = Harness::new();
    let words: Vec<u32> = (0..12).collect();
    h.push_method(NV4097_SET_BEGIN_END, &[5]);
    h.push_method_non_increment(NV4097_INLINE_ARRAY, &words);
    h.push_method(NV4097_SET_BEGIN_END, &[0]);
    h.run();

    match &h.events()[1] {
        Event::End {
            command,
            inline_words,
            ..
        } => {
            assert_eq!(*command, DrawCommand::InlinedArray);
            assert_eq!(*inline_words, 12);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn immediate_mode_vertices_synthesize_a_draw() {
    let mut h = Harness::new();
    h.push_method(NV4097_SET_BEGIN_END, &[1]);
    // Two full vertices on attribute 0 (x, y, z, w each)
    h.push_method(NV4097_SET_VERTEX_DATA4F_M, &[1, 2, 3, 4]);
    h.push_method(NV4097_SET_VERTEX_DATA4F_M, &[5, 6, 7, 8]);
    h.push_method(NV4097_SET_BEGIN_END, &[0]);
    h.run();

    match &h.events()[1] {
        Event::End {
            command, ranges, ..
        } => {
            assert_eq!(*command, DrawCommand::Array);
            assert_eq!(ranges, &vec![(0, 2)]);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn texture_write_notifies_once_per_change() {
    let mut h = Harness::new();
    let unit3_offset = NV4097_SET_TEXTURE_OFFSET + 3 * TEXTURE_UNIT_STRIDE;
    h.processor.execute(unit3_offset, 0x1000);
    h.processor.execute(unit3_offset, 0x1000);
    h.processor.execute(unit3_offset, 0x2000);

    assert_eq!(h.events(), vec![Event::Texture(3), Event::Texture(3)]);
    assert!(h.processor.regs().fragment_textures_dirty[3]);
}

#[test]
fn clear_with_empty_mask_is_skipped() {
    let mut h = Harness::new();
    h.push_method(NV4097_CLEAR_SURFACE, &[0x0C]);
    h.push_method(NV4097_CLEAR_SURFACE, &[0xF3]);
    h.run();

    assert_eq!(h.events(), vec![Event::Clear(0xF3)]);
}

#[test]
fn satisfied_acquire_returns_without_flush() {
    let mut h = Harness::new();
    h.memory.write32(LABEL_BASE + 0x20, 7).unwrap();
    h.processor
        .execute(NV406E_SET_CONTEXT_DMA_SEMAPHORE, CELL_GCM_CONTEXT_DMA_SEMAPHORE_RW);
    h.processor.execute(NV406E_SEMAPHORE_OFFSET, 0x20);
    h.processor.execute(NV406E_SEMAPHORE_ACQUIRE, 7);

    assert!(!h.events().contains(&Event::Flush));
    assert_eq!(h.processor.counters().semaphore_timeouts, 0);
}

#[test]
fn unsatisfied_acquire_flushes_then_times_out() {
    let mut h = Harness::with_config(ProcessorConfig {
        semaphore_poll_interval_us: 10,
        driver_recovery_timeout_us: 1_000,
        fifo_wake_delay_us: 0,
    });
    h.processor
        .execute(NV406E_SET_CONTEXT_DMA_SEMAPHORE, CELL_GCM_CONTEXT_DMA_SEMAPHORE_RW);
    h.processor.execute(NV406E_SEMAPHORE_OFFSET, 0x20);
    h.processor.execute(NV406E_SEMAPHORE_ACQUIRE, 7);

    assert!(h.events().contains(&Event::Flush));
    assert_eq!(h.processor.counters().semaphore_timeouts, 1);
}

#[test]
fn stop_flag_cancels_semaphore_wait() {
    let mut h = Harness::new();
    h.processor.stop_handle().store(true, Ordering::Release);
    h.processor
        .execute(NV406E_SET_CONTEXT_DMA_SEMAPHORE, CELL_GCM_CONTEXT_DMA_SEMAPHORE_RW);
    h.processor.execute(NV406E_SEMAPHORE_OFFSET, 0x20);
    // Never satisfied; the default one-second timeout would blow the
    // budget here if the wait were not cancelled
    h.processor.execute(NV406E_SEMAPHORE_ACQUIRE, 7);

    assert_eq!(h.processor.counters().semaphore_timeouts, 0);
    assert!(h.events().contains(&Event::Flush));
}

#[test]
fn back_end_release_swaps_outer_byte_lanes() {
    let mut h = Harness::new();
    h.processor.execute(NV4097_SET_SEMAPHORE_OFFSET, 0x40);
    h.processor
        .execute(NV4097_BACK_END_WRITE_SEMAPHORE_RELEASE, 0x1122_3344);

    assert_eq!(h.memory.read32(LABEL_BASE + 0x40).unwrap(), 0x1144_3322);
    assert!(h.events().contains(&Event::Flush));
}

#[test]
fn texture_read_release_writes_unmodified_without_flush() {
    let mut h = Harness::new();
    h.processor.execute(NV4097_SET_SEMAPHORE_OFFSET, 0x40);
    h.processor
        .execute(NV4097_TEXTURE_READ_SEMAPHORE_RELEASE, 0x1122_3344);

    assert_eq!(h.memory.read32(LABEL_BASE + 0x40).unwrap(), 0x1122_3344);
    assert!(!h.events().contains(&Event::Flush));
}

#[test]
fn zero_release_to_flip_label_is_coerced_to_one() {
    let mut h = Harness::new();
    // Flip label sits at label base + 0x10
    h.processor.execute(NV4097_SET_SEMAPHORE_OFFSET, 0x10);
    h.processor
        .execute(NV4097_BACK_END_WRITE_SEMAPHORE_RELEASE, 0);

    assert_eq!(h.memory.read32(LABEL_BASE + 0x10).unwrap(), 1);
}

#[test]
fn misaligned_full_release_offset_requests_recovery() {
    let mut h = Harness::new();
    h.memory.write32(LABEL_BASE + 0x44, 0xAAAA).unwrap();
    h.processor.execute(NV4097_SET_SEMAPHORE_OFFSET, 0x44);
    h.processor
        .execute(NV4097_BACK_END_WRITE_SEMAPHORE_RELEASE, 0x1234);

    assert_eq!(h.memory.read32(LABEL_BASE + 0x44).unwrap(), 0xAAAA);
    assert_eq!(h.processor.counters().recoveries, 1);
}

#[test]
fn report_record_layout() {
    let mut h = Harness::new();
    let addr = LABEL_BASE + REPORT_LOCAL_OFFSET + 0x10;
    for i in 0..4 {
        h.memory.write32(addr + i * 4, 0xDEAD_BEEF).unwrap();
    }
    h.processor.execute(
        NV4097_SET_CONTEXT_DMA_REPORT,
        CELL_GCM_CONTEXT_DMA_REPORT_LOCATION_LOCAL,
    );
    h.processor.execute(NV4097_GET_REPORT, (1 << 24) | 0x10);

    // Timestamp halves were written (high word first), value and
    // padding are zeroed
    assert_ne!(h.memory.read32(addr).unwrap(), 0xDEAD_BEEF);
    assert_ne!(h.memory.read32(addr + 4).unwrap(), 0xDEAD_BEEF);
    assert_eq!(h.memory.read32(addr + 8).unwrap(), 0);
    assert_eq!(h.memory.read32(addr + 12).unwrap(), 0);
}

#[test]
fn fence_publishes_after_flushing() {
    let mut h = Harness::new();
    h.push_method(NV406E_SET_REFERENCE, &[0x1234]);
    h.run();

    assert_eq!(h.control.reference.load(Ordering::Acquire), 0x1234);
    assert!(h.events().contains(&Event::Flush));
}

#[test]
fn corrupt_index_dma_recovers_then_discards() {
    let mut h = Harness::new();
    // Location 0xF is not a resolvable DMA selector
    h.push_method(NV4097_SET_INDEX_ARRAY_DMA, &[0xF]);
    h.run();

    // First recovery rewinds to the restore point, which replays the
    // same corrupt word; the second gives up and discards to put
    assert_eq!(h.processor.counters().recoveries, 2);
    assert_eq!(
        h.control.get.load(Ordering::Acquire),
        h.control.put.load(Ordering::Acquire)
    );
}

#[test]
fn call_and_return_resume_after_the_call_site() {
    let mut h = Harness::new();
    let sub = 0x400;
    h.memory
        .write32(sub, fifo::encode_method(NV4097_SET_DEPTH_FUNC, 1))
        .unwrap();
    h.memory.write32(sub + 4, 0x207).unwrap();
    h.memory.write32(sub + 8, 0x0002_0000).unwrap();

    h.push_word(sub | 2);
    h.push_method(NV4097_SET_CULL_FACE, &[0x405]);
    h.run();

    assert_eq!(h.processor.regs().get(NV4097_SET_DEPTH_FUNC), 0x207);
    assert_eq!(h.processor.regs().get(NV4097_SET_CULL_FACE), 0x405);
}

#[test]
fn single_step_pauses_after_one_draw() {
    let mut h = Harness::new();
    h.push_method(NV4097_SET_BEGIN_END, &[5]);
    h.push_method(NV4097_DRAW_ARRAYS, &[draw_arrays_arg(0, 3)]);
    h.push_method(NV4097_SET_BEGIN_END, &[0]);
    h.push_method(NV4097_SET_BEGIN_END, &[5]);
    h.push_method(NV4097_DRAW_ARRAYS, &[draw_arrays_arg(0, 3)]);
    h.push_method(NV4097_SET_BEGIN_END, &[0]);

    h.processor.request_single_step();
    h.run();
    assert!(h.processor.is_paused());
    assert_eq!(h.processor.counters().draw_calls, 1);

    h.processor.resume();
    h.run();
    assert_eq!(h.processor.counters().draw_calls, 2);
}

#[test]
fn instancing_change_is_reported_at_draw_end() {
    let mut h = Harness::new();
    h.push_method(NV4097_SET_FREQUENCY_DIVIDER_OPERATION, &[1]);
    h.push_method(NV4097_SET_BEGIN_END, &[5]);
    h.push_method(NV4097_DRAW_ARRAYS, &[draw_arrays_arg(0, 3)]);
    h.push_method(NV4097_SET_BEGIN_END, &[0]);
    h.run();

    let events = h.events();
    let instanced_pos = events
        .iter()
        .position(|e| *e == Event::Instanced(true))
        .expect("instancing notification missing");
    let end_pos = events
        .iter()
        .position(|e| matches!(e, Event::End { .. }))
        .unwrap();
    assert!(instanced_pos < end_pos);
}
