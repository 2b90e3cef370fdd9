//! Per-thread stack watermark barriers.
//!
//! A watermark barrier lets a concurrent GC concern (remapping stale
//! references, sampling) fix up a thread's frames lazily instead of walking
//! the whole stack in a pause. Each barrier has a kind, a generation counter
//! bumped by every iteration, and a watermark: frames the barrier has not
//! processed in the current generation must not be trusted.
//!
//! Stacks grow downwards. While a barrier iterates, every frame with a stack
//! pointer below its watermark has been processed. Frames are therefore
//! processed youngest first: reaching a frame processes the younger frames
//! it skipped before it.
//!
//! A [`StackWatermarkSet`] keeps a thread's barriers newest first, and every
//! operation visits them in that order.

use crate::mutator::MutatorThread;
use gc_types::Address;
use log::trace;
use std::fmt;

/// Concern a watermark barrier serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatermarkKind {
    /// Collector fixups such as reference remapping
    Gc,
    /// Stack sampling
    Sampler,
}

impl WatermarkKind {
    /// Number of kinds.
    pub const COUNT: usize = 2;

    fn index(self) -> usize {
        match self {
            WatermarkKind::Gc => 0,
            WatermarkKind::Sampler => 1,
        }
    }
}

impl fmt::Display for WatermarkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatermarkKind::Gc => write!(f, "gc"),
            WatermarkKind::Sampler => write!(f, "sampler"),
        }
    }
}

/// An activation record of a mutator thread.
#[derive(Debug, Clone)]
pub struct Frame {
    sp: usize,
    slots: Vec<Address>,
    /// Barrier generation that last processed this frame, per kind
    last_seen: [u32; WatermarkKind::COUNT],
}

impl Frame {
    /// Creates a frame at stack pointer `sp` holding reference `slots`.
    pub fn new(sp: usize, slots: Vec<Address>) -> Self {
        Frame {
            sp,
            slots,
            last_seen: [0; WatermarkKind::COUNT],
        }
    }

    /// Stack pointer of the frame.
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Reference slots of the frame.
    pub fn slots(&self) -> &[Address] {
        &self.slots
    }

    /// Mutable reference slots of the frame.
    pub fn slots_mut(&mut self) -> &mut [Address] {
        &mut self.slots
    }

    /// Generation of the last `kind` barrier that processed this frame.
    pub fn last_seen(&self, kind: WatermarkKind) -> u32 {
        self.last_seen[kind.index()]
    }
}

/// Fixup a barrier applies to each frame it processes.
pub trait WatermarkFixup: Send {
    /// Processes one frame.
    fn process(&mut self, frame: &mut Frame);
}

impl<F> WatermarkFixup for F
where
    F: FnMut(&mut Frame) + Send,
{
    fn process(&mut self, frame: &mut Frame) {
        self(frame)
    }
}

/// One barrier registered on a thread.
pub struct StackWatermark {
    kind: WatermarkKind,
    generation: u32,
    iterating: bool,
    watermark: usize,
    processed: usize,
    fixup: Box<dyn WatermarkFixup>,
}

impl StackWatermark {
    /// Creates an idle barrier of `kind`.
    pub fn new(kind: WatermarkKind, fixup: impl WatermarkFixup + 'static) -> Self {
        StackWatermark {
            kind,
            generation: 0,
            iterating: false,
            watermark: 0,
            processed: 0,
            fixup: Box::new(fixup),
        }
    }

    /// Kind of the barrier.
    pub fn kind(&self) -> WatermarkKind {
        self.kind
    }

    /// Number of iterations started so far.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// True between `start_iteration` and `finish_iteration`.
    pub fn is_iterating(&self) -> bool {
        self.iterating
    }

    /// Current watermark, 0 when the barrier is not iterating.
    pub fn watermark(&self) -> usize {
        self.watermark
    }

    /// Frames processed over the barrier's lifetime.
    pub fn processed_frames(&self) -> usize {
        self.processed
    }

    /// True if `frame` was processed in the current generation.
    pub fn is_processed(&self, frame: &Frame) -> bool {
        frame.last_seen(self.kind) == self.generation
    }

    fn start_iteration(&mut self) {
        self.generation += 1;
        self.iterating = true;
        // Nothing below stack pointer 1 exists, so no frame is processed yet
        self.watermark = 1;
        trace!("{} watermark: start iteration {}", self.kind, self.generation);
    }

    /// Applies the fixup unless the frame was already processed in this
    /// generation. Returns true if the fixup ran.
    ///
    /// Every frame younger than `frame` must already be processed.
    fn process_frame(&mut self, frame: &mut Frame) -> bool {
        if !self.iterating || self.is_processed(frame) {
            return false;
        }
        self.fixup.process(frame);
        frame.last_seen[self.kind.index()] = self.generation;
        self.processed += 1;
        self.watermark = self.watermark.max(frame.sp + 1);
        true
    }

    /// Processes `frames[index]` and every younger frame, youngest first.
    fn process_up_to(&mut self, frames: &mut [Frame], index: usize) {
        if !self.iterating {
            return;
        }
        for frame in frames[index..].iter_mut().rev() {
            self.process_frame(frame);
        }
    }

    /// Marks a frame created during the iteration as processed.
    fn adopt_frame(&self, frame: &mut Frame) {
        if self.iterating {
            frame.last_seen[self.kind.index()] = self.generation;
        }
    }

    fn finish_iteration(
        &mut self,
        frames: &mut [Frame],
        mut context: Option<&mut (dyn FnMut(&mut Frame) + '_)>,
    ) {
        for frame in frames.iter_mut().rev() {
            if self.process_frame(frame) {
                if let Some(context) = context.as_deref_mut() {
                    context(frame);
                }
            }
        }
        self.iterating = false;
        self.watermark = 0;
        trace!("{} watermark: finish iteration {}", self.kind, self.generation);
    }
}

impl fmt::Debug for StackWatermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackWatermark")
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .field("iterating", &self.iterating)
            .field("watermark", &self.watermark)
            .finish()
    }
}

/// The barriers of one thread, newest first.
#[derive(Default, Debug)]
pub struct StackWatermarkSet {
    watermarks: Vec<StackWatermark>,
}

impl StackWatermarkSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a barrier ahead of every existing one.
    ///
    /// # Panics
    ///
    /// Panics if a barrier of the same kind is already registered.
    pub fn add_watermark(&mut self, watermark: StackWatermark) {
        assert!(
            self.get(watermark.kind()).is_none(),
            "{} watermark registered twice",
            watermark.kind()
        );
        self.watermarks.insert(0, watermark);
    }

    /// The barrier of `kind`.
    pub fn get(&self, kind: WatermarkKind) -> Option<&StackWatermark> {
        self.watermarks.iter().find(|w| w.kind == kind)
    }

    /// Barriers in processing order.
    pub fn iter(&self) -> impl Iterator<Item = &StackWatermark> {
        self.watermarks.iter()
    }

    /// Number of registered barriers.
    pub fn len(&self) -> usize {
        self.watermarks.len()
    }

    /// True if no barrier is registered.
    pub fn is_empty(&self) -> bool {
        self.watermarks.is_empty()
    }

    /// Starts a new generation for the barriers of `kind`.
    pub fn start_iteration(&mut self, kind: WatermarkKind) {
        self.watermarks
            .iter_mut()
            .filter(|w| w.kind == kind)
            .for_each(StackWatermark::start_iteration);
    }

    /// Gives every iterating barrier the chance to process `frames[index]`
    /// of a stack ordered youngest last.
    ///
    /// Younger frames a barrier has not processed yet are processed first,
    /// so its watermark never rises above an unprocessed frame.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn on_iteration(&mut self, frames: &mut [Frame], index: usize) {
        assert!(index < frames.len(), "frame {} of {}", index, frames.len());
        for watermark in &mut self.watermarks {
            watermark.process_up_to(frames, index);
        }
    }

    /// Marks a newly pushed frame as processed for every iterating barrier.
    pub fn on_new_frame(&self, frame: &mut Frame) {
        for watermark in &self.watermarks {
            watermark.adopt_frame(frame);
        }
    }

    /// Processes the remaining `frames` (youngest last) for the barriers of
    /// `kind` and ends their iteration.
    ///
    /// `context` is called for every frame processed here.
    pub fn finish_iteration(
        &mut self,
        kind: WatermarkKind,
        frames: &mut [Frame],
        mut context: Option<&mut (dyn FnMut(&mut Frame) + '_)>,
    ) {
        for watermark in self.watermarks.iter_mut().filter(|w| w.kind == kind) {
            watermark.finish_iteration(frames, context.as_deref_mut());
        }
    }

    /// Lowest watermark of the iterating barriers, 0 if none iterates.
    pub fn lowest_watermark(&self) -> usize {
        self.watermarks
            .iter()
            .filter(|w| w.iterating)
            .map(|w| w.watermark)
            .min()
            .unwrap_or(0)
    }

    /// Processes the frame a thread is about to unwind, and its caller.
    ///
    /// Threads without frames are skipped. The thread's poll value is
    /// refreshed afterwards.
    pub fn before_unwind(thread: &mut MutatorThread) {
        if !thread.has_last_frame() {
            return;
        }
        let (frames, watermarks) = thread.frames_and_watermarks();
        let caller = frames.len().saturating_sub(2);
        watermarks.on_iteration(frames, caller);
        thread.update_poll_values();
    }

    /// Processes the frame a thread returned into.
    ///
    /// Threads without frames are skipped. The thread's poll value is
    /// refreshed afterwards.
    pub fn after_unwind(thread: &mut MutatorThread) {
        if !thread.has_last_frame() {
            return;
        }
        let (frames, watermarks) = thread.frames_and_watermarks();
        let youngest = frames.len() - 1;
        watermarks.on_iteration(frames, youngest);
        thread.update_poll_values();
    }
}
