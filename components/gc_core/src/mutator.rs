//! Mutator thread model.
//!
//! A [`MutatorThread`] owns its frames, its watermark barriers and the poll
//! word its cooperative safepoint checks compare against. The GC processes
//! the thread's stack through [`MutatorThread::start_processing`] and
//! [`MutatorThread::finish_processing`]; in between, the thread fixes up the
//! frames it returns into on its own.

use crate::stack_watermark::{Frame, StackWatermark, StackWatermarkSet, WatermarkFixup, WatermarkKind};
use gc_types::Address;
use log::trace;
use std::sync::Arc;

/// Highest stack address of every mutator thread.
pub const STACK_BASE: usize = 0x7fff_0000;

/// Frame header bytes in addition to the reference slots.
const FRAME_HEADER: usize = 16;

/// Redirects stale references to their current location.
pub trait Remapper: Send + Sync {
    /// Returns the current address of the object referenced as `addr`.
    fn remap(&self, addr: Address) -> Address;
}

/// Watermark fixup remapping every reference slot of a frame.
pub struct RelocationWatermark {
    remapper: Arc<dyn Remapper>,
}

impl RelocationWatermark {
    /// Creates a fixup remapping through `remapper`.
    pub fn new(remapper: Arc<dyn Remapper>) -> Self {
        RelocationWatermark { remapper }
    }
}

impl WatermarkFixup for RelocationWatermark {
    fn process(&mut self, frame: &mut Frame) {
        for slot in frame.slots_mut() {
            if !slot.is_null() {
                *slot = self.remapper.remap(*slot);
            }
        }
    }
}

/// An application thread as seen by the collector.
#[derive(Debug)]
pub struct MutatorThread {
    id: usize,
    /// Youngest frame last
    frames: Vec<Frame>,
    watermarks: StackWatermarkSet,
    poll_word: usize,
    poll_updates: usize,
}

impl MutatorThread {
    /// Creates a thread without frames or barriers.
    pub fn new(id: usize) -> Self {
        MutatorThread {
            id,
            frames: Vec::new(),
            watermarks: StackWatermarkSet::new(),
            poll_word: 0,
            poll_updates: 0,
        }
    }

    /// Thread id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Frames, youngest last.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Number of frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// True if the thread has at least one managed frame.
    pub fn has_last_frame(&self) -> bool {
        !self.frames.is_empty()
    }

    /// The thread's watermark barriers.
    pub fn watermarks(&self) -> &StackWatermarkSet {
        &self.watermarks
    }

    /// Registers a barrier on the thread.
    pub fn add_watermark(&mut self, kind: WatermarkKind, fixup: impl WatermarkFixup + 'static) {
        self.watermarks.add_watermark(StackWatermark::new(kind, fixup));
    }

    pub(crate) fn frames_and_watermarks(&mut self) -> (&mut [Frame], &mut StackWatermarkSet) {
        (&mut self.frames, &mut self.watermarks)
    }

    /// Calls a new frame holding `slots`. Returns its stack pointer.
    pub fn push_frame(&mut self, slots: Vec<Address>) -> usize {
        let top = self.frames.last().map_or(STACK_BASE, Frame::sp);
        let sp = top - FRAME_HEADER - slots.len() * std::mem::size_of::<usize>();
        let mut frame = Frame::new(sp, slots);
        self.watermarks.on_new_frame(&mut frame);
        self.frames.push(frame);
        sp
    }

    /// Returns from the youngest frame.
    ///
    /// When the poll is armed and the caller lies at or above the poll word,
    /// the caller has not been processed yet and takes the slow path.
    pub fn return_from_frame(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        let needs_processing = self.is_poll_armed()
            && self.frames.last().is_some_and(|caller| caller.sp() >= self.poll_word);
        if needs_processing {
            trace!("thread {}: return poll slow path", self.id);
            StackWatermarkSet::after_unwind(self);
        }
        Some(frame)
    }

    /// Unwinds the youngest frame on an exceptional path.
    pub fn unwind(&mut self) -> Option<Frame> {
        StackWatermarkSet::before_unwind(self);
        let frame = self.frames.pop()?;
        StackWatermarkSet::after_unwind(self);
        Some(frame)
    }

    /// Starts stack processing for barriers of `kind` and processes the
    /// youngest frame right away.
    pub fn start_processing(&mut self, kind: WatermarkKind) {
        self.watermarks.start_iteration(kind);
        if let Some(youngest) = self.frames.len().checked_sub(1) {
            self.watermarks.on_iteration(&mut self.frames, youngest);
        }
        self.update_poll_values();
    }

    /// Processes every frame not yet processed for `kind` and ends the
    /// iteration.
    pub fn finish_processing(&mut self, kind: WatermarkKind) {
        self.watermarks.finish_iteration(kind, &mut self.frames, None);
        self.update_poll_values();
    }

    /// Walks the stack youngest first, letting the barriers process each
    /// frame before `visit` sees it.
    pub fn walk(&mut self, mut visit: impl FnMut(&Frame)) {
        for index in (0..self.frames.len()).rev() {
            self.watermarks.on_iteration(&mut self.frames, index);
            visit(&self.frames[index]);
        }
    }

    /// Value cooperative safepoint checks compare against, 0 when disarmed.
    pub fn poll_word(&self) -> usize {
        self.poll_word
    }

    /// True if returns must check the poll word.
    pub fn is_poll_armed(&self) -> bool {
        self.poll_word != 0
    }

    /// Number of poll value refreshes.
    pub fn poll_updates(&self) -> usize {
        self.poll_updates
    }

    /// Recomputes the poll word from the barriers.
    pub fn update_poll_values(&mut self) {
        self.poll_word = self.watermarks.lowest_watermark();
        self.poll_updates += 1;
    }
}
