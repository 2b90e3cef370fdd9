//! Collection drivers.
//!
//! [`Driver`] runs whole cycles through the collectors' phase APIs:
//!
//! - A minor collection collects the young generation.
//! - A major collection starts young and old marking in one pause, collects
//!   the young generation promoting every survivor, then marks and relocates
//!   the old generation.
//!
//! Operations that stand for pauses (`mark_start`, `mark_end`,
//! `relocate_start`) are serialized by one pause lock, so the two
//! generations interleave only in their concurrent phases. Marking of
//! either generation excludes reference healing, which rewrites the object
//! graph the marker walks.
//!
//! [`DriverThread`] runs collections requested over a channel on a
//! dedicated thread, one per collection kind.

use crate::collector::{Collector, CycleStats};
use crate::mark::MarkEngine;
use crossbeam::channel::{self, Receiver, Sender};
use gc_types::{GcError, GcResult};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Kind of collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Young generation only
    Minor,
    /// Both generations
    Major,
}

impl CollectionKind {
    fn thread_name(self) -> &'static str {
        match self {
            CollectionKind::Minor => "gc-driver-minor",
            CollectionKind::Major => "gc-driver-major",
        }
    }
}

/// Summary of a major collection.
#[derive(Debug, Clone, PartialEq)]
pub struct MajorCycleStats {
    /// The young cycle that promoted every survivor
    pub young: CycleStats,
    /// The old cycle
    pub old: CycleStats,
}

/// Result of a collection run by a [`DriverThread`].
#[derive(Debug, Clone, PartialEq)]
pub enum Collection {
    /// A minor collection
    Minor(CycleStats),
    /// A major collection
    Major(MajorCycleStats),
}

/// Runs collection cycles over both generations.
pub struct Driver {
    young: Collector,
    old: Collector,
    mark: Arc<dyn MarkEngine>,
    pause: Mutex<()>,
    young_cycle: Mutex<()>,
    old_cycle: Mutex<()>,
    /// Held shared while marking, exclusively while healing references
    graph: RwLock<()>,
    minor_collections: AtomicU64,
    major_collections: AtomicU64,
}

impl Driver {
    /// Creates a driver over the two collectors.
    ///
    /// # Panics
    ///
    /// Panics unless `young` and `old` collect the young and old generation.
    pub fn new(young: Collector, old: Collector, mark: Arc<dyn MarkEngine>) -> Self {
        assert_eq!(young.generation(), gc_types::GenerationId::Young);
        assert_eq!(old.generation(), gc_types::GenerationId::Old);
        Driver {
            young,
            old,
            mark,
            pause: Mutex::new(()),
            young_cycle: Mutex::new(()),
            old_cycle: Mutex::new(()),
            graph: RwLock::new(()),
            minor_collections: AtomicU64::new(0),
            major_collections: AtomicU64::new(0),
        }
    }

    /// The young collector.
    pub fn young(&self) -> &Collector {
        &self.young
    }

    /// The old collector.
    pub fn old(&self) -> &Collector {
        &self.old
    }

    /// Finished minor collections.
    pub fn minor_collections(&self) -> u64 {
        self.minor_collections.load(Ordering::Acquire)
    }

    /// Finished major collections.
    pub fn major_collections(&self) -> u64 {
        self.major_collections.load(Ordering::Acquire)
    }

    fn pause<T>(&self, op: impl FnOnce() -> GcResult<T>) -> GcResult<T> {
        let _pause = self.pause.lock();
        op()
    }

    fn mark(&self, collector: &Collector) -> GcResult<()> {
        collector.mark_roots()?;
        loop {
            while !collector.mark_follow()? {}
            if self.pause(|| collector.mark_end())? {
                return Ok(());
            }
        }
    }

    fn young_collection(&self, promote_all: bool) -> GcResult<CycleStats> {
        let young = &self.young;
        {
            let _marking = self.graph.read();
            if young.should_skip_mark_start() {
                debug!("Young mark start already done by the major collection");
            } else {
                self.pause(|| young.mark_start())?;
            }
            self.mark(young)?;
        }

        self.pause(|| young.relocate_start(promote_all))?;
        let stats = young.relocate()?;

        let _healing = self.graph.write();
        self.mark.roots_remap(&|addr| young.remap_object(addr));
        Ok(stats)
    }

    /// Runs a minor collection.
    pub fn collect_minor(&self) -> GcResult<CycleStats> {
        let _cycle = self.young_cycle.lock();
        info!("Minor collection");
        let stats = self.young_collection(false)?;
        self.minor_collections.fetch_add(1, Ordering::AcqRel);
        Ok(stats)
    }

    /// Runs a major collection.
    pub fn collect_major(&self) -> GcResult<MajorCycleStats> {
        let _old_cycle = self.old_cycle.lock();
        info!("Major collection");

        let young = {
            let _young_cycle = self.young_cycle.lock();
            // A failed old start leaves the young mark to the next minor
            self.pause(|| {
                self.young.mark_start()?;
                self.young.skip_mark_start();
                self.old.mark_start()
            })?;
            self.young_collection(true)?
        };

        let old = &self.old;
        {
            let _marking = self.graph.read();
            self.mark(old)?;
        }
        old.process_non_strong_references()?;
        self.pause(|| old.relocate_start(false))?;
        let old_stats = old.relocate()?;
        {
            let _healing = self.graph.write();
            self.mark.roots_remap(&|addr| old.remap_object(addr));
        }

        self.major_collections.fetch_add(1, Ordering::AcqRel);
        Ok(MajorCycleStats {
            young,
            old: old_stats,
        })
    }

    /// Runs a collection of `kind`.
    pub fn collect(&self, kind: CollectionKind) -> GcResult<Collection> {
        match kind {
            CollectionKind::Minor => self.collect_minor().map(Collection::Minor),
            CollectionKind::Major => self.collect_major().map(Collection::Major),
        }
    }
}

/// Message to a driver thread.
enum DriverMessage {
    /// Run a collection and send the result back
    Collect(Sender<GcResult<Collection>>),
    /// Stop the thread
    Stop,
}

/// Background thread running collections of one kind on request.
pub struct DriverThread {
    kind: CollectionKind,
    sender: Mutex<Option<Sender<DriverMessage>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DriverThread {
    /// Starts a thread running collections of `kind` on `driver`.
    pub fn spawn(driver: Arc<Driver>, kind: CollectionKind) -> GcResult<Self> {
        let (sender, receiver) = channel::unbounded::<DriverMessage>();
        let handle = thread::Builder::new()
            .name(kind.thread_name().into())
            .spawn(move || {
                while let Ok(DriverMessage::Collect(reply)) = receiver.recv() {
                    let result = driver.collect(kind);
                    if let Err(err) = &result {
                        warn!("{:?} collection failed: {}", kind, err);
                    }
                    // The requester may have stopped waiting
                    let _ = reply.send(result);
                }
                debug!("{} stopped", kind.thread_name());
            })?;

        Ok(DriverThread {
            kind,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Kind of collection the thread runs.
    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    /// Requests a collection. The result arrives on the returned channel.
    pub fn request(&self) -> GcResult<Receiver<GcResult<Collection>>> {
        let (reply, result) = channel::bounded(1);
        let sender = self.sender.lock();
        let stopped = || GcError::Io(std::io::Error::other(format!("{} is stopped", self.kind.thread_name())));
        sender
            .as_ref()
            .ok_or_else(stopped)?
            .send(DriverMessage::Collect(reply))
            .map_err(|_| stopped())?;
        Ok(result)
    }

    /// Requests a collection and waits for it.
    pub fn collect(&self) -> GcResult<Collection> {
        self.request()?.recv().map_err(|_| {
            GcError::Io(std::io::Error::other(format!(
                "{} exited before replying",
                self.kind.thread_name()
            )))
        })?
    }

    /// Stops the thread after the collections already requested.
    pub fn stop(&self) {
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(DriverMessage::Stop);
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("{} panicked", self.kind.thread_name());
            }
        }
    }
}

impl Drop for DriverThread {
    fn drop(&mut self) {
        self.stop();
    }
}
