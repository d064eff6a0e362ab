//! Staged persistence pipeline for checkpoint windows.
//!
//! Six stages, each a dedicated worker thread behind a bounded queue:
//! buffer, id-tagging, serialization, compression, database write, and
//! cache eviction. Publishers block when a queue is full. The write worker
//! is the sole owner of the database handle and also serves synchronous
//! hydration and listing requests from the simulator thread.
//!
//! Any stage failure is fatal to persistence: the failure flag is raised,
//! in-flight work drains, and the store refuses further publishes while
//! cached state stays accessible.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use simvault_core::{CheckpointError, ChkptId, DetachedCheckpoint, Result};
use tracing::{debug, error, info};

use crate::compress::compress;
use crate::database::WindowDatabase;
use crate::window::encode_window;
use crate::windowed::WindowCache;

/// Message flowing between stages.
enum Stage<T> {
    /// A unit of stage work.
    Work(T),
    /// Drain marker: emit partial state, forward, ack at the last stage.
    Flush(Sender<()>),
    /// Terminate marker: forward and stop.
    Shutdown,
}

/// A window with its ordered member-id list recorded.
struct TaggedWindow {
    ids: Vec<ChkptId>,
    chkpts: Vec<DetachedCheckpoint>,
}

/// Serialized (later compressed) window bytes plus member ids.
struct WindowBytes {
    ids: Vec<ChkptId>,
    bytes: Vec<u8>,
}

/// Work accepted by the write stage.
enum WriteWork {
    /// Persist a compressed window.
    Window(WindowBytes),
    /// Read back the blob containing `id`.
    Hydrate {
        id: ChkptId,
        reply: Sender<Result<Option<Vec<u8>>>>,
    },
    /// List every persisted checkpoint id.
    ListIds {
        reply: Sender<Result<Vec<ChkptId>>>,
    },
    /// Read back every window blob.
    AllWindows {
        reply: Sender<Result<Vec<Vec<u8>>>>,
    },
}

fn pipeline_closed<T>(_: T) -> CheckpointError {
    CheckpointError::Pipeline("pipeline queue closed".to_string())
}

/// Sends downstream, raising the failure flag if the receiver is gone.
fn forward<T>(tx: &Sender<Stage<T>>, msg: Stage<T>, failed: &AtomicBool, stage: &str) -> bool {
    if tx.send(msg).is_err() {
        error!(stage, "downstream pipeline stage is gone");
        failed.store(true, Ordering::Release);
        return false;
    }
    true
}

fn run_buffer(
    rx: &Receiver<Stage<Box<DetachedCheckpoint>>>,
    tx: &Sender<Stage<Vec<DetachedCheckpoint>>>,
    window_len: usize,
    failed: &AtomicBool,
) {
    let mut buf: Vec<DetachedCheckpoint> = Vec::with_capacity(window_len);
    for msg in rx {
        match msg {
            Stage::Work(chkpt) => {
                buf.push(*chkpt);
                if buf.len() == window_len {
                    let window = std::mem::replace(&mut buf, Vec::with_capacity(window_len));
                    if !forward(tx, Stage::Work(window), failed, "buffer") {
                        return;
                    }
                }
            }
            Stage::Flush(ack) => {
                if !buf.is_empty() {
                    let window = std::mem::take(&mut buf);
                    if !forward(tx, Stage::Work(window), failed, "buffer") {
                        return;
                    }
                }
                if !forward(tx, Stage::Flush(ack), failed, "buffer") {
                    return;
                }
            }
            Stage::Shutdown => {
                forward(tx, Stage::Shutdown, failed, "buffer");
                return;
            }
        }
    }
}

fn run_tag(
    rx: &Receiver<Stage<Vec<DetachedCheckpoint>>>,
    tx: &Sender<Stage<TaggedWindow>>,
    failed: &AtomicBool,
) {
    for msg in rx {
        match msg {
            Stage::Work(chkpts) => {
                let ids = chkpts.iter().map(|c| c.id).collect();
                if !forward(tx, Stage::Work(TaggedWindow { ids, chkpts }), failed, "tag") {
                    return;
                }
            }
            Stage::Flush(ack) => {
                if !forward(tx, Stage::Flush(ack), failed, "tag") {
                    return;
                }
            }
            Stage::Shutdown => {
                forward(tx, Stage::Shutdown, failed, "tag");
                return;
            }
        }
    }
}

fn run_serialize(
    rx: &Receiver<Stage<TaggedWindow>>,
    tx: &Sender<Stage<WindowBytes>>,
    failed: &AtomicBool,
) {
    for msg in rx {
        match msg {
            Stage::Work(window) => {
                if failed.load(Ordering::Acquire) {
                    continue;
                }
                match encode_window(&window.chkpts) {
                    Ok(bytes) => {
                        let out = WindowBytes {
                            ids: window.ids,
                            bytes,
                        };
                        if !forward(tx, Stage::Work(out), failed, "serialize") {
                            return;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "window serialization failed");
                        failed.store(true, Ordering::Release);
                    }
                }
            }
            Stage::Flush(ack) => {
                if !forward(tx, Stage::Flush(ack), failed, "serialize") {
                    return;
                }
            }
            Stage::Shutdown => {
                forward(tx, Stage::Shutdown, failed, "serialize");
                return;
            }
        }
    }
}

fn run_compress(
    rx: &Receiver<Stage<WindowBytes>>,
    tx: &Sender<Stage<WriteWork>>,
    failed: &AtomicBool,
) {
    for msg in rx {
        match msg {
            Stage::Work(mut wb) => {
                if failed.load(Ordering::Acquire) {
                    continue;
                }
                match compress(&wb.bytes) {
                    Ok(compressed) => {
                        wb.bytes = compressed;
                        if !forward(tx, Stage::Work(WriteWork::Window(wb)), failed, "compress") {
                            return;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "window compression failed");
                        failed.store(true, Ordering::Release);
                    }
                }
            }
            Stage::Flush(ack) => {
                if !forward(tx, Stage::Flush(ack), failed, "compress") {
                    return;
                }
            }
            Stage::Shutdown => {
                forward(tx, Stage::Shutdown, failed, "compress");
                return;
            }
        }
    }
}

fn run_write(
    rx: &Receiver<Stage<WriteWork>>,
    tx: &Sender<Stage<Vec<ChkptId>>>,
    db: &dyn WindowDatabase,
    failed: &AtomicBool,
) {
    for msg in rx {
        match msg {
            Stage::Work(WriteWork::Window(wb)) => {
                if failed.load(Ordering::Acquire) {
                    continue;
                }
                match db.insert_window(&wb.bytes, &wb.ids) {
                    Ok(row_id) => {
                        debug!(row_id, ids = ?wb.ids, "persisted checkpoint window");
                        if !forward(tx, Stage::Work(wb.ids), failed, "write") {
                            return;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "window database write failed");
                        failed.store(true, Ordering::Release);
                    }
                }
            }
            Stage::Work(WriteWork::Hydrate { id, reply }) => {
                let _ = reply.send(db.window_for(id));
            }
            Stage::Work(WriteWork::ListIds { reply }) => {
                let _ = reply.send(db.ids());
            }
            Stage::Work(WriteWork::AllWindows { reply }) => {
                let _ = reply.send(db.all_windows());
            }
            Stage::Flush(ack) => {
                if !forward(tx, Stage::Flush(ack), failed, "write") {
                    return;
                }
            }
            Stage::Shutdown => {
                forward(tx, Stage::Shutdown, failed, "write");
                return;
            }
        }
    }
}

fn run_evict(rx: &Receiver<Stage<Vec<ChkptId>>>, cache: &Mutex<WindowCache>) {
    // Durable ids whose cache marks have not been applied yet. Applied with
    // try_lock so this worker never blocks behind a simulator thread that
    // is itself waiting on the write worker.
    let mut pending: Vec<ChkptId> = Vec::new();

    let apply = |pending: &mut Vec<ChkptId>, cache: &mut WindowCache| {
        cache.mark_durable(pending);
        cache.evict_excess();
        pending.clear();
    };

    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Stage::Work(ids)) => {
                pending.extend(ids);
                if let Some(mut cache) = cache.try_lock() {
                    apply(&mut pending, &mut cache);
                }
            }
            Ok(Stage::Flush(ack)) => {
                if !pending.is_empty() {
                    apply(&mut pending, &mut cache.lock());
                }
                let _ = ack.send(());
            }
            Ok(Stage::Shutdown) => {
                if !pending.is_empty() {
                    apply(&mut pending, &mut cache.lock());
                }
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !pending.is_empty() {
                    if let Some(mut cache) = cache.try_lock() {
                        apply(&mut pending, &mut cache);
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                if !pending.is_empty() {
                    apply(&mut pending, &mut cache.lock());
                }
                return;
            }
        }
    }
}

/// Handle for draining the pipeline from outside the store, in the spirit
/// of a teardown hook: blocks until everything published so far is durable
/// and eviction marks are applied.
#[derive(Clone)]
pub struct PipelineHandle {
    input: Sender<Stage<Box<DetachedCheckpoint>>>,
    failed: Arc<AtomicBool>,
}

impl PipelineHandle {
    /// Drains the pipeline: every checkpoint published before this call is
    /// persisted and reported durable when it returns.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Pipeline`] if the pipeline has shut down.
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.input
            .send(Stage::Flush(ack_tx))
            .map_err(pipeline_closed)?;
        ack_rx.recv().map_err(pipeline_closed)?;
        Ok(())
    }

    /// True once any stage has failed; the store refuses further publishes.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// The spawned pipeline: stage queues plus worker join handles.
pub(crate) struct Pipeline {
    input: Sender<Stage<Box<DetachedCheckpoint>>>,
    write_tx: Sender<Stage<WriteWork>>,
    failed: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

/// Spawns one named stage worker, propagating OS spawn failure.
fn spawn_worker(name: &str, f: Box<dyn FnOnce() + Send>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| CheckpointError::Pipeline(format!("failed to spawn {name} worker: {e}")))
}

impl Pipeline {
    /// Spawns all six stage workers over bounded queues of `queue_depth`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Pipeline`] if a worker thread cannot be
    /// spawned. Workers already started exit on their own once the stage
    /// queues disconnect.
    pub(crate) fn spawn(
        db: Arc<dyn WindowDatabase>,
        cache: Arc<Mutex<WindowCache>>,
        window_len: usize,
        queue_depth: usize,
    ) -> Result<Self> {
        let failed = Arc::new(AtomicBool::new(false));

        let (input_tx, input_rx) = bounded(queue_depth);
        let (buf_tx, buf_rx) = bounded(queue_depth);
        let (tag_tx, tag_rx) = bounded(queue_depth);
        let (ser_tx, ser_rx) = bounded(queue_depth);
        let (write_tx, write_rx) = bounded(queue_depth);
        let (evict_tx, evict_rx) = bounded(queue_depth);

        let mut workers = Vec::with_capacity(6);

        {
            let (failed, tx) = (failed.clone(), buf_tx);
            workers.push(spawn_worker(
                "ckpt-buffer",
                Box::new(move || run_buffer(&input_rx, &tx, window_len, &failed)),
            )?);
        }
        {
            let (failed, tx) = (failed.clone(), tag_tx);
            workers.push(spawn_worker(
                "ckpt-tag",
                Box::new(move || run_tag(&buf_rx, &tx, &failed)),
            )?);
        }
        {
            let (failed, tx) = (failed.clone(), ser_tx);
            workers.push(spawn_worker(
                "ckpt-serialize",
                Box::new(move || run_serialize(&tag_rx, &tx, &failed)),
            )?);
        }
        {
            let (failed, tx) = (failed.clone(), write_tx.clone());
            workers.push(spawn_worker(
                "ckpt-compress",
                Box::new(move || run_compress(&ser_rx, &tx, &failed)),
            )?);
        }
        {
            let (failed, tx) = (failed.clone(), evict_tx);
            workers.push(spawn_worker(
                "ckpt-write",
                Box::new(move || run_write(&write_rx, &tx, db.as_ref(), &failed)),
            )?);
        }
        workers.push(spawn_worker(
            "ckpt-evict",
            Box::new(move || run_evict(&evict_rx, &cache)),
        )?);

        info!(window_len, queue_depth, "checkpoint pipeline started");
        Ok(Self {
            input: input_tx,
            write_tx,
            failed,
            workers,
        })
    }

    /// Shareable drain handle.
    pub(crate) fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            input: self.input.clone(),
            failed: self.failed.clone(),
        }
    }

    /// True once any stage has failed.
    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Publishes a detached clone, blocking while the input queue is full.
    pub(crate) fn publish(&self, chkpt: DetachedCheckpoint) -> Result<()> {
        if self.is_failed() {
            return Err(CheckpointError::Pipeline(
                "pipeline has failed and refuses further writes".to_string(),
            ));
        }
        self.input
            .send(Stage::Work(Box::new(chkpt)))
            .map_err(pipeline_closed)
    }

    /// Synchronously reads the blob containing `id` through the write
    /// worker. Blocks until the request is served.
    pub(crate) fn hydrate(&self, id: ChkptId) -> Result<Option<Vec<u8>>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.write_tx
            .send(Stage::Work(WriteWork::Hydrate { id, reply: reply_tx }))
            .map_err(pipeline_closed)?;
        reply_rx.recv().map_err(pipeline_closed)?
    }

    /// Synchronously lists every persisted checkpoint id.
    pub(crate) fn list_ids(&self) -> Result<Vec<ChkptId>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.write_tx
            .send(Stage::Work(WriteWork::ListIds { reply: reply_tx }))
            .map_err(pipeline_closed)?;
        reply_rx.recv().map_err(pipeline_closed)?
    }

    /// Synchronously reads back every persisted window blob.
    pub(crate) fn all_windows(&self) -> Result<Vec<Vec<u8>>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.write_tx
            .send(Stage::Work(WriteWork::AllWindows { reply: reply_tx }))
            .map_err(pipeline_closed)?;
        reply_rx.recv().map_err(pipeline_closed)?
    }

    /// Drains the pipeline; see [`PipelineHandle::flush`].
    pub(crate) fn flush(&self) -> Result<()> {
        self.handle().flush()
    }

    /// Stops the pipeline: terminate marker in, workers joined.
    pub(crate) fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        let _ = self.input.send(Stage::Shutdown);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!("checkpoint pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
