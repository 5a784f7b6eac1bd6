//! Per-disk request queues.
//!
//! Each configured disk gets one FIFO of pending requests and one
//! worker thread that consumes it: submitters signal on enqueue, the
//! worker waits when the queue is empty. Reads and writes share the
//! queue, so I/O is FIFO per disk and unordered across disks.

use crate::file::DiskFile;
use crate::request::RequestHandle;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

struct QueueInner {
    pending: VecDeque<RequestHandle>,
    shutdown: bool,
}

struct QueueShared {
    file: Arc<DiskFile>,
    inner: Mutex<QueueInner>,
    nonempty: Condvar,
}

/// The queue and worker for a single disk.
struct DiskQueue {
    shared: Arc<QueueShared>,
    worker: Option<JoinHandle<()>>,
}

impl DiskQueue {
    fn new(file: Arc<DiskFile>) -> Self {
        let shared = Arc::new(QueueShared {
            file,
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                shutdown: false,
            }),
            nonempty: Condvar::new(),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("exmem-io-{}", shared.file.index()))
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn I/O worker thread")
        };

        Self {
            shared,
            worker: Some(worker),
        }
    }

    fn submit(&self, request: RequestHandle) {
        let mut inner = self.shared.inner.lock();
        inner.pending.push_back(request);
        self.shared.nonempty.notify_one();
    }

    fn cancel(&self, request: &RequestHandle) -> bool {
        let mut inner = self.shared.inner.lock();
        if let Some(pos) = inner
            .pending
            .iter()
            .position(|queued| Arc::ptr_eq(queued, request))
        {
            let removed = inner.pending.remove(pos).unwrap();
            drop(inner);
            removed.mark_cancelled();
            return true;
        }
        false
    }
}

impl Drop for DiskQueue {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.shutdown = true;
            self.shared.nonempty.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        debug!(disk = self.shared.file.index(), "request queue shut down");
    }
}

/// Worker body: pop one request at a time and execute it against the
/// disk. Pending requests are drained before shutdown takes effect.
fn worker_loop(shared: &QueueShared) {
    loop {
        let request = {
            let mut inner = shared.inner.lock();
            loop {
                if let Some(request) = inner.pending.pop_front() {
                    break request;
                }
                if inner.shutdown {
                    return;
                }
                shared.nonempty.wait(&mut inner);
            }
        };
        request.execute(&shared.file);
    }
}

/// The set of per-disk queues.
pub struct RequestQueue {
    queues: Vec<DiskQueue>,
}

impl RequestQueue {
    /// Spawns one worker per disk.
    pub fn new(files: Vec<Arc<DiskFile>>) -> Self {
        Self {
            queues: files.into_iter().map(DiskQueue::new).collect(),
        }
    }

    /// Enqueues a request on its disk's queue.
    ///
    /// The caller keeps the handle and may `wait()` on it.
    pub fn submit(&self, request: RequestHandle) {
        self.queues[request.disk() as usize].submit(request);
    }

    /// Cancels a request if the worker has not yet taken it.
    ///
    /// On success the request is marked done with the cancellation
    /// flag and `true` is returned; otherwise the request is left
    /// untouched (queued-and-taken or already complete) and `false`
    /// is returned.
    pub fn cancel(&self, request: &RequestHandle) -> bool {
        self.queues[request.disk() as usize].cancel(request)
    }

    /// Number of disks served.
    pub fn num_disks(&self) -> usize {
        self.queues.len()
    }
}
