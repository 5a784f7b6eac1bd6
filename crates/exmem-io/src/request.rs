//! Asynchronous block I/O requests.
//!
//! A [`Request`] carries one block-sized read or write against one
//! disk. The submitter keeps a [`RequestHandle`] and may `wait()` on
//! it; the per-disk worker performs the transfer and marks the request
//! done. The request holds a strong reference to its buffer, so the
//! buffer stays valid until completion.

use crate::file::DiskFile;
use exmem_common::{ExmemError, Result};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;

/// A shared block buffer.
///
/// The mutex serialises the owning container against the worker thread
/// for the duration of an in-flight transfer.
pub type BlockBuf = Arc<Mutex<Box<[u8]>>>;

/// Allocates a zeroed block buffer of `size` bytes.
pub fn alloc_block_buf(size: usize) -> BlockBuf {
    Arc::new(Mutex::new(vec![0u8; size].into_boxed_slice()))
}

/// Direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Transfer disk contents into the buffer.
    Read,
    /// Transfer the buffer onto disk.
    Write,
}

/// Completion status recorded by the worker (or by cancellation).
#[derive(Debug, Clone)]
enum Completion {
    Ok,
    Failed { kind: io::ErrorKind, message: String },
    Cancelled,
}

enum State {
    Pending,
    Done(Completion),
}

/// One queued or in-flight block transfer.
pub struct Request {
    kind: RequestKind,
    disk: u32,
    offset: u64,
    len: usize,
    buffer: BlockBuf,
    state: Mutex<State>,
    done: Condvar,
}

/// Shared handle to a request.
pub type RequestHandle = Arc<Request>;

impl Request {
    /// Creates a read request for `len` bytes at `offset` on `disk`.
    pub fn read(disk: u32, offset: u64, len: usize, buffer: BlockBuf) -> RequestHandle {
        Arc::new(Self::new(RequestKind::Read, disk, offset, len, buffer))
    }

    /// Creates a write request for `len` bytes at `offset` on `disk`.
    pub fn write(disk: u32, offset: u64, len: usize, buffer: BlockBuf) -> RequestHandle {
        Arc::new(Self::new(RequestKind::Write, disk, offset, len, buffer))
    }

    fn new(kind: RequestKind, disk: u32, offset: u64, len: usize, buffer: BlockBuf) -> Self {
        Self {
            kind,
            disk,
            offset,
            len,
            buffer,
            state: Mutex::new(State::Pending),
            done: Condvar::new(),
        }
    }

    /// Returns the request direction.
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Returns the target disk index.
    pub fn disk(&self) -> u32 {
        self.disk
    }

    /// Returns the shared buffer.
    pub fn buffer(&self) -> &BlockBuf {
        &self.buffer
    }

    /// Performs the transfer against `file`. Called by the worker.
    pub(crate) fn execute(&self, file: &DiskFile) {
        let result = {
            let mut buf = self.buffer.lock();
            match self.kind {
                RequestKind::Read => file.read_at(self.offset, &mut buf[..self.len]),
                RequestKind::Write => file.write_at(self.offset, &buf[..self.len]),
            }
        };

        let completion = match result {
            Ok(()) => Completion::Ok,
            Err(ExmemError::IoFailed { source, .. }) => Completion::Failed {
                kind: source.kind(),
                message: source.to_string(),
            },
            Err(other) => Completion::Failed {
                kind: io::ErrorKind::Other,
                message: other.to_string(),
            },
        };
        self.complete(completion);
    }

    /// Marks the request cancelled. Called by the queue.
    pub(crate) fn mark_cancelled(&self) {
        self.complete(Completion::Cancelled);
    }

    fn complete(&self, completion: Completion) {
        let mut state = self.state.lock();
        debug_assert!(matches!(*state, State::Pending));
        *state = State::Done(completion);
        self.done.notify_all();
    }

    /// Returns true once the request has completed (or was cancelled).
    pub fn poll(&self) -> bool {
        matches!(*self.state.lock(), State::Done(_))
    }

    /// Blocks until the request completes, then reports the outcome.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while matches!(*state, State::Pending) {
            self.done.wait(&mut state);
        }
        match &*state {
            State::Done(Completion::Ok) => Ok(()),
            State::Done(Completion::Cancelled) => Err(ExmemError::Cancelled),
            State::Done(Completion::Failed { kind, message }) => Err(ExmemError::IoFailed {
                disk: self.disk,
                offset: self.offset,
                length: self.len,
                source: io::Error::new(*kind, message.clone()),
            }),
            State::Pending => unreachable!(),
        }
    }
}
