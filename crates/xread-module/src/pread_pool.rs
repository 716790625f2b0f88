//! `PreadPool` — default `FileBackend` implementation.
//!
//! Spawns N OS threads at creation. Workers dequeue read jobs from a
//! lock-free MPMC queue, open the file, `pread` into the destination and
//! post an `IoStatus` to the job's sink.
//!
//! No dynamic scaling. Simple, predictable, safe.

use xread_core::error::{Result, XreadError};
use xread_core::io_backend::{FileBackend, IoStatus, ReadOp, StatusSink};

use crossbeam_queue::ArrayQueue;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A work item for the pool.
struct Job {
    op: ReadOp,
    sink: Arc<dyn StatusSink>,
}

/// Shared state between submitters and workers.
struct PoolInner {
    /// Work queue: submitters → workers.
    queue: ArrayQueue<Job>,
    /// Accepted and not yet posted.
    inflight: AtomicUsize,
    /// Once set, workers drain the queue and exit.
    shutdown: AtomicBool,
}

pub struct PreadPool {
    inner: Arc<PoolInner>,
    workers: Vec<thread::Thread>,
    handles: Vec<thread::JoinHandle<()>>,
    next_wake: AtomicUsize,
}

impl PreadPool {
    /// Create a pool with `n` workers.
    ///
    /// `queue_depth`: max pending jobs before `submit_read` fails.
    pub fn new(n: usize, queue_depth: usize) -> Result<Self> {
        let n = n.clamp(1, 64);
        let inner = Arc::new(PoolInner {
            queue: ArrayQueue::new(queue_depth.max(1)),
            inflight: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("xread-pread-{}", worker_id))
                .spawn(move || worker_loop(inner))?;
            handles.push(handle);
        }
        let workers = handles.iter().map(|h| h.thread().clone()).collect();
        tracing::debug!(workers = n, queue_depth, "pread pool started");

        Ok(PreadPool {
            inner,
            workers,
            handles,
            next_wake: AtomicUsize::new(0),
        })
    }

    /// Default pool sizing: min(16, nproc), at least 2.
    pub fn auto_sized(queue_depth: usize) -> Result<Self> {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(cpus.clamp(2, 16), queue_depth)
    }

    fn wake_one(&self) {
        let idx = self.next_wake.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[idx].unpark();
    }
}

impl FileBackend for PreadPool {
    unsafe fn submit_read(&self, op: ReadOp, sink: Arc<dyn StatusSink>) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(XreadError::Backend(libc::ESHUTDOWN));
        }
        self.inner.inflight.fetch_add(1, Ordering::AcqRel);
        if self.inner.queue.push(Job { op, sink }).is_err() {
            self.inner.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(XreadError::Backend(libc::EAGAIN));
        }
        self.wake_one();
        Ok(())
    }

    fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for w in &self.workers {
            w.unpark();
        }
    }

    fn name(&self) -> &'static str {
        "pread"
    }
}

impl Drop for PreadPool {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop.
fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        match inner.queue.pop() {
            Some(job) => {
                let status = execute_read(&job.op);
                if let Err(e) = job.sink.post(status) {
                    tracing::error!(token = job.op.token, error = %e, "failed to post read status");
                }
                inner.inflight.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                // Submitters unpark a worker on push; the timeout only
                // bounds a missed wakeup.
                thread::park_timeout(Duration::from_millis(5));
            }
        }
    }
}

/// Positional read of the whole range, stopping early at end of file.
///
/// This runs on a worker thread; it MAY block. That's the point.
fn execute_read(op: &ReadOp) -> IoStatus {
    let file = match File::open(&op.path) {
        Ok(f) => f,
        Err(e) => return IoStatus::failed(op.token, e.raw_os_error().unwrap_or(libc::EIO)),
    };

    // Safety: the submitter guarantees `dest` is valid and exclusively ours
    // for `len` bytes until we post the status.
    let dest = unsafe { std::slice::from_raw_parts_mut(op.dest, op.len) };
    let mut done = 0;
    while done < dest.len() {
        match file.read_at(&mut dest[done..], op.offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return IoStatus::failed(op.token, e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }
    IoStatus::ok(op.token, done)
}
