//! `UringBackend` — io_uring `FileBackend` implementation.
//!
//! One submitter thread owns the ring. Submitters push jobs into a
//! lock-free queue and poke an eventfd; the ring thread keeps a
//! `POLL_ADD` armed on that eventfd so a blocked `submit_and_wait` returns
//! as soon as new work shows up. Files are opened on the ring thread, the
//! read goes in as `IORING_OP_READ` with the slab key as `user_data`. A
//! short CQE before EOF resubmits the remainder, so one read posts exactly
//! one `IoStatus` once it is full, hits EOF or fails.
//!
//! No SQPOLL, no fixed files, no fixed buffers.

use crate::eventfd::EventFd;

use xread_core::error::{Result, XreadError};
use xread_core::io_backend::{FileBackend, IoStatus, ReadOp, StatusSink};

use crossbeam_queue::ArrayQueue;
use io_uring::{opcode, squeue, types, IoUring};
use slab::Slab;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const WAKE_TOKEN: u64 = u64::MAX;

/// Configuration for UringBackend.
#[derive(Debug, Clone)]
pub struct UringConfig {
    /// Number of SQ entries. Must be power of 2. Also caps reads in flight.
    pub entries: u32,
    /// Jobs queued ahead of the ring before `submit_read` fails.
    pub queue_depth: usize,
}

impl Default for UringConfig {
    fn default() -> Self {
        Self {
            entries: 256,
            queue_depth: 4096,
        }
    }
}

struct Job {
    op: ReadOp,
    sink: Arc<dyn StatusSink>,
}

struct Shared {
    queue: ArrayQueue<Job>,
    wake: EventFd,
    inflight: AtomicUsize,
    shutdown: AtomicBool,
}

/// A read the kernel currently owns.
struct Slot {
    // Keeps the descriptor open until the last CQE arrives.
    file: File,
    dest: *mut u8,
    offset: u64,
    len: usize,
    /// Bytes landed so far; a short CQE resubmits the remainder.
    done: usize,
    token: u64,
    sink: Arc<dyn StatusSink>,
}

impl Slot {
    fn sqe(&self, key: usize) -> squeue::Entry {
        let remaining = self.len - self.done;
        // Safety: `dest` is valid for `len` bytes (submitter contract).
        let dest = unsafe { self.dest.add(self.done) };
        opcode::Read::new(types::Fd(self.file.as_raw_fd()), dest, remaining as u32)
            .offset(self.offset + self.done as u64)
            .build()
            .user_data(key as u64)
    }
}

pub struct UringBackend {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl UringBackend {
    /// Set up the ring and start the ring thread. Fails if io_uring is not
    /// available.
    pub fn new(config: UringConfig) -> Result<Self> {
        let ring = IoUring::builder().build(config.entries)?;
        let shared = Arc::new(Shared {
            queue: ArrayQueue::new(config.queue_depth.max(1)),
            wake: EventFd::create()?,
            inflight: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let entries = config.entries as usize;
        let thread = thread::Builder::new()
            .name("xread-uring".into())
            .spawn(move || ring_loop(ring, thread_shared, entries))?;
        tracing::debug!(entries = config.entries, "io_uring backend started");

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }
}

impl FileBackend for UringBackend {
    unsafe fn submit_read(&self, op: ReadOp, sink: Arc<dyn StatusSink>) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(XreadError::Backend(libc::ESHUTDOWN));
        }
        if op.len > u32::MAX as usize {
            return Err(XreadError::InvalidArgument("read larger than 4 GiB"));
        }
        self.shared.inflight.fetch_add(1, Ordering::AcqRel);
        if self.shared.queue.push(Job { op, sink }).is_err() {
            self.shared.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(XreadError::Backend(libc::EAGAIN));
        }
        self.shared.wake.notify()
    }

    fn inflight(&self) -> usize {
        self.shared.inflight.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shared.wake.notify();
    }

    fn name(&self) -> &'static str {
        "io_uring"
    }
}

impl Drop for UringBackend {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// Push one SQE, flushing the SQ once if it is full.
fn push_sqe(ring: &mut IoUring, sqe: &squeue::Entry) -> bool {
    // Safety: every buffer and fd referenced by our SQEs outlives the CQE
    // (kept alive in `Slot` / by the submitter contract).
    unsafe {
        if ring.submission().push(sqe).is_ok() {
            return true;
        }
    }
    if ring.submit().is_err() {
        return false;
    }
    unsafe { ring.submission().push(sqe).is_ok() }
}

fn post(shared: &Shared, sink: &Arc<dyn StatusSink>, status: IoStatus) {
    if let Err(e) = sink.post(status) {
        tracing::error!(token = status.token, error = %e, "failed to post read status");
    }
    shared.inflight.fetch_sub(1, Ordering::AcqRel);
}

fn ring_loop(mut ring: IoUring, shared: Arc<Shared>, max_inflight: usize) {
    let mut slots: Slab<Slot> = Slab::with_capacity(max_inflight);
    let mut wake_armed = false;
    let mut reaped: Vec<(u64, i32)> = Vec::with_capacity(max_inflight);

    loop {
        // ── Step 1: keep the wake poll armed ──
        if !wake_armed {
            let poll = opcode::PollAdd::new(types::Fd(shared.wake.fd()), libc::POLLIN as u32)
                .build()
                .user_data(WAKE_TOKEN);
            wake_armed = push_sqe(&mut ring, &poll);
        }

        // ── Step 2: move queued jobs into the ring ──
        while slots.len() < max_inflight {
            let Some(job) = shared.queue.pop() else { break };
            let file = match File::open(&job.op.path) {
                Ok(f) => f,
                Err(e) => {
                    let errno = e.raw_os_error().unwrap_or(libc::EIO);
                    post(&shared, &job.sink, IoStatus::failed(job.op.token, errno));
                    continue;
                }
            };
            let slot = Slot {
                file,
                dest: job.op.dest,
                offset: job.op.offset,
                len: job.op.len,
                done: 0,
                token: job.op.token,
                sink: job.sink,
            };
            let entry = slots.vacant_entry();
            if push_sqe(&mut ring, &slot.sqe(entry.key())) {
                entry.insert(slot);
            } else {
                post(&shared, &slot.sink, IoStatus::failed(slot.token, libc::EAGAIN));
            }
        }

        if shared.shutdown.load(Ordering::Acquire) && slots.is_empty() && shared.queue.is_empty() {
            break;
        }

        // ── Step 3: submit and wait for at least one CQE ──
        if let Err(e) = ring.submit_and_wait(1) {
            if e.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            tracing::error!(error = %e, "io_uring submit_and_wait failed");
            break;
        }

        // ── Step 4: reap ──
        reaped.clear();
        reaped.extend(ring.completion().map(|cqe| (cqe.user_data(), cqe.result())));
        for &(user_data, res) in &reaped {
            if user_data == WAKE_TOKEN {
                shared.wake.drain();
                wake_armed = false;
                continue;
            }
            let key = user_data as usize;
            if !slots.contains(key) {
                continue;
            }
            if res > 0 {
                let slot = &mut slots[key];
                slot.done += res as usize;
                if slot.done < slot.len {
                    // Short read before EOF: go again for the rest.
                    if push_sqe(&mut ring, &slot.sqe(key)) {
                        continue;
                    }
                    let slot = slots.remove(key);
                    post(&shared, &slot.sink, IoStatus::failed(slot.token, libc::EAGAIN));
                    continue;
                }
            }
            let slot = slots.remove(key);
            let status = if res < 0 {
                IoStatus::failed(slot.token, -res)
            } else {
                IoStatus::ok(slot.token, slot.done)
            };
            post(&shared, &slot.sink, status);
        }
    }

    // Anything still queued after a fatal ring error is failed so that no
    // submitter waits forever.
    for slot in slots.drain() {
        post(&shared, &slot.sink, IoStatus::failed(slot.token, libc::EIO));
    }
    while let Some(job) = shared.queue.pop() {
        post(&shared, &job.sink, IoStatus::failed(job.op.token, libc::ESHUTDOWN));
    }
    tracing::debug!("io_uring backend stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_pipe::status_pipe;
    use std::io::Write;
    use std::time::{Duration, Instant};

    #[test]
    fn test_uring_reads() {
        let backend = match UringBackend::new(UringConfig::default()) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("skipping: io_uring unavailable ({})", e);
                return;
            }
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        File::create(&path).unwrap().write_all(&[b'a'; 8192]).unwrap();

        let (writer, mut reader) = status_pipe().unwrap();
        let sink: Arc<dyn StatusSink> = Arc::new(writer);

        let mut good = vec![0u8; 4086];
        let mut bad = vec![0u8; 16];
        // Straddles EOF: the first CQE is short, the resubmit returns 0.
        let mut tail = vec![0xEEu8; 4096];
        unsafe {
            backend
                .submit_read(
                    ReadOp {
                        path: path.clone(),
                        offset: 100,
                        len: good.len(),
                        dest: good.as_mut_ptr(),
                        token: 10,
                    },
                    Arc::clone(&sink),
                )
                .unwrap();
            backend
                .submit_read(
                    ReadOp {
                        path: dir.path().join("absent"),
                        offset: 0,
                        len: bad.len(),
                        dest: bad.as_mut_ptr(),
                        token: 11,
                    },
                    Arc::clone(&sink),
                )
                .unwrap();
            backend
                .submit_read(
                    ReadOp {
                        path: path.clone(),
                        offset: 8000,
                        len: tail.len(),
                        dest: tail.as_mut_ptr(),
                        token: 12,
                    },
                    Arc::clone(&sink),
                )
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        while out.len() < 3 && Instant::now() < deadline {
            reader.read_batch(&mut out).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        out.sort_by_key(|s| s.token);
        assert_eq!(
            out,
            vec![
                IoStatus::ok(10, 4086),
                IoStatus::failed(11, libc::ENOENT),
                IoStatus::ok(12, 192),
            ]
        );
        assert!(good.iter().all(|&b| b == b'a'));
        assert!(tail[..192].iter().all(|&b| b == b'a'));
        assert!(tail[192..].iter().all(|&b| b == 0xEE));
        assert_eq!(backend.inflight(), 0);
    }
}
