//! Stackless Op Dispatch
//!
//! Some streaming transforms (compressors, encoders wrapping a destination
//! writer) burn far more stack than an async task should carry. This module
//! funnels their operations through a small fixed pool of dedicated worker
//! threads with large stacks, so thousands of concurrent connections can
//! share a handful of heavyweight stacks instead of each paying for one.
//!
//! ## Overview
//!
//! ```text
//! ┌──────────────┐  try_send   ┌─────────────┐   run op    ┌──────────────┐
//! │ Stackless    │────────────>│  bounded    │────────────>│ worker thread│
//! │ Writer (task)│             │  job queue  │             │ (big stack)  │
//! └──────┬───────┘             └─────────────┘             └──────┬───────┘
//!        │ awaits oneshot                                         │
//!        │<────────────── op + scratch + result ──────────────────┘
//!        ▼
//!  one write of the scratch buffer into the real destination
//! ```
//!
//! Ops never touch the destination directly: each job runs against a pooled
//! scratch buffer, and the caller copies the scratch out in a single write
//! once the job completes. When the queue is full the dispatcher fails fast
//! with [`DispatchError::HighLoad`] instead of queueing unbounded work.

use crossbeam::queue::ArrayQueue;
use std::io;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Stack size for dispatcher worker threads. Sized so that ops with deep
/// call chains never outgrow it.
const WORKER_STACK_SIZE: usize = 4 * 1024 * 1024;

/// Scratch buffers above this capacity are dropped instead of pooled.
const MAX_POOLED_SCRATCH: usize = 64 * 1024;

/// How many scratch buffers the shared pool retains.
const SCRATCH_POOL_SIZE: usize = 64;

/// Errors surfaced by the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// All workers are busy and the queue is full. The op was not run.
    #[error("stackless dispatcher at capacity")]
    HighLoad,

    /// The worker pool has shut down.
    #[error("stackless dispatcher terminated")]
    Terminated,

    /// The op itself, or the destination write, failed.
    #[error("stackless op failed: {0}")]
    Io(#[from] io::Error),
}

/// A streaming operation executed on dispatcher workers.
///
/// `dest` is always the pooled scratch buffer, never the real destination.
/// Implementations may buffer internally between calls; `reset` must drop
/// all such state so the op can be rebound to a fresh stream.
pub trait StreamOp: Send + 'static {
    /// Consumes `input`, writing any produced bytes to `dest`. Returns the
    /// number of input bytes accepted.
    fn write(&mut self, dest: &mut Vec<u8>, input: &[u8]) -> io::Result<usize>;

    /// Drains internally buffered bytes to `dest`.
    fn flush(&mut self, dest: &mut Vec<u8>) -> io::Result<()>;

    /// Finalizes the stream, writing any trailer bytes to `dest`.
    fn close(&mut self, dest: &mut Vec<u8>) -> io::Result<()>;

    /// Clears all internal state.
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpCode {
    Write,
    Flush,
    Close,
    Reset,
}

struct Job {
    op: Box<dyn StreamOp>,
    code: OpCode,
    input: Vec<u8>,
    scratch: Vec<u8>,
    reply: oneshot::Sender<JobDone>,
}

struct JobDone {
    op: Box<dyn StreamOp>,
    scratch: Vec<u8>,
    result: io::Result<usize>,
}

/// A fixed pool of big-stack worker threads fed by a bounded queue.
pub struct Dispatcher {
    tx: SyncSender<Job>,
    workers: usize,
}

impl Dispatcher {
    /// Creates a dispatcher with `workers` threads and a queue bound of the
    /// same size.
    pub fn new(workers: usize) -> io::Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = sync_channel::<Job>(workers);
        let rx = Arc::new(Mutex::new(rx));

        for id in 0..workers {
            let rx = Arc::clone(&rx);
            thread::Builder::new()
                .name(format!("stackless-{id}"))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || worker_loop(rx))?;
        }

        Ok(Self { tx, workers })
    }

    /// The process-wide dispatcher, sized to the available parallelism.
    pub fn shared() -> &'static Arc<Dispatcher> {
        static SHARED: OnceLock<Arc<Dispatcher>> = OnceLock::new();
        SHARED.get_or_init(|| {
            let workers = thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            // Thread spawning at first use only fails if the process is
            // already resource-exhausted; surface that as a panic rather
            // than limping along with no workers.
            Arc::new(Dispatcher::new(workers).unwrap_or_else(|e| {
                panic!("failed to start stackless workers: {e}")
            }))
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queues a job without blocking. On rejection the job comes back with
    /// the error so the caller can recover the op it carries.
    fn try_submit(&self, job: Job) -> Result<(), (DispatchError, Job)> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                debug!("stackless queue full, rejecting op");
                Err((DispatchError::HighLoad, job))
            }
            Err(TrySendError::Disconnected(job)) => Err((DispatchError::Terminated, job)),
        }
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let guard = match rx.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            match guard.recv() {
                Ok(job) => job,
                Err(_) => return,
            }
        };

        let Job {
            mut op,
            code,
            input,
            mut scratch,
            reply,
        } = job;

        let result = match code {
            OpCode::Write => op.write(&mut scratch, &input),
            OpCode::Flush => op.flush(&mut scratch).map(|_| 0),
            OpCode::Close => op.close(&mut scratch).map(|_| 0),
            OpCode::Reset => {
                op.reset();
                Ok(0)
            }
        };

        // The receiver may have been dropped; the op is lost with it.
        let _ = reply.send(JobDone {
            op,
            scratch,
            result,
        });
    }
}

fn scratch_pool() -> &'static ArrayQueue<Vec<u8>> {
    static POOL: OnceLock<ArrayQueue<Vec<u8>>> = OnceLock::new();
    POOL.get_or_init(|| ArrayQueue::new(SCRATCH_POOL_SIZE))
}

fn take_scratch() -> Vec<u8> {
    scratch_pool()
        .pop()
        .unwrap_or_else(|| Vec::with_capacity(4096))
}

fn put_scratch(mut buf: Vec<u8>) {
    if buf.capacity() <= MAX_POOLED_SCRATCH {
        buf.clear();
        let _ = scratch_pool().push(buf);
    }
}

/// An async front for a [`StreamOp`] whose execution is offloaded to the
/// dispatcher.
///
/// Each logical call results in exactly one write of produced bytes into the
/// destination, after the op has completed on a worker.
pub struct StacklessWriter<D: io::Write + Send> {
    dst: D,
    op: Option<Box<dyn StreamOp>>,
    dispatcher: Arc<Dispatcher>,
}

impl<D: io::Write + Send> StacklessWriter<D> {
    pub fn new(dst: D, op: Box<dyn StreamOp>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dst,
            op: Some(op),
            dispatcher,
        }
    }

    /// Feeds `input` through the op, writing produced bytes to the
    /// destination. Returns the number of input bytes the op accepted.
    pub async fn write(&mut self, input: &[u8]) -> Result<usize, DispatchError> {
        self.run(OpCode::Write, input).await
    }

    /// Drains the op's internal buffers to the destination and flushes it.
    pub async fn flush(&mut self) -> Result<(), DispatchError> {
        self.run(OpCode::Flush, &[]).await?;
        self.dst.flush().map_err(DispatchError::Io)
    }

    /// Finalizes the stream, writing trailer bytes and flushing.
    pub async fn close(&mut self) -> Result<(), DispatchError> {
        self.run(OpCode::Close, &[]).await?;
        self.dst.flush().map_err(DispatchError::Io)
    }

    /// Clears all op state and rebinds the writer to a new destination.
    /// Bytes buffered from the previous stream are discarded, never written.
    pub async fn reset(&mut self, dst: D) -> Result<(), DispatchError> {
        self.dst = dst;
        self.run(OpCode::Reset, &[]).await?;
        Ok(())
    }

    /// Gives back the destination, dropping the op.
    pub fn into_inner(self) -> D {
        self.dst
    }

    async fn run(&mut self, code: OpCode, input: &[u8]) -> Result<usize, DispatchError> {
        // The op travels to the worker and back; only a lost reply poisons
        // the writer. A rejected submit never ran, so the op is restored
        // and the call can be retried once load drops.
        let op = self.op.take().ok_or(DispatchError::Terminated)?;
        let (reply_tx, reply_rx) = oneshot::channel();

        let job = Job {
            op,
            code,
            input: input.to_vec(),
            scratch: take_scratch(),
            reply: reply_tx,
        };
        if let Err((err, job)) = self.dispatcher.try_submit(job) {
            self.op = Some(job.op);
            put_scratch(job.scratch);
            return Err(err);
        }

        let done = reply_rx.await.map_err(|_| DispatchError::Terminated)?;
        self.op = Some(done.op);

        let written = match (&done.result, code) {
            // A reset discards whatever the op produced while clearing.
            (Ok(_), OpCode::Reset) => Ok(()),
            (Ok(_), _) if !done.scratch.is_empty() => {
                self.dst.write_all(&done.scratch)
            }
            _ => Ok(()),
        };
        put_scratch(done.scratch);

        let n = done.result.map_err(DispatchError::Io)?;
        written.map_err(DispatchError::Io)?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Buffers input until flushed, then emits it framed in brackets. Close
    /// appends a terminator. Enough state to observe reset semantics.
    struct FramingOp {
        pending: Vec<u8>,
    }

    impl FramingOp {
        fn new() -> Box<Self> {
            Box::new(Self {
                pending: Vec::new(),
            })
        }
    }

    impl StreamOp for FramingOp {
        fn write(&mut self, _dest: &mut Vec<u8>, input: &[u8]) -> io::Result<usize> {
            self.pending.extend_from_slice(input);
            Ok(input.len())
        }

        fn flush(&mut self, dest: &mut Vec<u8>) -> io::Result<()> {
            if !self.pending.is_empty() {
                dest.push(b'[');
                dest.extend_from_slice(&self.pending);
                dest.push(b']');
                self.pending.clear();
            }
            Ok(())
        }

        fn close(&mut self, dest: &mut Vec<u8>) -> io::Result<()> {
            self.flush(dest)?;
            dest.extend_from_slice(b"<end>");
            Ok(())
        }

        fn reset(&mut self) {
            self.pending.clear();
        }
    }

    /// An op that blocks its worker, for saturation tests.
    struct SlowOp;

    impl StreamOp for SlowOp {
        fn write(&mut self, dest: &mut Vec<u8>, input: &[u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(300));
            dest.extend_from_slice(input);
            Ok(input.len())
        }

        fn flush(&mut self, _dest: &mut Vec<u8>) -> io::Result<()> {
            Ok(())
        }

        fn close(&mut self, _dest: &mut Vec<u8>) -> io::Result<()> {
            Ok(())
        }

        fn reset(&mut self) {}
    }

    /// Destination wrapper that counts write calls.
    #[derive(Default)]
    struct CountingDest {
        data: Vec<u8>,
        writes: Arc<AtomicUsize>,
    }

    impl io::Write for CountingDest {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_write_flush_close_output() {
        let dispatcher = Arc::new(Dispatcher::new(2).unwrap());
        let mut w = StacklessWriter::new(Vec::new(), FramingOp::new(), dispatcher);

        assert_eq!(w.write(b"hello").await.unwrap(), 5);
        assert_eq!(w.write(b" world").await.unwrap(), 6);
        w.flush().await.unwrap();
        w.close().await.unwrap();

        assert_eq!(w.into_inner(), b"[hello world]<end>");
    }

    #[tokio::test]
    async fn test_single_destination_write_per_op() {
        let dispatcher = Arc::new(Dispatcher::new(2).unwrap());
        let writes = Arc::new(AtomicUsize::new(0));
        let dst = CountingDest {
            data: Vec::new(),
            writes: Arc::clone(&writes),
        };
        let mut w = StacklessWriter::new(dst, FramingOp::new(), dispatcher);

        // Buffered writes produce no destination traffic at all.
        w.write(b"aaaa").await.unwrap();
        w.write(b"bbbb").await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 0);

        // The flush lands as exactly one destination write.
        w.flush().await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(w.into_inner().data, b"[aaaabbbb]");
    }

    #[tokio::test]
    async fn test_reset_discards_residual_bytes() {
        let dispatcher = Arc::new(Dispatcher::new(2).unwrap());
        let mut w = StacklessWriter::new(Vec::new(), FramingOp::new(), dispatcher);

        w.write(b"stale").await.unwrap();
        w.reset(Vec::new()).await.unwrap();

        w.write(b"fresh").await.unwrap();
        w.flush().await.unwrap();
        assert_eq!(w.into_inner(), b"[fresh]");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_saturation_fails_fast() {
        // One worker, queue bound of one: a third concurrent op must be
        // rejected without running.
        let dispatcher = Arc::new(Dispatcher::new(1).unwrap());

        let mut handles = Vec::new();
        for _ in 0..2 {
            let d = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move {
                let mut w = StacklessWriter::new(Vec::new(), Box::new(SlowOp), d);
                w.write(b"x").await
            }));
            // Stagger so the first job is on the worker before the second
            // takes the queue slot.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut w =
            StacklessWriter::new(Vec::new(), Box::new(SlowOp), Arc::clone(&dispatcher));
        match w.write(b"x").await {
            Err(DispatchError::HighLoad) => {}
            other => panic!("expected HighLoad, got {:?}", other.map(|_| ())),
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }

        // The rejection is transient: the writer keeps its op and the same
        // call succeeds once the pool has drained.
        assert_eq!(w.write(b"x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_op_error_propagates() {
        struct FailingOp;
        impl StreamOp for FailingOp {
            fn write(&mut self, _: &mut Vec<u8>, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "boom"))
            }
            fn flush(&mut self, _: &mut Vec<u8>) -> io::Result<()> {
                Ok(())
            }
            fn close(&mut self, _: &mut Vec<u8>) -> io::Result<()> {
                Ok(())
            }
            fn reset(&mut self) {}
        }

        let dispatcher = Arc::new(Dispatcher::new(1).unwrap());
        let mut w = StacklessWriter::new(Vec::new(), Box::new(FailingOp), dispatcher);
        assert!(matches!(
            w.write(b"x").await,
            Err(DispatchError::Io(_))
        ));
    }
}
