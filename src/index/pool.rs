//! Fixed-size pool of OS worker threads with per-worker queues.
//!
//! Every worker owns a bounded inbound queue of [`Job`]s and an unbounded
//! outbound queue of [`Reply`]s. Work goes to the shorter of two randomly
//! sampled live queues. Shutdown sends [`Job::Stop`] to every worker,
//! collects the replies, and joins the threads within a fixed bound so a
//! hung worker can never block the caller forever.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded, unbounded,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const JOIN_POLL: Duration = Duration::from_millis(20);

/// Message sent to a worker.
#[derive(Debug)]
pub enum Job<I> {
    Work(I),
    Stop,
}

/// Message sent back by a worker.
#[derive(Debug)]
pub enum Reply<O> {
    /// Accumulated result, sent once on stop by workers that produce one
    Partial(Option<O>),
    /// Final acknowledgement; nothing follows it
    Stopped,
}

/// Per-thread job handler.
pub trait Worker: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Whether the worker answers a stop with [`Reply::Partial`] first.
    const SENDS_PARTIAL: bool = false;

    fn handle(&mut self, input: Self::Input);

    /// Consumes the worker after its last job.
    fn finish(self) -> Option<Self::Output>;
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No live workers left in the '{pool}' pool\nSuggestion: Check the logs for worker panics")]
    NoLiveWorkers { pool: String },

    #[error("Worker {worker} of the '{pool}' pool disconnected")]
    Disconnected { pool: String, worker: usize },

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("A worker pool needs at least one worker")]
    Empty,
}

/// Sizing and timeouts of a [`WorkerPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    /// Inbound queue bound per worker
    pub capacity: usize,
    /// Wait per reply poll during shutdown
    pub poll_timeout: Duration,
    /// Upper bound on the whole shutdown
    pub join_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            capacity: 10,
            poll_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(600),
        }
    }
}

/// What a pool handed back when it was shut down.
#[derive(Debug)]
pub struct PoolShutdown<O> {
    pub partials: Vec<O>,
    /// Threads still running when the join bound expired
    pub stuck_workers: usize,
    /// Replies that did not fit the worker protocol
    pub unexpected_replies: usize,
}

struct Lane<I, O> {
    inbound: Sender<Job<I>>,
    outbound: Receiver<Reply<O>>,
    handle: JoinHandle<()>,
}

pub struct WorkerPool<I, O> {
    name: String,
    config: PoolConfig,
    expects_partial: bool,
    lanes: Vec<Lane<I, O>>,
}

impl<I: Send + 'static, O: Send + 'static> WorkerPool<I, O> {
    /// Starts `config.workers` threads, building each worker with `factory`.
    pub fn spawn<W, F>(name: &str, config: PoolConfig, mut factory: F) -> Result<Self, PoolError>
    where
        W: Worker<Input = I, Output = O>,
        F: FnMut(usize) -> W,
    {
        if config.workers == 0 {
            return Err(PoolError::Empty);
        }

        let mut lanes = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let (job_tx, job_rx) = bounded(config.capacity.max(1));
            let (reply_tx, reply_rx) = unbounded();
            let worker = factory(index);
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || run_worker(worker, job_rx, reply_tx))?;
            lanes.push(Lane {
                inbound: job_tx,
                outbound: reply_rx,
                handle,
            });
        }

        debug!(target: "ragshard::pool", "Started {} '{name}' workers", config.workers);
        Ok(Self {
            name: name.to_string(),
            config,
            expects_partial: W::SENDS_PARTIAL,
            lanes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.lanes.len()
    }

    pub fn alive_workers(&self) -> usize {
        self.lanes.iter().filter(|l| !l.handle.is_finished()).count()
    }

    /// Hands one item to a worker, blocking while its queue is full.
    pub fn dispatch(&self, item: I) -> Result<(), PoolError> {
        let lane = self.choose_lane()?;
        self.lanes[lane]
            .inbound
            .send(Job::Work(item))
            .map_err(|_| PoolError::Disconnected {
                pool: self.name.clone(),
                worker: lane,
            })
    }

    /// Power of two choices over live workers.
    fn choose_lane(&self) -> Result<usize, PoolError> {
        let n = self.lanes.len();
        let candidates = if n >= 2 {
            rand::seq::index::sample(&mut rand::rng(), n, 2).into_vec()
        } else {
            (0..n).collect()
        };

        let alive = |index: &usize| {
            let finished = self.lanes[*index].handle.is_finished();
            if finished {
                error!(target: "ragshard::pool", "'{}' worker {index} is not alive", self.name);
            }
            !finished
        };

        candidates
            .into_iter()
            .filter(alive)
            .min_by_key(|&i| self.lanes[i].inbound.len())
            .or_else(|| {
                (0..n)
                    .filter(|&i| !self.lanes[i].handle.is_finished())
                    .min_by_key(|&i| self.lanes[i].inbound.len())
            })
            .ok_or_else(|| PoolError::NoLiveWorkers {
                pool: self.name.clone(),
            })
    }

    /// Stops every worker and collects what they return.
    pub fn shutdown(self) -> PoolShutdown<O> {
        let deadline = Instant::now() + self.config.join_timeout;
        let mut partials = Vec::new();
        let mut unexpected_replies = 0;

        for (index, lane) in self.lanes.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            // A dead worker cannot receive; the disconnect shows up below
            if let Err(SendTimeoutError::Timeout(_)) = lane.inbound.send_timeout(Job::Stop, remaining) {
                warn!(
                    target: "ragshard::pool",
                    "Could not queue stop for '{}' worker {index}: queue stayed full",
                    self.name
                );
            }
        }

        for (index, lane) in self.lanes.iter().enumerate() {
            let mut seen_partial = false;
            loop {
                if Instant::now() >= deadline {
                    warn!(
                        target: "ragshard::pool",
                        "Gave up waiting on '{}' worker {index}",
                        self.name
                    );
                    break;
                }
                match lane.outbound.recv_timeout(self.config.poll_timeout) {
                    Ok(Reply::Partial(partial)) => {
                        if !self.expects_partial || seen_partial {
                            unexpected_replies += 1;
                            warn!(
                                target: "ragshard::pool",
                                "Unexpected partial result from '{}' worker {index}",
                                self.name
                            );
                        }
                        seen_partial = true;
                        partials.extend(partial);
                    }
                    Ok(Reply::Stopped) => {
                        if self.expects_partial && !seen_partial {
                            unexpected_replies += 1;
                            warn!(
                                target: "ragshard::pool",
                                "'{}' worker {index} stopped without a partial result",
                                self.name
                            );
                        }
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        info!(
                            target: "ragshard::pool",
                            "Waiting for '{}' worker {index} to stop ({} jobs queued)",
                            self.name,
                            lane.inbound.len()
                        );
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        error!(
                            target: "ragshard::pool",
                            "'{}' worker {index} died before acknowledging stop",
                            self.name
                        );
                        break;
                    }
                }
            }
        }

        let stuck_workers = self.join_until(deadline);
        PoolShutdown {
            partials,
            stuck_workers,
            unexpected_replies,
        }
    }

    fn join_until(self, deadline: Instant) -> usize {
        let mut running: Vec<(usize, JoinHandle<()>)> = self
            .lanes
            .into_iter()
            .enumerate()
            .map(|(index, lane)| (index, lane.handle))
            .collect();
        let mut last_report = Instant::now();

        loop {
            let (finished, pending): (Vec<_>, Vec<_>) =
                running.into_iter().partition(|(_, h)| h.is_finished());
            for (index, handle) in finished {
                if handle.join().is_err() {
                    error!(target: "ragshard::pool", "'{}' worker {index} panicked", self.name);
                }
            }
            running = pending;

            if running.is_empty() {
                return 0;
            }
            if Instant::now() >= deadline {
                warn!(
                    target: "ragshard::pool",
                    "{} '{}' worker(s) still running after {:?}, leaving them behind",
                    running.len(),
                    self.name,
                    self.config.join_timeout
                );
                return running.len();
            }
            if last_report.elapsed() >= self.config.poll_timeout {
                for (index, _) in &running {
                    warn!(target: "ragshard::pool", "'{}' worker {index} has not exited yet", self.name);
                }
                last_report = Instant::now();
            }
            thread::sleep(JOIN_POLL);
        }
    }
}

fn run_worker<W: Worker>(mut worker: W, inbound: Receiver<Job<W::Input>>, outbound: Sender<Reply<W::Output>>) {
    // A closed inbound queue means the pool is gone: stop like on a sentinel
    while let Ok(Job::Work(item)) = inbound.recv() {
        worker.handle(item);
    }

    let partial = worker.finish();
    if W::SENDS_PARTIAL {
        let _ = outbound.send(Reply::Partial(partial));
    }
    let _ = outbound.send(Reply::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Summer {
        total: u64,
    }

    impl Worker for Summer {
        type Input = u64;
        type Output = u64;
        const SENDS_PARTIAL: bool = true;

        fn handle(&mut self, input: u64) {
            self.total += input;
        }

        fn finish(self) -> Option<u64> {
            Some(self.total)
        }
    }

    struct Counter {
        handled: Arc<AtomicUsize>,
    }

    impl Worker for Counter {
        type Input = ();
        type Output = ();

        fn handle(&mut self, _input: ()) {
            self.handled.fetch_add(1, Ordering::SeqCst);
        }

        fn finish(self) -> Option<()> {
            None
        }
    }

    struct Panicker;

    impl Worker for Panicker {
        type Input = ();
        type Output = ();

        fn handle(&mut self, _input: ()) {
            panic!("worker failure");
        }

        fn finish(self) -> Option<()> {
            None
        }
    }

    struct Sleeper;

    impl Worker for Sleeper {
        type Input = Duration;
        type Output = ();

        fn handle(&mut self, input: Duration) {
            thread::sleep(input);
        }

        fn finish(self) -> Option<()> {
            None
        }
    }

    fn quick(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            capacity: 4,
            poll_timeout: Duration::from_millis(50),
            join_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_partials_are_collected() {
        let pool = WorkerPool::spawn("sum", quick(4), |_| Summer { total: 0 }).unwrap();
        for i in 1..=100 {
            pool.dispatch(i).unwrap();
        }

        let shutdown = pool.shutdown();

        assert_eq!(shutdown.partials.len(), 4);
        assert_eq!(shutdown.partials.iter().sum::<u64>(), 5050);
        assert_eq!(shutdown.stuck_workers, 0);
        assert_eq!(shutdown.unexpected_replies, 0);
    }

    #[test]
    fn test_every_worker_acknowledges_stop() {
        let handled = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::spawn("count", quick(10), |_| Counter {
            handled: handled.clone(),
        })
        .unwrap();
        assert_eq!(pool.alive_workers(), 10);
        for _ in 0..50 {
            pool.dispatch(()).unwrap();
        }

        let shutdown = pool.shutdown();

        assert!(shutdown.partials.is_empty());
        assert_eq!(shutdown.stuck_workers, 0);
        assert_eq!(shutdown.unexpected_replies, 0);
        assert_eq!(handled.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_dead_workers_are_skipped() {
        let pool = WorkerPool::spawn("panic", quick(1), |_| Panicker).unwrap();
        pool.dispatch(()).unwrap();
        while pool.alive_workers() > 0 {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(matches!(
            pool.dispatch(()),
            Err(PoolError::NoLiveWorkers { .. })
        ));
        let shutdown = pool.shutdown();
        assert_eq!(shutdown.stuck_workers, 0);
    }

    #[test]
    fn test_hung_worker_does_not_block_shutdown() {
        let config = PoolConfig {
            workers: 1,
            capacity: 1,
            poll_timeout: Duration::from_millis(20),
            join_timeout: Duration::from_millis(200),
        };
        let pool = WorkerPool::spawn("sleep", config, |_| Sleeper).unwrap();
        pool.dispatch(Duration::from_secs(2)).unwrap();

        let started = Instant::now();
        let shutdown = pool.shutdown();

        assert_eq!(shutdown.stuck_workers, 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = WorkerPool::spawn("none", quick(0), |_| Counter {
            handled: Arc::new(AtomicUsize::new(0)),
        });
        assert!(matches!(result, Err(PoolError::Empty)));
    }
}
