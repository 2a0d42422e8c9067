//! Bounded multi-producer queue drained by a fixed pool of worker threads.
//!
//! Sits between the transport tasks and the filter chain: producers hand
//! requests over without running any pipeline code, and each request is taken
//! by exactly one worker. The buffer is a fixed-capacity array channel, so
//! memory stays bounded under bursts and a full buffer pushes back on
//! producers according to the configured [`WaitStrategy`].

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "gateway-queue-";

/// How producers and idle workers wait: lower latency costs more CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Park the thread until there is work or room.
    #[default]
    Blocking,
    /// Spin on the CPU without yielding.
    BusySpin,
    /// Spin briefly, then yield to the scheduler.
    Yielding,
    /// Spin, yield, then sleep in short intervals.
    Sleeping,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("dispatch queue is shut down")]
    ShutDown,

    #[error("buffer size {0} must be a power of two")]
    InvalidBufferSize(usize),

    #[error("dispatch queue needs at least one worker thread")]
    NoWorkers,

    #[error("dispatch queue has no event listener")]
    MissingListener,

    #[error("dispatch queue already started")]
    AlreadyStarted,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Consumer side of the queue.
pub trait EventListener<E>: Send + Sync + 'static {
    /// Processes one event on a worker thread.
    fn on_event(&self, event: E);

    /// Called with an event the queue could not accept or process.
    fn on_exception(&self, error: DispatchError, event: E);
}

/// Backoff state for the non-blocking strategies.
struct Backoff {
    strategy: WaitStrategy,
    attempts: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 100;
    const YIELD_LIMIT: u32 = 200;
    const SLEEP: Duration = Duration::from_micros(100);

    fn new(strategy: WaitStrategy) -> Self {
        Self {
            strategy,
            attempts: 0,
        }
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn wait(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        match self.strategy {
            WaitStrategy::BusySpin => std::hint::spin_loop(),
            WaitStrategy::Yielding | WaitStrategy::Blocking => {
                if self.attempts < Self::SPIN_LIMIT {
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
            WaitStrategy::Sleeping => {
                if self.attempts < Self::SPIN_LIMIT {
                    std::hint::spin_loop();
                } else if self.attempts < Self::YIELD_LIMIT {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(Self::SLEEP);
                }
            }
        }
    }
}

pub struct ParallelQueueBuilder<E> {
    buffer_size: usize,
    threads: usize,
    name_prefix: String,
    wait_strategy: WaitStrategy,
    listener: Option<Arc<dyn EventListener<E>>>,
}

impl<E: Send + 'static> Default for ParallelQueueBuilder<E> {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
            name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            wait_strategy: WaitStrategy::default(),
            listener: None,
        }
    }
}

impl<E: Send + 'static> ParallelQueueBuilder<E> {
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.wait_strategy = strategy;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn EventListener<E>>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn build(self) -> Result<ParallelQueue<E>, DispatchError> {
        if !self.buffer_size.is_power_of_two() {
            return Err(DispatchError::InvalidBufferSize(self.buffer_size));
        }
        if self.threads == 0 {
            return Err(DispatchError::NoWorkers);
        }
        let listener = self.listener.ok_or(DispatchError::MissingListener)?;
        let (sender, receiver) = crossbeam_channel::bounded(self.buffer_size);
        Ok(ParallelQueue {
            sender: RwLock::new(Some(sender)),
            receiver,
            listener,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            capacity: self.buffer_size,
            threads: self.threads,
            name_prefix: self.name_prefix,
            wait_strategy: self.wait_strategy,
        })
    }
}

pub struct ParallelQueue<E: Send + 'static> {
    sender: RwLock<Option<Sender<E>>>,
    receiver: Receiver<E>,
    listener: Arc<dyn EventListener<E>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shut_down: AtomicBool,
    capacity: usize,
    threads: usize,
    name_prefix: String,
    wait_strategy: WaitStrategy,
}

impl<E: Send + 'static> ParallelQueue<E> {
    pub fn builder() -> ParallelQueueBuilder<E> {
        ParallelQueueBuilder::default()
    }

    /// Spawns the worker threads.
    pub fn start(&self) -> Result<(), DispatchError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DispatchError::ShutDown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(DispatchError::AlreadyStarted);
        }

        let mut workers = self.workers.lock();
        for index in 0..self.threads {
            let receiver = self.receiver.clone();
            let listener = self.listener.clone();
            let wait_strategy = self.wait_strategy;
            let handle = std::thread::Builder::new()
                .name(format!("{}{index}", self.name_prefix))
                .spawn(move || run_worker(receiver, listener, wait_strategy))
                .map_err(|e| DispatchError::Spawn(e.to_string()))?;
            workers.push(handle);
        }
        tracing::info!(
            threads = self.threads,
            buffer_size = self.capacity,
            wait_strategy = ?self.wait_strategy,
            "Dispatch queue started"
        );
        Ok(())
    }

    fn sender(&self) -> Option<Sender<E>> {
        self.sender.read().clone()
    }

    /// Enqueues an event, waiting for room if the buffer is full. After
    /// shutdown the listener's `on_exception` is called with the event
    /// before this returns.
    pub fn submit(&self, event: E) {
        let Some(sender) = self.sender().filter(|_| !self.is_shut_down()) else {
            self.listener.on_exception(DispatchError::ShutDown, event);
            return;
        };

        if self.wait_strategy == WaitStrategy::Blocking {
            if let Err(rejected) = sender.send(event) {
                self.listener
                    .on_exception(DispatchError::ShutDown, rejected.into_inner());
            }
            return;
        }

        let mut backoff = Backoff::new(self.wait_strategy);
        let mut event = event;
        loop {
            match sender.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    event = returned;
                    backoff.wait();
                }
                Err(TrySendError::Disconnected(returned)) => {
                    self.listener.on_exception(DispatchError::ShutDown, returned);
                    return;
                }
            }
        }
    }

    pub fn submit_batch(&self, events: impl IntoIterator<Item = E>) {
        for event in events {
            self.submit(event);
        }
    }

    /// Enqueues without waiting. A full buffer or a shut-down queue hands
    /// the event back.
    pub fn try_submit(&self, event: E) -> Result<(), E> {
        if self.is_shut_down() {
            return Err(event);
        }
        let Some(sender) = self.sender() else {
            return Err(event);
        };
        sender.try_send(event).map_err(TrySendError::into_inner)
    }

    /// Enqueues events in order until one does not fit; the events that
    /// were not enqueued are handed back.
    pub fn try_submit_batch(&self, events: Vec<E>) -> Result<(), Vec<E>> {
        let mut events = events.into_iter();
        while let Some(event) = events.next() {
            if let Err(rejected) = self.try_submit(event) {
                let mut rest = vec![rejected];
                rest.extend(events);
                return Err(rest);
            }
        }
        Ok(())
    }

    /// Stops accepting events, lets the workers drain what is buffered and
    /// joins them. Events left over because the queue never started are
    /// reported to the listener.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(pending = self.len(), "Dispatch queue shutting down");

        // Dropping the last sender disconnects the channel once it is empty.
        self.sender.write().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("Dispatch worker exited abnormally");
            }
        }

        while let Ok(event) = self.receiver.try_recv() {
            self.listener.on_exception(DispatchError::ShutDown, event);
        }
        tracing::info!("Dispatch queue stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Events currently buffered.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<E: Send + 'static> Drop for ParallelQueue<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<E: Send + 'static>(
    receiver: Receiver<E>,
    listener: Arc<dyn EventListener<E>>,
    wait_strategy: WaitStrategy,
) {
    let handle = |event: E| {
        if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
            tracing::error!("Event listener panicked; worker continues");
        }
    };

    if wait_strategy == WaitStrategy::Blocking {
        while let Ok(event) = receiver.recv() {
            handle(event);
        }
        return;
    }

    let mut backoff = Backoff::new(wait_strategy);
    loop {
        match receiver.try_recv() {
            Ok(event) => {
                backoff.reset();
                handle(event);
            }
            Err(TryRecvError::Empty) => backoff.wait(),
            Err(TryRecvError::Disconnected) => break,
        }
    }
}
