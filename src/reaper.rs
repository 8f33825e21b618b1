//! Background cleanup of idle pooled connections.
//!
//! An [`IdleConnectionReaper`] owns one named worker thread running a single-threaded runtime.
//! Every period it asks its target to close connections idle for longer than the configured
//! threshold. Runs never fail the schedule: errors and panics are logged, counted and the next
//! run proceeds. Only [`IdleConnectionReaper::stop`] ends it.

use std::{
    any::Any,
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        mpsc, Arc, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use tokio::sync::watch;

use crate::{
    error::CleanupError,
    metrics::{MetricsSink, CLEANER_FAILURE, CLEANER_TIME},
};

/// Default period between two cleanup runs.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(30_000);

/// Something holding idle connections that can be swept.
pub trait IdleCleanup: Send + Sync + 'static {
    /// Closes connections idle for longer than `idle_timeout`, returning how many were closed.
    fn close_idle_connections(&self, idle_timeout: Duration) -> Result<usize, CleanupError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperState {
    /// Worker thread is starting.
    Created,
    /// Waiting for the next run.
    Scheduled,
    /// A cleanup run is executing.
    Running,
    /// No further runs happen.
    Stopped,
}

impl ReaperState {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => ReaperState::Created,
            1 => ReaperState::Scheduled,
            2 => ReaperState::Running,
            _ => ReaperState::Stopped,
        }
    }
}

/// Run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperStats {
    /// Runs that completed without error.
    pub succeeded: u64,
    /// Runs that failed or panicked.
    pub failed: u64,
    /// Connections closed over all runs.
    pub closed: u64,
}

#[derive(Default)]
struct Shared {
    state: AtomicU8,
    succeeded: AtomicU64,
    failed: AtomicU64,
    closed: AtomicU64,
}

impl Shared {
    fn state(&self) -> ReaperState {
        ReaperState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `from -> to`, failing if the state changed in between (i.e. a stop happened).
    fn transition(&self, from: ReaperState, to: ReaperState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Handle to a periodic idle connection sweep.
///
/// Dropping the handle stops the sweep.
pub struct IdleConnectionReaper {
    name: String,
    period: Duration,
    idle_timeout: Duration,
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
}

impl IdleConnectionReaper {
    /// Starts a sweep of `target` on a thread called `<name>-conn-cleaner`.
    ///
    /// The first run happens one `period` after start. Only a weak reference to the target is
    /// held; once it is gone runs fail with [`CleanupError::PoolDropped`] until stopped.
    pub fn start<T: IdleCleanup>(
        name: &str,
        target: Weak<T>,
        idle_timeout: Duration,
        period: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<io::Result<()>>(1);

        let worker = Worker {
            target,
            idle_timeout,
            period,
            metrics,
            shared: Arc::clone(&shared),
        };

        thread::Builder::new()
            .name(format!("{name}-conn-cleaner"))
            .spawn(move || {
                let rt = match actix_rt::Runtime::new() {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                let _ = ready_tx.send(Ok(()));
                rt.block_on(worker.run(stop_rx));
            })?;

        ready_rx.recv().map_err(|_| {
            io::Error::new(io::ErrorKind::Other, "connection cleaner exited during start")
        })??;

        Ok(Self {
            name: name.to_owned(),
            period,
            idle_timeout,
            shared,
            stop_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn state(&self) -> ReaperState {
        self.shared.state()
    }

    pub fn stats(&self) -> ReaperStats {
        ReaperStats {
            succeeded: self.shared.succeeded.load(Ordering::Acquire),
            failed: self.shared.failed.load(Ordering::Acquire),
            closed: self.shared.closed.load(Ordering::Acquire),
        }
    }

    /// Cancels future runs.
    ///
    /// A run in progress completes; this call does not wait for it.
    pub fn stop(&self) {
        let prev = self.shared.state.swap(ReaperState::Stopped as u8, Ordering::AcqRel);

        if ReaperState::from_u8(prev) != ReaperState::Stopped {
            log::debug!("stopping {}-conn-cleaner", self.name);
            let _ = self.stop_tx.send(true);
        }
    }
}

impl Drop for IdleConnectionReaper {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker<T> {
    target: Weak<T>,
    idle_timeout: Duration,
    period: Duration,
    metrics: Arc<dyn MetricsSink>,
    shared: Arc<Shared>,
}

impl<T: IdleCleanup> Worker<T> {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        if !self
            .shared
            .transition(ReaperState::Created, ReaperState::Scheduled)
        {
            return;
        }

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = actix_rt::time::sleep(self.period) => {}
            }

            if !self
                .shared
                .transition(ReaperState::Scheduled, ReaperState::Running)
            {
                break;
            }

            self.run_once();

            if !self
                .shared
                .transition(ReaperState::Running, ReaperState::Scheduled)
            {
                break;
            }
        }
    }

    fn run_once(&self) {
        let start = Instant::now();

        let res = catch_unwind(AssertUnwindSafe(|| match self.target.upgrade() {
            Some(target) => target.close_idle_connections(self.idle_timeout),
            None => Err(CleanupError::PoolDropped),
        }))
        .unwrap_or_else(|payload| Err(CleanupError::Panicked(panic_message(payload))));

        self.metrics.record_timing(CLEANER_TIME, start.elapsed());

        match res {
            Ok(closed) => {
                self.shared.succeeded.fetch_add(1, Ordering::AcqRel);
                self.shared.closed.fetch_add(closed as u64, Ordering::AcqRel);
            }
            Err(err) => {
                log::error!("cannot clean connections: {err}");
                self.shared.failed.fetch_add(1, Ordering::AcqRel);
                self.metrics.increment_counter(CLEANER_FAILURE);
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
