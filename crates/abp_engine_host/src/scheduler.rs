//! Default [`HostScheduler`]: one thread that fires callbacks in deadline order

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    thread,
    time::Duration,
};

use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tracing::{debug, warn};

use crate::deferred::{CapturedCallback, HostScheduler};

// stands in for delays too large to represent as an Instant
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Fires deferred callbacks on a dedicated thread.
///
/// A callback never fires before its delay elapses. Callbacks that come due
/// together fire in the order they were scheduled, one at a time.
#[derive(Debug)]
pub struct TimerScheduler {
    sender: mpsc::UnboundedSender<CapturedCallback>,
}

impl TimerScheduler {
    /// # Errors
    ///
    /// Fails if the scheduler thread or its runtime cannot be created
    pub fn new() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        thread::Builder::new()
            .name("abp-script-scheduler".into())
            .spawn(move || runtime.block_on(run_timers(receiver)))?;

        Ok(Self { sender })
    }
}

impl HostScheduler for TimerScheduler {
    fn schedule(&self, callback: CapturedCallback) {
        if let Err(rejected) = self.sender.send(callback) {
            debug!(callback_id = %rejected.0.id(), "Scheduler stopped, dropping callback");
        }
    }
}

struct Timer {
    deadline: Instant,
    sequence: u64,
    callback: CapturedCallback,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.sequence).cmp(&(other.deadline, other.sequence))
    }
}

async fn next_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_timers(mut receiver: mpsc::UnboundedReceiver<CapturedCallback>) {
    let mut timers: BinaryHeap<Reverse<Timer>> = BinaryHeap::new();
    let mut sequence = 0u64;

    loop {
        let deadline = timers.peek().map(|Reverse(timer)| timer.deadline);

        tokio::select! {
            received = receiver.recv() => {
                let Some(callback) = received else {
                    break;
                };
                sequence += 1;
                let now = Instant::now();
                timers.push(Reverse(Timer {
                    deadline: now.checked_add(callback.delay()).unwrap_or(now + FAR_FUTURE),
                    sequence,
                    callback,
                }));
            }
            () = next_deadline(deadline) => {
                let now = Instant::now();
                while timers.peek().is_some_and(|Reverse(timer)| timer.deadline <= now) {
                    let Some(Reverse(timer)) = timers.pop() else {
                        break;
                    };
                    let id = timer.callback.id();
                    if let Err(error) = timer.callback.invoke() {
                        warn!(callback_id = %id, %error, "Deferred callback failed");
                    }
                }
            }
        }
    }

    debug!(pending = timers.len(), "Timer scheduler stopped");
}
