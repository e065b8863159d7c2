//! Scheduler primitive: "run this job after N seconds", fire-and-forget,
//! at-least-once. The tokio implementation sleeps in a spawned task and
//! pushes the due job onto a channel drained by the tick dispatcher; the
//! manual implementation just records requests so tests can pump them.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, Duration};

use crate::logging::{log, obj, v_num, v_str, Domain, Level};

/// Job name carried by every recompute invocation.
pub const TICK_JOB: &str = "asset_tick";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickJob {
    pub asset_id: String,
}

#[derive(Debug, Clone)]
pub struct DueJob {
    pub job: String,
    pub payload: TickJob,
}

pub trait Scheduler: Send + Sync {
    fn schedule(&self, job: &str, delay_secs: u64, payload: TickJob);
}

// ---------------------------------------------------------------------------
// Tokio-backed scheduler
// ---------------------------------------------------------------------------

pub struct TokioScheduler {
    tx: UnboundedSender<DueJob>,
}

impl TokioScheduler {
    /// Returns the scheduler plus the receiver the dispatcher drains.
    pub fn new() -> (Self, UnboundedReceiver<DueJob>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, job: &str, delay_secs: u64, payload: TickJob) {
        let tx = self.tx.clone();
        let job = job.to_string();
        log(
            Level::Debug,
            Domain::Tick,
            "armed",
            obj(&[
                ("job", v_str(&job)),
                ("asset_id", v_str(&payload.asset_id)),
                ("delay_secs", v_num(delay_secs as f64)),
            ]),
        );
        tokio::spawn(async move {
            sleep(Duration::from_secs(delay_secs)).await;
            // Receiver gone means the service is shutting down; nothing to do.
            let _ = tx.send(DueJob { job, payload });
        });
    }
}

// ---------------------------------------------------------------------------
// Capture-only scheduler for tests
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ManualScheduler {
    requests: Mutex<Vec<(String, u64, TickJob)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Take every recorded request, oldest first.
    pub fn drain(&self) -> Vec<(String, u64, TickJob)> {
        self.requests.lock().map(|mut r| r.drain(..).collect()).unwrap_or_default()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, job: &str, delay_secs: u64, payload: TickJob) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((job.to_string(), delay_secs, payload));
        }
    }
}
