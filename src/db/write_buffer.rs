//! Write buffer for async batch inserts
//!
//! Events queue on an unbounded channel, off the accept path, and are
//! inserted in batches of up to 100 or every 250 ms.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::Database;
use crate::events::{Event, EventSink};

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Sender handle for queueing events
pub type WriteSender = mpsc::UnboundedSender<Event>;

/// Spawn the task that drains queued events into `db`. The task ends once
/// every sender is dropped and the pending batch is stored.
pub fn start_write_buffer(db: Arc<Database>) -> (WriteSender, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(drain(Batch::new(db), rx));
    (tx, handle)
}

/// Events waiting for the next insert, plus running totals
struct Batch {
    db: Arc<Database>,
    pending: Vec<Event>,
    stored: usize,
    dropped: usize,
}

impl Batch {
    fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            pending: Vec::with_capacity(BATCH_SIZE),
            stored: 0,
            dropped: 0,
        }
    }

    async fn push(&mut self, event: Event) {
        self.pending.push(event);
        if self.pending.len() >= BATCH_SIZE {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let count = self.pending.len();
        match self.db.batch_insert_events(&self.pending).await {
            Ok(()) => {
                self.stored += count;
                debug!(count, "Stored events");
            }
            Err(e) => {
                // The events were already written to the log by LogSink
                self.dropped += count;
                error!(count, error = %e, "Failed to store events");
            }
        }
        self.pending.clear();
    }
}

async fn drain(mut batch: Batch, mut rx: mpsc::UnboundedReceiver<Event>) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(
        batch_size = BATCH_SIZE,
        interval_ms = FLUSH_INTERVAL.as_millis() as u64,
        "Event store writer started"
    );

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => batch.push(event).await,
                None => break,
            },
            _ = ticker.tick() => batch.flush().await,
        }
    }

    batch.flush().await;
    info!(stored = batch.stored, dropped = batch.dropped, "Event store writer closed");
}

/// [`EventSink`] that queues events for the write buffer
#[derive(Clone)]
pub struct DbSink {
    tx: WriteSender,
}

impl DbSink {
    pub fn new(tx: WriteSender) -> Self {
        Self { tx }
    }
}

impl EventSink for DbSink {
    fn record(&self, event: Event) {
        if self.tx.send(event).is_err() {
            debug!("Write buffer closed, event not stored");
        }
    }
}
