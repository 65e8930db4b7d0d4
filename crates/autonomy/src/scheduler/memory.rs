//! In-process recurring queue.

use super::queue::{QueueCounts, RecurringEntry, RecurringOptions, RecurringQueue};
use crate::error::QueueError;
use crate::types::Timestamp;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One firing of a recurring entry, handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedJob {
    /// Unique per firing.
    pub id: String,
    /// Queue the job came from.
    pub queue: String,
    /// Job name of the recurring entry.
    pub name: String,
    pub payload: Value,
}

struct Slot {
    entry: RecurringEntry,
    payload: Value,
    interval_ms: u64,
    next_fire: Timestamp,
}

#[derive(Default)]
struct State {
    slots: Vec<Slot>,
    waiting: VecDeque<DispatchedJob>,
    active: HashMap<String, DispatchedJob>,
    completed: u64,
    failed: u64,
    next_id: u64,
    closed: bool,
    fail_next_add: Option<QueueError>,
    fail_removals: Option<QueueError>,
    fail_close: Option<QueueError>,
}

/// A [`RecurringQueue`] held entirely in memory.
///
/// Firings are driven explicitly with [`InMemoryQueue::poll_due`], which makes
/// the queue usable as a test double and as a single-process dispatcher.
pub struct InMemoryQueue {
    name: String,
    keyed_removal: bool,
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keyed_removal: true,
            state: Mutex::new(State::default()),
        }
    }

    /// Report no keyed-removal support, forcing list-and-match tear-down.
    pub fn scan_only(mut self) -> Self {
        self.keyed_removal = false;
        self
    }

    /// Fail the next `add_recurring` call with `error`.
    pub fn fail_next_add(&self, error: QueueError) {
        self.state().fail_next_add = Some(error);
    }

    /// Fail every removal with `error` until cleared with `None`.
    pub fn fail_removals(&self, error: Option<QueueError>) {
        self.state().fail_removals = error;
    }

    /// Fail the next `close` call with `error`.
    pub fn fail_close(&self, error: QueueError) {
        self.state().fail_close = Some(error);
    }

    /// Enqueue every firing due at `now`, then hand all waiting jobs out as
    /// active.
    pub fn poll_due(&self, now: Timestamp) -> Vec<DispatchedJob> {
        let mut state = self.state();
        if state.closed {
            return Vec::new();
        }
        self.enqueue_due(&mut state, now);

        let jobs: Vec<_> = state.waiting.drain(..).collect();
        for job in &jobs {
            state.active.insert(job.id.clone(), job.clone());
        }
        jobs
    }

    /// Mark an active job completed. Returns false for unknown ids.
    pub fn complete(&self, job_id: &str) -> bool {
        let mut state = self.state();
        if state.active.remove(job_id).is_some() {
            state.completed += 1;
            true
        } else {
            false
        }
    }

    /// Mark an active job failed. Returns false for unknown ids.
    pub fn fail(&self, job_id: &str, reason: &str) -> bool {
        let mut state = self.state();
        if state.active.remove(job_id).is_some() {
            state.failed += 1;
            tracing::debug!(queue = %self.name, job_id, reason, "Job failed");
            true
        } else {
            false
        }
    }

    /// Number of recurring entries defined.
    pub fn recurring_len(&self) -> usize {
        self.state().slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn enqueue_due(&self, state: &mut State, now: Timestamp) {
        let mut fired = Vec::new();
        for slot in state.slots.iter_mut() {
            if slot.next_fire > now {
                continue;
            }
            fired.push((slot.entry.name.clone(), slot.payload.clone()));
            // Missed firings collapse into one.
            while slot.next_fire <= now {
                slot.next_fire = slot.next_fire.plus_millis(slot.interval_ms.max(1));
            }
        }
        for (name, payload) in fired {
            state.next_id += 1;
            let id = format!("{}:{}:{}", self.name, name, state.next_id);
            state.waiting.push_back(DispatchedJob {
                id,
                queue: self.name.clone(),
                name,
                payload,
            });
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_state(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        let state = self.state();
        if state.closed {
            return Err(QueueError::Closed(self.name.clone()));
        }
        Ok(state)
    }
}

#[async_trait]
impl RecurringQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add_recurring(
        &self,
        job_name: &str,
        payload: Value,
        options: RecurringOptions,
    ) -> Result<RecurringEntry, QueueError> {
        let mut state = self.open_state()?;
        if let Some(err) = state.fail_next_add.take() {
            return Err(err);
        }

        state.next_id += 1;
        let entry = RecurringEntry {
            key: options.dedupe_key,
            id: format!("repeat:{}:{}", self.name, state.next_id),
            name: job_name.to_string(),
        };
        state.slots.push(Slot {
            entry: entry.clone(),
            payload,
            interval_ms: options.interval.as_millis() as u64,
            next_fire: Timestamp::now().plus_millis(options.initial_delay.as_millis() as u64),
        });
        Ok(entry)
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringEntry>, QueueError> {
        let state = self.open_state()?;
        Ok(state.slots.iter().map(|slot| slot.entry.clone()).collect())
    }

    async fn remove_recurring_by_key(&self, key: &str) -> Result<bool, QueueError> {
        let mut state = self.open_state()?;
        if let Some(err) = state.fail_removals.clone() {
            return Err(err);
        }
        let before = state.slots.len();
        state.slots.retain(|slot| slot.entry.key != key);
        Ok(state.slots.len() != before)
    }

    fn supports_keyed_removal(&self) -> bool {
        self.keyed_removal
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.open_state()?;
        Ok(QueueCounts {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            completed: state.completed,
            failed: state.failed,
        })
    }

    async fn close(&self) -> Result<(), QueueError> {
        let mut state = self.state();
        if let Some(err) = state.fail_close.take() {
            return Err(err);
        }
        state.closed = true;
        Ok(())
    }
}
