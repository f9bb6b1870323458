//! The watch poll loop.
//!
//! A [`Watcher`] follows one resource type. It starts from a cursor, a
//! start time, or "now", and after every successful poll it moves its
//! position to the cursor the server handed back. Failed polls leave the
//! position untouched, so the next poll repeats the same request.

use crate::error::ClientError;
use crate::filter::EventFilter;
use crate::transport::WatchTransport;
use chainwatch_types::{CursorType, EventType, WatchEventDetail, WatchEventOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Where a watch begins, and afterwards, where the next poll resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchStart {
    /// Resume after this cursor.
    Cursor(String),
    /// Start from events newer than these unix seconds.
    StartFrom(i64),
    /// Start from the latest event.
    Now,
}

/// Lifecycle of a [`Watcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Created, nothing sent yet.
    Start,
    /// At least one poll issued.
    Polling,
    /// Cancelled or failed fatally; the watcher is done.
    Stopped,
}

/// Exponential delay between empty or failed polls.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    /// A backoff doubling from `initial` up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            next: initial,
        }
    }

    /// Returns the delay to wait now and doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    /// Drops back to the initial delay.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// What a watcher asks for besides its position.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    /// Resource type whose chain is followed.
    pub resource: CursorType,
    /// Detail fields to fetch; empty means all.
    pub fields: Vec<String>,
    /// Event types the server should return; empty means all.
    pub event_types: Vec<EventType>,
    /// Sub resource the server should narrow to (partitioned types only).
    pub sub_resource: String,
    /// Applied to every watched event before it reaches the caller.
    pub filter: EventFilter,
    /// First delay after an idle poll or a retryable error.
    pub backoff_initial: Duration,
    /// Ceiling the doubling delay stops at.
    pub backoff_max: Duration,
}

impl WatchSettings {
    /// Settings for `resource` with no narrowing.
    pub fn new(resource: CursorType) -> Self {
        Self {
            resource,
            fields: Vec::new(),
            event_types: Vec::new(),
            sub_resource: String::new(),
            filter: EventFilter::default(),
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
        }
    }
}

/// Events delivered by one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Resource type the events belong to.
    pub resource: CursorType,
    /// Position after this batch: the cursor of the last watched event,
    /// whether or not the filter kept it.
    pub cursor: String,
    /// Events that passed the filter, in chain order.
    pub events: Vec<WatchEventDetail>,
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Caught up; nothing new was watched.
    Idle,
    /// Events were watched. The batch may be empty after filtering.
    Batch(Batch),
}

/// Sequential poll loop over one resource type.
pub struct Watcher {
    transport: Arc<dyn WatchTransport>,
    settings: WatchSettings,
    state: WatchState,
    position: WatchStart,
    backoff: Backoff,
}

impl Watcher {
    /// A watcher that has not polled yet and will begin at `start`.
    pub fn new(transport: Arc<dyn WatchTransport>, start: WatchStart, settings: WatchSettings) -> Self {
        let backoff = Backoff::new(settings.backoff_initial, settings.backoff_max);
        Self {
            transport,
            settings,
            state: WatchState::Start,
            position: start,
            backoff,
        }
    }

    /// Lifecycle state; `Stopped` once `run` has returned.
    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Where the next poll resumes.
    pub fn position(&self) -> &WatchStart {
        &self.position
    }

    /// Resource type this watcher follows.
    pub fn resource(&self) -> CursorType {
        self.settings.resource
    }

    fn request(&self) -> WatchEventOptions {
        let mut opts = WatchEventOptions::new(self.settings.resource);
        opts.fields.clone_from(&self.settings.fields);
        opts.event_types.clone_from(&self.settings.event_types);
        opts.filter.sub_resource.clone_from(&self.settings.sub_resource);
        match &self.position {
            WatchStart::Cursor(cursor) => opts.cursor.clone_from(cursor),
            WatchStart::StartFrom(sec) => opts.start_from = *sec,
            WatchStart::Now => {}
        }
        opts
    }

    /// Issues one watch request and advances the position on success.
    ///
    /// # Errors
    ///
    /// Returns the transport or server error. The position is unchanged.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, ClientError> {
        if self.state == WatchState::Start {
            self.state = WatchState::Polling;
        }

        let resp = self.transport.watch(&self.request()).await?;

        if !resp.bk_watched {
            if let Some(marker) = resp.bk_events.into_iter().next() {
                if !marker.bk_cursor.is_empty() {
                    self.position = WatchStart::Cursor(marker.bk_cursor);
                }
            }
            return Ok(PollOutcome::Idle);
        }

        let Some(last) = resp.bk_events.last() else {
            return Ok(PollOutcome::Idle);
        };
        let cursor = last.bk_cursor.clone();
        self.position = WatchStart::Cursor(cursor.clone());

        let events = resp
            .bk_events
            .into_iter()
            .filter(|event| self.settings.filter.matches(event))
            .collect();
        Ok(PollOutcome::Batch(Batch {
            resource: self.settings.resource,
            cursor,
            events,
        }))
    }

    /// Polls until `cancel` fires or a fatal error occurs, handing every
    /// non-empty batch to `on_batch`.
    ///
    /// Empty polls and retryable errors back off before the next poll; a
    /// watched batch resets the backoff and polls again at once.
    ///
    /// # Errors
    ///
    /// Returns the first error for which [`ClientError::is_fatal`] holds.
    pub async fn run<F>(&mut self, cancel: &CancellationToken, mut on_batch: F) -> Result<(), ClientError>
    where
        F: FnMut(Batch) + Send,
    {
        let resource = self.settings.resource;
        tracing::debug!(%resource, position = ?self.position, "watch loop started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.poll_once().await {
                Ok(PollOutcome::Batch(batch)) => {
                    self.backoff.reset();
                    tracing::debug!(%resource, events = batch.events.len(), "watched batch");
                    if !batch.events.is_empty() {
                        on_batch(batch);
                    }
                    continue;
                }
                Ok(PollOutcome::Idle) => {}
                Err(e) if e.is_fatal() => {
                    self.state = WatchState::Stopped;
                    tracing::error!(%resource, error = %e, "watch loop stopped");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(%resource, error = %e, "watch poll failed, retrying");
                }
            }

            let delay = self.backoff.next_delay();
            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep(delay) => {}
            }
        }

        self.state = WatchState::Stopped;
        tracing::debug!(%resource, "watch loop cancelled");
        Ok(())
    }
}
