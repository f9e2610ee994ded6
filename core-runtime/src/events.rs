//! # Event Bus System
//!
//! Typed, in-process notifications about job lifecycle, library mirroring and
//! maintenance, published over `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! - **Event Types**: [`JobEvent`], [`LibraryEvent`], [`MaintenanceEvent`],
//!   wrapped in [`CoreEvent`]
//! - **EventBus**: Cloneable broadcast handle shared by all components
//! - **EventStream**: Receiver wrapper with an optional predicate
//!
//! Emission is fire-and-forget. Components call [`EventBus::publish`], which
//! ignores the "no subscribers" case; nothing in the engine depends on an event
//! being observed.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, JobEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(100);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(CoreEvent::Job(JobEvent::Created {
//!     job_id: "job-1".to_string(),
//!     job_type: "full_sync".to_string(),
//!     owner_id: Some(7),
//! }));
//!
//! let event = rx.recv().await.unwrap();
//! assert!(matches!(event, CoreEvent::Job(JobEvent::Created { .. })));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events; keep reading.
//! - **`RecvError::Closed`**: every sender is gone; treat as shutdown.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Job(JobEvent),
    Library(LibraryEvent),
    Maintenance(MaintenanceEvent),
}

impl CoreEvent {
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Job(e) => e.description(),
            CoreEvent::Library(e) => e.description(),
            CoreEvent::Maintenance(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Job(JobEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Job(JobEvent::Cancelled { .. }) => EventSeverity::Warning,
            CoreEvent::Job(JobEvent::Resumed { .. }) => EventSeverity::Warning,
            CoreEvent::Maintenance(MaintenanceEvent::CleanupCompleted { failed_steps, .. })
                if !failed_steps.is_empty() =>
            {
                EventSeverity::Warning
            }
            CoreEvent::Job(JobEvent::Progress { .. }) => EventSeverity::Debug,
            CoreEvent::Library(LibraryEvent::ItemMatched { .. }) => EventSeverity::Debug,
            _ => EventSeverity::Info,
        }
    }

    /// Job id carried by the event, if it belongs to a job.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            CoreEvent::Job(e) => Some(e.job_id()),
            CoreEvent::Library(LibraryEvent::LibraryDiscovered { job_id, .. })
            | CoreEvent::Library(LibraryEvent::ItemsSynced { job_id, .. }) => Some(job_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Job Events
// ============================================================================

/// Job lifecycle notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum JobEvent {
    /// Job row persisted as pending.
    Created {
        job_id: String,
        job_type: String,
        owner_id: Option<i64>,
    },
    /// A worker claimed the job.
    Started { job_id: String, worker_id: usize },
    Progress {
        job_id: String,
        progress: u8,
        step: String,
        processed: u64,
        total: u64,
    },
    Completed {
        job_id: String,
        successful: u64,
        failed: u64,
        duration_secs: u64,
    },
    Failed { job_id: String, message: String },
    Cancelled { job_id: String },
    /// Left pending or running by a previous process and re-enqueued.
    Resumed { job_id: String, previous_status: String },
}

impl JobEvent {
    fn description(&self) -> &str {
        match self {
            JobEvent::Created { .. } => "Job created",
            JobEvent::Started { .. } => "Job started",
            JobEvent::Progress { .. } => "Job in progress",
            JobEvent::Completed { .. } => "Job completed",
            JobEvent::Failed { .. } => "Job failed",
            JobEvent::Cancelled { .. } => "Job cancelled",
            JobEvent::Resumed { .. } => "Job resumed after restart",
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Created { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id }
            | JobEvent::Resumed { job_id, .. } => job_id,
        }
    }
}

// ============================================================================
// Library Events
// ============================================================================

/// Changes to the mirrored external catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum LibraryEvent {
    LibraryDiscovered {
        job_id: String,
        server_id: String,
        library_key: String,
        title: String,
    },
    ItemsSynced {
        job_id: String,
        library_id: i64,
        upserted: u64,
        failed: u64,
    },
    ItemMatched {
        item_id: i64,
        metadata_id: i64,
        strategy: String,
    },
}

impl LibraryEvent {
    fn description(&self) -> &str {
        match self {
            LibraryEvent::LibraryDiscovered { .. } => "Library discovered",
            LibraryEvent::ItemsSynced { .. } => "Library items synced",
            LibraryEvent::ItemMatched { .. } => "Item matched to metadata",
        }
    }
}

// ============================================================================
// Maintenance Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum MaintenanceEvent {
    CleanupCompleted {
        /// Rows changed across all steps.
        changes: u64,
        /// Names of steps that returned an error.
        failed_steps: Vec<String>,
    },
}

impl MaintenanceEvent {
    fn description(&self) -> &str {
        match self {
            MaintenanceEvent::CleanupCompleted { .. } => "Cleanup pass completed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus; `capacity` is the per-subscriber backlog after
    /// which slow subscribers receive `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event, failing when nobody is subscribed.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Publishes an event, ignoring the absence of subscribers.
    pub fn publish(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A receiver that skips events not matching a predicate.
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Only events belonging to one job.
    pub fn for_job(receiver: Receiver<CoreEvent>, job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        Self::new(receiver).filter(move |event| event.job_id() == Some(job_id.as_str()))
    }

    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}
