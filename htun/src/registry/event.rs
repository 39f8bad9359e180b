use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Connect,
    Disconnect,
    ReceiveComplete,
    ReceiveError,
    Expire,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Connect => "CONNECT",
            EventStatus::Disconnect => "DISCONNECT",
            EventStatus::ReceiveComplete => "RECEIVE_COMPLETE",
            EventStatus::ReceiveError => "RECEIVE_ERROR",
            EventStatus::Expire => "EXPIRE",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a connection. Never changes once recorded.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointEvent {
    connection_id: String,
    status: EventStatus,
    details: String,
    #[serde(serialize_with = "serialize_timestamp")]
    timestamp: SystemTime,
}

impl EndpointEvent {
    pub fn new(connection_id: impl Into<String>, status: EventStatus, details: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            status,
            details: details.into(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

impl fmt::Display for EndpointEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            humantime::format_rfc3339_seconds(self.timestamp),
            self.status,
            self.connection_id
        )?;
        if !self.details.is_empty() {
            write!(f, " {}", self.details)?;
        }
        Ok(())
    }
}

/// Append-only log that keeps the most recent `capacity` events.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    events: Mutex<VecDeque<EndpointEvent>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn push(&self, event: EndpointEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<EndpointEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.iter().cloned().collect()
    }
}

pub(crate) fn serialize_timestamp<S: Serializer>(
    timestamp: &SystemTime,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_rfc3339_seconds(*timestamp))
}
