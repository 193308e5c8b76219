//! Admission-controlled table of active streaming sessions.
//!
//! Every mutation and every snapshot goes through one table-wide lock. The
//! transport only ever holds a session id and calls back into the manager.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use beacon_core::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Maximum connections ({max}) reached")]
    Capacity { max: usize },
    #[error("Session already active: {0}")]
    Duplicate(SessionId),
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session is closing: {0}")]
    Closed(SessionId),
    #[error("Inbound queue full for session {0}")]
    QueueFull(SessionId),
}

/// Bookkeeping for one streaming session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub messages_sent: u64,
    pub heartbeats: u64,
}

impl SessionRecord {
    fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_heartbeat_at: now,
            messages_sent: 0,
            heartbeats: 0,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        (Utc::now() - self.created_at).num_milliseconds() as f64 / 1000.0
    }
}

struct Entry {
    record: SessionRecord,
    inbox: mpsc::Sender<String>,
    closing: bool,
}

pub struct SessionManager {
    max_sessions: usize,
    table: Mutex<HashMap<SessionId, Entry>>,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Admit a session. `inbox` receives frames posted to the side-channel.
    pub fn add(&self, id: SessionId, inbox: mpsc::Sender<String>) -> Result<(), SessionError> {
        let mut table = self.table.lock();
        if table.len() >= self.max_sessions {
            warn!(session_id = %id, max = self.max_sessions, "session rejected at capacity");
            return Err(SessionError::Capacity { max: self.max_sessions });
        }
        if table.contains_key(&id) {
            return Err(SessionError::Duplicate(id));
        }
        info!(session_id = %id, active = table.len() + 1, "session added");
        table.insert(
            id.clone(),
            Entry {
                record: SessionRecord::new(id),
                inbox,
                closing: false,
            },
        );
        Ok(())
    }

    /// Drop a session. Absent ids are a no-op.
    pub fn remove(&self, id: &SessionId) -> Option<SessionRecord> {
        let entry = self.table.lock().remove(id)?;
        let record = entry.record;
        info!(
            session_id = %id,
            duration_secs = record.duration_secs(),
            messages_sent = record.messages_sent,
            heartbeats = record.heartbeats,
            "session removed"
        );
        Some(record)
    }

    pub fn touch_heartbeat(&self, id: &SessionId) -> bool {
        self.with_record(id, |r| {
            let now = Utc::now();
            if now > r.last_heartbeat_at {
                r.last_heartbeat_at = now;
            }
            r.heartbeats += 1;
        })
    }

    pub fn increment_messages(&self, id: &SessionId) -> bool {
        self.with_record(id, |r| r.messages_sent += 1)
    }

    /// Refuse further inbound frames while teardown runs.
    pub fn mark_closing(&self, id: &SessionId) {
        if let Some(entry) = self.table.lock().get_mut(id) {
            entry.closing = true;
        }
    }

    /// Queue a raw protocol frame for the session's message pump.
    pub fn deliver(&self, id: &SessionId, raw: String) -> Result<(), SessionError> {
        let table = self.table.lock();
        let entry = table.get(id).ok_or_else(|| SessionError::NotFound(id.clone()))?;
        if entry.closing {
            return Err(SessionError::Closed(id.clone()));
        }
        match entry.inbox.try_send(raw) {
            Ok(()) => {
                debug!(session_id = %id, "frame queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(session_id = %id, msg_len = msg.len(), "inbound queue full, dropping frame");
                Err(SessionError::QueueFull(id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::Closed(id.clone())),
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionRecord> {
        self.table.lock().get(id).map(|e| e.record.clone())
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.table.lock().contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.table.lock().len()
    }

    /// Copy of every active record, oldest first.
    pub fn snapshot(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> =
            self.table.lock().values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.as_str().cmp(b.id.as_str())));
        records
    }

    fn with_record(&self, id: &SessionId, f: impl FnOnce(&mut SessionRecord)) -> bool {
        match self.table.lock().get_mut(id) {
            Some(entry) => {
                f(&mut entry.record);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbox() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(4)
    }

    #[test]
    fn admission_respects_capacity() {
        let mgr = SessionManager::new(2);
        let (tx, _rx) = inbox();
        mgr.add(SessionId::from_raw("a"), tx.clone()).unwrap();
        mgr.add(SessionId::from_raw("b"), tx.clone()).unwrap();

        let err = mgr.add(SessionId::from_raw("c"), tx.clone()).unwrap_err();
        assert_eq!(err, SessionError::Capacity { max: 2 });
        assert_eq!(err.to_string(), "Maximum connections (2) reached");

        assert!(mgr.remove(&SessionId::from_raw("a")).is_some());
        mgr.add(SessionId::from_raw("c"), tx).unwrap();
        assert_eq!(mgr.count(), 2);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mgr = SessionManager::new(4);
        let (tx, _rx) = inbox();
        mgr.add(SessionId::from_raw("a"), tx.clone()).unwrap();
        assert!(matches!(
            mgr.add(SessionId::from_raw("a"), tx),
            Err(SessionError::Duplicate(_))
        ));
        assert_eq!(mgr.count(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let mgr = SessionManager::new(1);
        let (tx, _rx) = inbox();
        let id = SessionId::from_raw("a");
        mgr.add(id.clone(), tx).unwrap();
        mgr.increment_messages(&id);
        mgr.increment_messages(&id);

        let record = mgr.remove(&id).unwrap();
        assert_eq!(record.messages_sent, 2);
        assert!(mgr.remove(&id).is_none());
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn heartbeat_advances_monotonically() {
        let mgr = SessionManager::new(1);
        let (tx, _rx) = inbox();
        let id = SessionId::from_raw("a");
        mgr.add(id.clone(), tx).unwrap();

        let before = mgr.get(&id).unwrap().last_heartbeat_at;
        assert!(mgr.touch_heartbeat(&id));
        assert!(mgr.touch_heartbeat(&id));
        let after = mgr.get(&id).unwrap();
        assert!(after.last_heartbeat_at >= before);
        assert_eq!(after.heartbeats, 2);

        assert!(!mgr.touch_heartbeat(&SessionId::from_raw("missing")));
        assert!(!mgr.increment_messages(&SessionId::from_raw("missing")));
    }

    #[tokio::test]
    async fn deliver_routes_to_inbox() {
        let mgr = SessionManager::new(1);
        let (tx, mut rx) = inbox();
        let id = SessionId::from_raw("a");
        mgr.add(id.clone(), tx).unwrap();

        mgr.deliver(&id, "frame".into()).unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("frame"));

        assert!(matches!(
            mgr.deliver(&SessionId::from_raw("b"), "x".into()),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn deliver_reports_full_and_closing() {
        let mgr = SessionManager::new(1);
        let (tx, _rx) = mpsc::channel(1);
        let id = SessionId::from_raw("a");
        mgr.add(id.clone(), tx).unwrap();

        mgr.deliver(&id, "1".into()).unwrap();
        assert!(matches!(mgr.deliver(&id, "2".into()), Err(SessionError::QueueFull(_))));

        mgr.mark_closing(&id);
        assert!(matches!(mgr.deliver(&id, "3".into()), Err(SessionError::Closed(_))));
    }

    #[test]
    fn deliver_to_dropped_inbox_is_closed() {
        let mgr = SessionManager::new(1);
        let (tx, rx) = inbox();
        let id = SessionId::from_raw("a");
        mgr.add(id.clone(), tx).unwrap();
        drop(rx);
        assert!(matches!(mgr.deliver(&id, "x".into()), Err(SessionError::Closed(_))));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let mgr = SessionManager::new(4);
        let (tx, _rx) = inbox();
        mgr.add(SessionId::from_raw("a"), tx.clone()).unwrap();
        mgr.add(SessionId::from_raw("b"), tx).unwrap();

        let snap = mgr.snapshot();
        assert_eq!(snap.len(), 2);
        mgr.remove(&SessionId::from_raw("a"));
        assert_eq!(snap.len(), 2);
        assert_eq!(mgr.snapshot().len(), 1);
    }
}
