//! Session registry: lifecycle of session records
//!
//! Owns create/read/update/delete of sessions and the status state machine.
//! Every write goes through `mutate`, a read-modify-write loop over the
//! store's versioned compare-and-set, so concurrent callbacks and client
//! edits never lose each other's fields.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use whatsflow_core::models::{deserialize_present, NewSession, SessionPatch};
use whatsflow_core::{Result, Session, SessionId, SessionStatus, SessionStore, WhatsflowError};

use crate::subsystems::supervisor::{ConnectorSupervisor, ProcessExit, ProcessInfo};

const MAX_WRITE_ATTEMPTS: usize = 5;

/// Connector-reported state. Absent fields are left alone; an explicit
/// `null` clears `qr_code` or `session_data`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusUpdate {
    pub status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub qr_code: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub session_data: Option<Option<Value>>,
}

impl StatusUpdate {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status.as_str().to_string()),
            ..Self::default()
        }
    }

    fn parsed_status(&self) -> Result<Option<SessionStatus>> {
        self.status.as_deref().map(str::parse).transpose()
    }

    /// Compute the next record. `qr_code` only survives while the result is
    /// `awaiting_qr`.
    fn apply_to(&self, current: &Session, status: Option<SessionStatus>) -> Result<Session> {
        let mut next = current.clone();

        if let Some(status) = status {
            if !current.status.can_transition_to(status) {
                return Err(WhatsflowError::InvalidState(format!(
                    "session {} cannot move from {} to {}",
                    current.id, current.status, status
                )));
            }
            next.status = status;
        }

        if let Some(qr_code) = &self.qr_code {
            next.qr_code = qr_code.clone();
        }
        if let Some(data) = &self.session_data {
            next.session_data = data.as_ref().map(blob_text);
        }

        if next.status != SessionStatus::AwaitingQr {
            if matches!(self.qr_code, Some(Some(_))) {
                return Err(WhatsflowError::InvalidState(format!(
                    "qr_code is only accepted while awaiting_qr, session {} is {}",
                    current.id, next.status
                )));
            }
            next.qr_code = None;
        }
        Ok(next)
    }
}

/// Strings are stored as-is; any other JSON value as its serialized text.
fn blob_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(WhatsflowError::Validation(
            "Session name is required".to_string(),
        ));
    }
    Ok(name.to_string())
}

pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    supervisor: Arc<ConnectorSupervisor>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, supervisor: Arc<ConnectorSupervisor>) -> Self {
        Self { store, supervisor }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<ConnectorSupervisor> {
        &self.supervisor
    }

    /// Persist a new `disconnected` session and launch its connector in the
    /// background. The record is returned without waiting for the launch.
    pub async fn create(&self, name: Option<String>, description: Option<String>) -> Result<Session> {
        let name = validate_name(name.as_deref().unwrap_or_default())?;
        let session = self
            .store
            .insert_session(NewSession { name, description })
            .await?;

        tracing::info!(session_id = session.id, name = %session.name, "Created session");

        let supervisor = self.supervisor.clone();
        let session_id = session.id;
        tokio::spawn(async move {
            match supervisor.spawn(session_id).await {
                Ok(_) => {}
                Err(WhatsflowError::NotFound(_)) => {
                    tracing::debug!(session_id, "Session deleted before its connector launched");
                }
                Err(e) => {
                    tracing::error!(session_id, error = %e, "Failed to launch connector for new session");
                }
            }
        });

        Ok(session)
    }

    pub async fn get(&self, id: SessionId) -> Result<Session> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| WhatsflowError::NotFound(format!("Session {} not found", id)))
    }

    pub async fn list(&self) -> Result<Vec<Session>> {
        self.store.list_sessions().await
    }

    /// Edit name and/or description.
    pub async fn update(&self, id: SessionId, patch: SessionPatch) -> Result<Session> {
        let name = patch.name.as_deref().map(validate_name).transpose()?;
        self.mutate(id, |current| {
            let mut next = current.clone();
            if let Some(name) = &name {
                next.name = name.clone();
            }
            if let Some(description) = &patch.description {
                next.description = description.clone();
            }
            Ok(next)
        })
        .await
    }

    /// Delete the record (webhooks cascade) and stop its connector.
    pub async fn delete(&self, id: SessionId) -> Result<()> {
        if !self.store.delete_session(id).await? {
            return Err(WhatsflowError::NotFound(format!("Session {} not found", id)));
        }
        self.supervisor.terminate(id).await;
        tracing::info!(session_id = id, "Deleted session");
        Ok(())
    }

    /// Reset to `disconnected` and relaunch the connector synchronously, so
    /// launch failures reach the caller.
    pub async fn restart(&self, id: SessionId) -> Result<(Session, ProcessInfo)> {
        let session = self
            .mutate(id, |current| {
                StatusUpdate::status(SessionStatus::Disconnected)
                    .apply_to(current, Some(SessionStatus::Disconnected))
            })
            .await?;
        let process = self.supervisor.spawn(id).await?;
        tracing::info!(session_id = id, generation = process.generation, "Restarted session");
        Ok((session, process))
    }

    /// Apply a connector status report. A report that changes nothing writes
    /// nothing.
    pub async fn apply_status(&self, id: SessionId, update: StatusUpdate) -> Result<Session> {
        let status = update.parsed_status()?;
        let session = self
            .mutate(id, |current| update.apply_to(current, status))
            .await?;
        tracing::debug!(session_id = id, status = %session.status, "Applied status update");
        Ok(session)
    }

    pub async fn mark_disconnected(&self, id: SessionId) -> Result<Session> {
        self.apply_status(id, StatusUpdate::status(SessionStatus::Disconnected))
            .await
    }

    /// Supervisor feedback. Only an unrequested exit of the current process
    /// counts as a crash; the respawn runs in the background after backoff.
    pub async fn handle_connector_exit(&self, exit: ProcessExit) {
        let session_id = exit.session_id;
        if !self.supervisor.is_current_exit(&exit) {
            return;
        }

        match self.mark_disconnected(session_id).await {
            Ok(_) => {}
            Err(WhatsflowError::NotFound(_)) => {
                self.supervisor.terminate(session_id).await;
                return;
            }
            Err(e) => {
                tracing::error!(session_id, error = %e, "Failed to record connector exit");
            }
        }

        let Some(delay) = self.supervisor.restart_delay(session_id) else {
            tracing::warn!(session_id, code = ?exit.code, "Connector left down: auto-restart off or budget spent");
            return;
        };

        tracing::info!(session_id, delay_ms = delay.as_millis() as u64, "Scheduling connector restart");
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match supervisor.respawn(session_id, exit.generation).await {
                Ok(Some(info)) => {
                    tracing::info!(session_id, restarts = info.restarts, "Connector restarted after crash")
                }
                Ok(None) => tracing::debug!(session_id, "Crash restart superseded"),
                Err(e) => tracing::error!(session_id, error = %e, "Crash restart failed"),
            }
        });
    }

    async fn mutate<F>(&self, id: SessionId, mut change: F) -> Result<Session>
    where
        F: FnMut(&Session) -> Result<Session> + Send,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.get(id).await?;
            let next = change(&current)?;
            if next.same_content(&current) {
                return Ok(current);
            }
            match self.store.update_session(&next).await? {
                Some(written) => return Ok(written),
                None => {
                    tracing::debug!(session_id = id, attempt, "Concurrent session write, retrying");
                }
            }
        }
        Err(WhatsflowError::Conflict(format!(
            "Session {} is being modified concurrently, try again",
            id
        )))
    }
}
