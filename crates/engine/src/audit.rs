//! Best-effort audit events for committed and replayed mutations.
//!
//! Sinks must never block the request path or fail it. Persisting the events
//! is someone else's job.

use serde::Serialize;
use tokio::sync::mpsc;

/// Which public mutation produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    StartAssessment,
    SaveAnswer,
    ValidateStep,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::StartAssessment => "start_assessment",
            MutationKind::SaveAnswer => "save_answer",
            MutationKind::ValidateStep => "validate_step",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub kind: MutationKind,
    pub endpoint: String,
    pub mutation_id: Option<String>,
    pub patient_id: String,
    pub assessment_id: Option<String>,
    pub replayed: bool,
    pub at: String,
}

pub trait AuditSink: Send + Sync + 'static {
    fn emit(&self, event: AuditEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _event: AuditEvent) {}
}

/// Writes each event as a structured `tracing` event on the `intake::audit`
/// target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        tracing::info!(
            target: "intake::audit",
            kind = event.kind.as_str(),
            endpoint = %event.endpoint,
            mutation_id = event.mutation_id.as_deref(),
            patient_id = %event.patient_id,
            assessment_id = event.assessment_id.as_deref(),
            replayed = event.replayed,
            at = %event.at,
            "mutation audited"
        );
    }
}

/// Forwards events to a bounded channel. Events are dropped when the
/// receiver lags or is gone.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!(error = %e, "audit event dropped");
        }
    }
}
