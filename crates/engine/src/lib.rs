//! Idempotent assessment progression.
//!
//! [`Engine`] exposes the operations transports call. Each write runs through
//! the [`MutationGateway`], which records the response under the client's
//! mutation id in the same snapshot as the write itself, so a retried
//! request replays instead of applying twice. Step validation enforces that
//! only the current step of a funnel can be completed.

pub mod actor;
pub mod answers;
pub mod audit;
pub mod error;
pub mod funnel;
pub mod gateway;
pub mod ledger;
mod operations;
pub mod progression;
pub mod validator;

pub use actor::{Actor, Role};
pub use audit::{AuditEvent, AuditSink, ChannelAuditSink, MutationKind, NoopAuditSink, TracingAuditSink};
pub use error::{EngineError, ErrorCategory};
pub use funnel::{FunnelDefinition, FunnelResolver, FunnelSource, StepDescriptor, StepKind};
pub use gateway::{Mutation, MutationGateway, Replayed};
pub use operations::{Engine, ResumeState, SavedAnswer, StartedAssessment};
pub use validator::StepValidation;
