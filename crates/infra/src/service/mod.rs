//! Application-facing authentication service.

pub mod orchestrator;

pub use orchestrator::{
    AuthFlowResult, AuthOrchestrator, AuthenticationFailed, AuthorizationRequest,
    CallbackOutcome, HealthReport, HealthStatus,
};
