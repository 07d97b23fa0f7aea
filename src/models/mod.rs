//! Domain entities shared across the runner.

pub mod approval;
pub mod policy;
pub mod session;

pub use approval::{ApprovalCategory, ApprovalRequest, ApprovalStatus, RiskTier};
pub use policy::{CompiledPolicy, NetworkMode, PolicySpec};
pub use session::{
    BillingContext, CheckoutSpec, RepoRef, Session, SessionConfig, SessionState, TaskSpec,
    UsageMetrics,
};
