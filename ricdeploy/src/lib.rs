//! # ricdeploy
//!
//! Idempotent deployment orchestration for xApps on a near-RT RIC platform.
//!
//! A deployment is an ordered pipeline of stages. Every stage either
//! provisions something that is checked before it is created, or verifies
//! something the previous stages produced:
//!
//! - **Port reclaiming**: fixed host ports are freed by signalling their
//!   owner, gracefully first, after the operator agrees
//! - **Idempotent resources**: networks, containers, images and service
//!   objects are created only when missing
//! - **Checksum verification**: the configuration artifact is compared after
//!   copying and after download
//! - **Health gates**: bounded polling of readiness conditions
//! - **Scoped helpers**: port-forwards and log followers that never outlive
//!   the session that started them
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ricdeploy::prelude::*;
//!
//! let config = DeployConfig::load(Path::new("ricdeploy.toml"))?;
//! let confirmer = Confirmer::console(config.prompt);
//! let plan = DeployPlan::new(config.clone(), Collaborators::system(&config, confirmer)?);
//!
//! let mut ctx = plan.context();
//! let report = plan.deploy().run(&mut ctx).await;
//! assert!(report.is_completed());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod checksum;
pub mod config;
pub mod context;
pub mod core;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod exec;
pub mod observability;
pub mod operator;
pub mod pipeline;
pub mod platform;
pub mod process;
pub mod resources;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checksum::{ChecksumOutcome, ChecksumVerifier, DigestAlgorithm};
    pub use crate::config::{DeployConfig, XappDescriptor};
    pub use crate::context::DeploymentContext;
    pub use crate::core::{FailurePolicy, StageStatus};
    pub use crate::deploy::{collect_status, Collaborators, DeployPlan, LogSession, StatusReport};
    pub use crate::errors::{DeployError, ErrorClass, ErrorInfo};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::exec::{CommandOutput, CommandRunner, CommandSpec, SystemCommandRunner};
    pub use crate::observability::{init_tracing, Diagnostics, LogFormat};
    pub use crate::operator::{Answer, Confirmer, Operator, PromptMode, PromptPolicy};
    pub use crate::pipeline::{
        Condition, GateOutcome, HealthGate, HealthProbe, PipelineOutcome, PipelineReport,
        PipelineRunner, Stage, StageAction,
    };
    pub use crate::platform::{ChartRegistry, Cluster, HttpChartRegistry};
    pub use crate::process::{
        BackgroundSession, PortReclaimer, PortReservation, ProcessTable, ReclaimOutcome,
    };
    pub use crate::resources::{
        EnsureOutcome, IdempotentResourceEnsurer, ManagedResource, ResourceBackend, ResourceKind,
    };
}
