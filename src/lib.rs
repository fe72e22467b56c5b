//! Multi-account pipeline bootstrap for AWS.
//!
//! Resolves the account and repository configuration, plans the GitHub
//! Actions OIDC trust, the SSM parameters, the Source → Build → Dev → Test →
//! Prod pipeline and its exports as plain data, then applies the plan with
//! probe-then-write semantics so reruns are safe.

pub mod aws;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod outputs;
pub mod parameters;
pub mod pipeline;
pub mod plan;
pub mod reconcile;
pub mod trust;
pub mod writer;

pub use config::{AccountId, AccountSet, Config, ConfigurationError, RepositoryCoordinate, Resolver};
pub use error::{Error, Result, TopologyError, ValidationError};
pub use parameters::ParameterWriteError;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use plan::{apply, ApplyReport, Plan};
pub use trust::{TrustGrant, TrustSetupError};
