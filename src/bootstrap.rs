//! Whether each account already carries the CDK toolkit stack.

use futures::future::try_join_all;
use serde::Serialize;
use std::fmt;

use crate::aws::ApiError;
use crate::config::AccountId;
use crate::outputs::CloudFormationApi;

pub const TOOLKIT_STACK: &str = "CDKToolkit";
pub const BOOTSTRAP_VERSION_OUTPUT: &str = "BootstrapVersion";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BootstrapState {
    Bootstrapped { version: Option<String> },
    Missing,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapState::Bootstrapped { version: Some(version) } => {
                write!(f, "bootstrapped (version {})", version)
            }
            BootstrapState::Bootstrapped { version: None } => f.write_str("bootstrapped"),
            BootstrapState::Missing => f.write_str("not bootstrapped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapStatus {
    pub label: String,
    pub account: AccountId,
    pub state: BootstrapState,
}

/// One account to probe, with a client already holding its credentials.
pub struct Target<A> {
    pub label: String,
    pub account: AccountId,
    pub api: A,
}

pub async fn probe<A: CloudFormationApi>(target: &Target<A>) -> Result<BootstrapStatus, ApiError> {
    let state = match target.api.stack_outputs(TOOLKIT_STACK).await? {
        Some(outputs) => BootstrapState::Bootstrapped {
            version: outputs.get(BOOTSTRAP_VERSION_OUTPUT).cloned(),
        },
        None => BootstrapState::Missing,
    };

    tracing::info!(
        account = %target.account,
        label = %target.label,
        state = %state,
        "probed bootstrap status"
    );
    return Ok(BootstrapStatus {
        label: target.label.clone(),
        account: target.account.clone(),
        state,
    });
}

/// Probes every target concurrently; results keep the targets' order.
pub async fn probe_all<A: CloudFormationApi>(
    targets: &[Target<A>],
) -> Result<Vec<BootstrapStatus>, ApiError> {
    try_join_all(targets.iter().map(|target| probe(target))).await
}
