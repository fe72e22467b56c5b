use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::aws::ApiError;
use crate::error::TopologyError;
use crate::pipeline::Pipeline;
use crate::trust::TrustPlan;

pub const PROVIDER_ARN_EXPORT: &str = "GitHubOIDCProviderArn";
pub const ROLE_ARN_EXPORT: &str = "GitHubActionsRoleArn";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Export {
    pub name: String,
    pub value: String,
    pub description: String,
}

/// Named values other deployments may import. Names are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Exports(BTreeMap<String, Export>);

impl Exports {
    pub fn add(&mut self, export: Export) -> Result<(), TopologyError> {
        if self.0.contains_key(&export.name) {
            return Err(TopologyError::DuplicateExport(export.name));
        }

        self.0.insert(export.name.clone(), export);
        return Ok(());
    }

    pub fn get(&self, name: &str) -> Option<&Export> {
        self.0.get(name)
    }

    /// Replaces a planned value with the one the deployment produced.
    pub fn resolve(&mut self, name: &str, value: &str) {
        if let Some(export) = self.0.get_mut(name) {
            export.value = value.to_string();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Export> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_map(&self) -> BTreeMap<&str, &str> {
        self.0
            .values()
            .map(|export| (export.name.as_str(), export.value.as_str()))
            .collect()
    }
}

pub fn pipeline_export_name(pipeline: &Pipeline) -> String {
    format!("{}-arn", pipeline.name)
}

pub fn planned(trust: &TrustPlan, pipeline: &Pipeline) -> Result<Exports, TopologyError> {
    let mut exports = Exports::default();

    exports.add(Export {
        name: String::from(PROVIDER_ARN_EXPORT),
        value: trust.expected_provider_arn.clone(),
        description: String::from("ARN of the GitHub Actions OIDC provider"),
    })?;
    exports.add(Export {
        name: String::from(ROLE_ARN_EXPORT),
        value: format!(
            "arn:aws:iam::{}:role/{}",
            pipeline.account_id, trust.role_name
        ),
        description: String::from("ARN of the role GitHub Actions assumes"),
    })?;
    exports.add(Export {
        name: pipeline_export_name(pipeline),
        value: pipeline.arn(),
        description: format!("ARN of pipeline {}", pipeline.name),
    })?;

    return Ok(exports);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingExport {
    pub name: String,
    pub value: String,
    pub exporting_stack_id: String,
}

#[async_trait]
pub trait CloudFormationApi: Send + Sync {
    async fn list_exports(&self) -> Result<Vec<ExistingExport>, ApiError>;

    /// Outputs of a stack keyed by output name, `None` when the stack does
    /// not exist.
    async fn stack_outputs(&self, stack_name: &str)
        -> Result<Option<BTreeMap<String, String>>, ApiError>;
}

/// Fails when another deployment already exports one of our names with a
/// different value. An identical value is a rerun of this deployment.
pub async fn check_conflicts<A: CloudFormationApi>(
    api: &A,
    exports: &Exports,
) -> Result<(), TopologyError> {
    let existing = api
        .list_exports()
        .await
        .map_err(TopologyError::ExportLookup)?;

    for export in exports.iter() {
        let clash = existing
            .iter()
            .find(|e| e.name == export.name && e.value != export.value);
        if let Some(clash) = clash {
            return Err(TopologyError::ExportConflict {
                name: export.name.clone(),
                existing: clash.value.clone(),
                requested: export.value.clone(),
                exporting_stack: clash.exporting_stack_id.clone(),
            });
        }
    }

    tracing::debug!(checked = exports.len(), "no export name conflicts");
    return Ok(());
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::BTreeMap;

    use super::{CloudFormationApi, ExistingExport};
    use crate::aws::ApiError;
    use async_trait::async_trait;

    #[derive(Default)]
    pub struct FakeCloudFormation {
        pub exports: Vec<ExistingExport>,
        pub stacks: BTreeMap<String, BTreeMap<String, String>>,
        pub unreachable: bool,
    }

    #[async_trait]
    impl CloudFormationApi for FakeCloudFormation {
        async fn list_exports(&self) -> Result<Vec<ExistingExport>, ApiError> {
            if self.unreachable {
                return Err(ApiError::UnknownError(String::from("dispatch failure")));
            }
            Ok(self.exports.clone())
        }

        async fn stack_outputs(
            &self,
            stack_name: &str,
        ) -> Result<Option<BTreeMap<String, String>>, ApiError> {
            if self.unreachable {
                return Err(ApiError::UnknownError(String::from("dispatch failure")));
            }
            Ok(self.stacks.get(stack_name).cloned())
        }
    }
}
