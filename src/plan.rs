//! Everything a run will touch, assembled and checked before the first AWS
//! call, plus the sequential apply of that plan.

use serde::Serialize;

use crate::config::{AccountSet, Config, RepositoryCoordinate};
use crate::error::Result;
use crate::outputs::{self, CloudFormationApi, Exports, PROVIDER_ARN_EXPORT, ROLE_ARN_EXPORT};
use crate::parameters::{self, Parameter, ParameterApi};
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::reconcile::Outcome;
use crate::trust::{self, IdentityApi, TrustOutcome, TrustPlan};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub accounts: AccountSet,
    pub repository: RepositoryCoordinate,
    pub trust: TrustPlan,
    pub parameters: Vec<Parameter>,
    pub pipeline: Pipeline,
    pub exports: Exports,
}

impl Plan {
    pub fn build(config: &Config) -> Result<Plan> {
        let pipeline = PipelineBuilder::new(&config.accounts, &config.repository).build()?;
        pipeline.verify()?;

        let trust = TrustPlan::new(config)?;
        let exports = outputs::planned(&trust, &pipeline)?;

        tracing::debug!(
            pipeline = %pipeline.name,
            stages = pipeline.stages.len(),
            exports = exports.len(),
            "plan built"
        );
        return Ok(Plan {
            accounts: config.accounts.clone(),
            repository: config.repository.clone(),
            trust,
            parameters: parameters::desired(config),
            pipeline,
            exports,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReport {
    pub trust: TrustOutcome,
    pub parameters: Vec<Outcome<String>>,
    pub exports: Exports,
}

/// Export conflicts are checked before the first write, then trust,
/// parameters and exports are applied in that order. The first failure
/// ends the run.
pub async fn apply<I, P, C>(
    plan: &Plan,
    identity: &I,
    parameter_store: &P,
    cloudformation: &C,
) -> Result<ApplyReport>
where
    I: IdentityApi,
    P: ParameterApi,
    C: CloudFormationApi,
{
    let existing = trust::existing(identity, &plan.trust).await?;
    let mut expected = plan.exports.clone();
    if let Some(arn) = &existing.provider_arn {
        expected.resolve(PROVIDER_ARN_EXPORT, arn);
    }
    if let Some(arn) = &existing.role_arn {
        expected.resolve(ROLE_ARN_EXPORT, arn);
    }

    tracing::info!(count = expected.len(), "checking exports before writing");
    outputs::check_conflicts(cloudformation, &expected).await?;

    tracing::info!(role = %plan.trust.role_name, "setting up GitHub OIDC trust");
    let trust = trust::setup(identity, &plan.trust).await?;

    tracing::info!(count = plan.parameters.len(), "writing parameters");
    let parameters = parameters::write_all(parameter_store, &plan.parameters).await?;

    let mut exports = plan.exports.clone();
    exports.resolve(PROVIDER_ARN_EXPORT, trust.provider_arn());
    exports.resolve(ROLE_ARN_EXPORT, trust.role_arn());

    if exports != expected {
        tracing::info!(count = exports.len(), "rechecking exports");
        outputs::check_conflicts(cloudformation, &exports).await?;
    }

    return Ok(ApplyReport {
        trust,
        parameters,
        exports,
    });
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::{AccountId, SecretString};
    use crate::error::{Error, TopologyError, ValidationError};
    use crate::outputs::fake::FakeCloudFormation;
    use crate::outputs::ExistingExport;
    use crate::parameters::fake::FakeParameters;
    use crate::trust::fake::FakeIdentity;

    fn config() -> Config {
        Config {
            accounts: AccountSet::new(
                AccountId::parse("pipeline", "000000000000").unwrap(),
                AccountId::parse("dev", "111111111111").unwrap(),
                AccountId::parse("test", "222222222222").unwrap(),
                AccountId::parse("prod", "333333333333").unwrap(),
                "us-east-1",
            )
            .unwrap(),
            repository: RepositoryCoordinate::new("test-org", "test-repo", "main"),
            github_token: Some(SecretString::new("ghp_secret")),
            role_name: String::from("GitHubActionsRole"),
            profiles: BTreeMap::new(),
        }
    }

    #[test]
    fn example_plan() {
        let plan = Plan::build(&config()).unwrap();

        assert_eq!("test-repo-pipeline", plan.pipeline.name);
        assert_eq!("repo:test-org/test-repo:*", plan.trust.grant.subject_pattern);

        let values: BTreeMap<&str, &str> = plan
            .parameters
            .iter()
            .map(|p| (p.path.as_str(), p.value.expose()))
            .collect();
        assert_eq!(Some(&"111111111111"), values.get("/cdk/accounts/dev"));
        assert_eq!(Some(&"222222222222"), values.get("/cdk/accounts/test"));
        assert_eq!(Some(&"333333333333"), values.get("/cdk/accounts/prod"));
    }

    #[test]
    fn plan_is_deterministic_and_hides_the_token() {
        let first = serde_json::to_string(&Plan::build(&config()).unwrap()).unwrap();
        let second = serde_json::to_string(&Plan::build(&config()).unwrap()).unwrap();

        assert_eq!(first, second);
        assert_eq!(false, first.contains("ghp_secret"));
    }

    #[test]
    fn empty_owner_fails_before_anything_is_planned() {
        let mut config = config();
        config.repository.owner = String::new();

        match Plan::build(&config) {
            Err(Error::Validation(ValidationError::EmptyRepositoryField("owner"))) => {}
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn apply_creates_everything_once() {
        let plan = Plan::build(&config()).unwrap();
        let identity = FakeIdentity::default();
        let store = FakeParameters::default();
        let cloudformation = FakeCloudFormation::default();

        let report = apply(&plan, &identity, &store, &cloudformation).await.unwrap();
        let rerun = apply(&plan, &identity, &store, &cloudformation).await.unwrap();

        assert_eq!(1, identity.providers.lock().unwrap().len());
        assert_eq!(1, identity.roles.lock().unwrap().len());
        assert_eq!(8, report.parameters.len());
        assert_eq!(report.trust.provider_arn(), rerun.trust.provider_arn());
        assert_eq!(true, rerun.parameters.iter().all(|o| !o.was_created()));
        assert_eq!(
            Some(&"arn:aws:iam::000000000000:role/GitHubActionsRole"),
            report.exports.to_map().get(ROLE_ARN_EXPORT)
        );
    }

    #[tokio::test]
    async fn reused_provider_arn_flows_into_exports() {
        let legacy = "arn:aws:iam::000000000000:oidc-provider/legacy";
        let plan = Plan::build(&config()).unwrap();
        let identity = FakeIdentity::with_provider(legacy, "https://token.actions.githubusercontent.com");

        let report = apply(
            &plan,
            &identity,
            &FakeParameters::default(),
            &FakeCloudFormation::default(),
        )
        .await
        .unwrap();

        assert_eq!(Some(&legacy), report.exports.to_map().get(PROVIDER_ARN_EXPORT));
    }

    #[tokio::test]
    async fn conflicting_export_fails_before_any_write() {
        let plan = Plan::build(&config()).unwrap();
        let identity = FakeIdentity::default();
        let store = FakeParameters::default();
        let cloudformation = FakeCloudFormation {
            exports: vec![ExistingExport {
                name: String::from("test-repo-pipeline-arn"),
                value: String::from("arn:aws:codepipeline:us-east-1:999999999999:test-repo-pipeline"),
                exporting_stack_id: String::from("stack/elsewhere"),
            }],
            ..FakeCloudFormation::default()
        };

        let result = apply(&plan, &identity, &store, &cloudformation).await;

        match result {
            Err(Error::Topology(TopologyError::ExportConflict { name, .. })) => {
                assert_eq!("test-repo-pipeline-arn", name)
            }
            other => panic!("Expected export conflict, got {:?}", other),
        }
        assert_eq!(true, identity.providers.lock().unwrap().is_empty());
        assert_eq!(true, identity.roles.lock().unwrap().is_empty());
        assert_eq!(true, store.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reused_provider_is_checked_against_existing_exports() {
        let legacy = "arn:aws:iam::000000000000:oidc-provider/legacy";
        let plan = Plan::build(&config()).unwrap();
        let identity = FakeIdentity::with_provider(legacy, "https://token.actions.githubusercontent.com");
        let cloudformation = FakeCloudFormation {
            exports: vec![ExistingExport {
                name: String::from(PROVIDER_ARN_EXPORT),
                value: String::from(legacy),
                exporting_stack_id: String::from("stack/previous-run"),
            }],
            ..FakeCloudFormation::default()
        };

        let report = apply(&plan, &identity, &FakeParameters::default(), &cloudformation)
            .await
            .unwrap();

        assert_eq!(legacy, report.trust.provider_arn());
    }

    #[tokio::test]
    async fn trust_failure_stops_before_parameters() {
        let plan = Plan::build(&config()).unwrap();
        let identity = FakeIdentity {
            deny_role_writes: true,
            ..FakeIdentity::default()
        };
        let store = FakeParameters::default();

        let result = apply(&plan, &identity, &store, &FakeCloudFormation::default()).await;

        match result {
            Err(Error::TrustSetup(_)) => {}
            other => panic!("Expected trust setup error, got {:?}", other),
        }
        assert_eq!(true, store.stored.lock().unwrap().is_empty());
    }
}
