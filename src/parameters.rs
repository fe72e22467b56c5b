//! SSM parameters that let later automation find the pipeline's
//! configuration without re-resolving it.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::aws::ApiError;
use crate::config::{Config, ConfigurationError, Field, RemoteSource, SecretString};
use crate::reconcile::{self, Outcome, Resource};
use crate::trust::MANAGED_BY;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("Writing parameter {path} failed: {source}")]
pub struct ParameterWriteError {
    pub path: String,
    #[source]
    pub source: ApiError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Plain,
    Secret,
}

impl ParameterKind {
    /// The SSM parameter type this kind is stored as.
    pub fn ssm_type(self) -> &'static str {
        match self {
            ParameterKind::Plain => "String",
            ParameterKind::Secret => "SecureString",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    Plain(String),
    Secret(SecretString),
}

impl ParameterValue {
    pub fn kind(&self) -> ParameterKind {
        match self {
            ParameterValue::Plain(_) => ParameterKind::Plain,
            ParameterValue::Secret(_) => ParameterKind::Secret,
        }
    }

    /// Plaintext for the store. Never log the result.
    pub fn expose(&self) -> &str {
        match self {
            ParameterValue::Plain(value) => value,
            ParameterValue::Secret(value) => value.expose(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    pub path: String,
    #[serde(flatten)]
    pub value: ParameterValue,
    pub description: String,
}

impl Parameter {
    pub fn kind(&self) -> ParameterKind {
        self.value.kind()
    }
}

pub fn managed_tags() -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert(String::from("ManagedBy"), String::from(MANAGED_BY));
    tags.insert(String::from("Purpose"), String::from("cdk-pipeline"));
    tags
}

/// The parameters a configuration is persisted as. The token entry only
/// appears when a token was resolved.
pub fn desired(config: &Config) -> Vec<Parameter> {
    let accounts = &config.accounts;
    let repository = &config.repository;

    let plain = [
        (Field::DevAccountId, accounts.dev.as_str(), "Development account id"),
        (Field::TestAccountId, accounts.test.as_str(), "Test account id"),
        (Field::ProdAccountId, accounts.prod.as_str(), "Production account id"),
        (Field::PipelineAccountId, accounts.pipeline.as_str(), "Pipeline account id"),
        (Field::GithubOwner, repository.owner.as_str(), "GitHub organization or owner"),
        (Field::GithubRepo, repository.name.as_str(), "GitHub repository name"),
        (Field::GithubBranch, repository.branch.as_str(), "Branch the pipeline tracks"),
    ];

    let mut parameters: Vec<Parameter> = plain
        .iter()
        .filter_map(|(field, value, description)| {
            field.parameter_path().map(|path| Parameter {
                path: path.to_string(),
                value: ParameterValue::Plain(value.to_string()),
                description: description.to_string(),
            })
        })
        .collect();

    if let (Some(token), Some(path)) = (&config.github_token, Field::GithubToken.parameter_path()) {
        parameters.push(Parameter {
            path: path.to_string(),
            value: ParameterValue::Secret(token.clone()),
            description: String::from("GitHub access token used by the pipeline source action"),
        });
    }

    parameters
}

#[async_trait]
pub trait ParameterApi: Send + Sync {
    /// The decrypted value, or `None` when the path does not exist.
    async fn get_parameter(&self, path: &str) -> Result<Option<String>, ApiError>;

    async fn create_parameter(
        &self,
        parameter: &Parameter,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ApiError>;

    async fn overwrite_parameter(&self, parameter: &Parameter) -> Result<(), ApiError>;
}

struct ParameterResource<'a, A: ParameterApi> {
    api: &'a A,
    parameter: &'a Parameter,
    tags: &'a BTreeMap<String, String>,
}

impl<'a, A: ParameterApi> ParameterResource<'a, A> {
    fn error(&self, source: ApiError) -> ParameterWriteError {
        ParameterWriteError {
            path: self.parameter.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl<'a, A: ParameterApi> Resource for ParameterResource<'a, A> {
    type Id = String;
    type Error = ParameterWriteError;

    fn describe(&self) -> String {
        format!("parameter {} ({})", self.parameter.path, self.parameter.kind().ssm_type())
    }

    async fn find(&self) -> Result<Option<String>, ParameterWriteError> {
        let existing = self
            .api
            .get_parameter(&self.parameter.path)
            .await
            .map_err(|e| self.error(e))?;
        Ok(existing.map(|_| self.parameter.path.clone()))
    }

    async fn create(&self) -> Result<String, ParameterWriteError> {
        self.api
            .create_parameter(self.parameter, self.tags)
            .await
            .map_err(|e| self.error(e))?;
        Ok(self.parameter.path.clone())
    }

    async fn update(&self, existing: String) -> Result<String, ParameterWriteError> {
        self.api
            .overwrite_parameter(self.parameter)
            .await
            .map_err(|e| self.error(e))?;
        Ok(existing)
    }
}

/// Writes every parameter in order and stops at the first failure.
pub async fn write_all<A: ParameterApi>(
    api: &A,
    parameters: &[Parameter],
) -> Result<Vec<Outcome<String>>, ParameterWriteError> {
    let tags = managed_tags();
    let mut outcomes = Vec::with_capacity(parameters.len());

    for parameter in parameters {
        let resource = ParameterResource {
            api,
            parameter,
            tags: &tags,
        };
        outcomes.push(reconcile::ensure(&resource).await?);
    }

    return Ok(outcomes);
}

/// Exposes a parameter store as a configuration source.
pub struct RemoteStore<'a, A: ParameterApi>(pub &'a A);

#[async_trait]
impl<'a, A: ParameterApi> RemoteSource for RemoteStore<'a, A> {
    async fn lookup(&self, path: &str) -> Result<Option<String>, ConfigurationError> {
        self.0
            .get_parameter(path)
            .await
            .map_err(|error| ConfigurationError::RemoteLookup {
                path: path.to_string(),
                reason: error.to_string(),
            })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::{Parameter, ParameterApi, ParameterKind};
    use crate::aws::ApiError;
    use async_trait::async_trait;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Stored {
        pub value: String,
        pub kind: ParameterKind,
        pub tags: BTreeMap<String, String>,
        pub writes: u32,
    }

    #[derive(Default)]
    pub struct FakeParameters {
        pub stored: Mutex<BTreeMap<String, Stored>>,
        pub reject_path: Option<String>,
        pub unreachable: bool,
    }

    impl FakeParameters {
        pub fn value(&self, path: &str) -> Option<String> {
            self.stored.lock().unwrap().get(path).map(|s| s.value.clone())
        }

        fn check(&self, path: &str) -> Result<(), ApiError> {
            if self.reject_path.as_deref() == Some(path) {
                return Err(ApiError::ServiceError(String::from("ParameterLimitExceeded")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ParameterApi for FakeParameters {
        async fn get_parameter(&self, path: &str) -> Result<Option<String>, ApiError> {
            if self.unreachable {
                return Err(ApiError::UnknownError(String::from("dispatch failure")));
            }
            Ok(self.value(path))
        }

        async fn create_parameter(
            &self,
            parameter: &Parameter,
            tags: &BTreeMap<String, String>,
        ) -> Result<(), ApiError> {
            self.check(&parameter.path)?;
            self.stored.lock().unwrap().insert(
                parameter.path.clone(),
                Stored {
                    value: parameter.value.expose().to_string(),
                    kind: parameter.kind(),
                    tags: tags.clone(),
                    writes: 1,
                },
            );
            Ok(())
        }

        async fn overwrite_parameter(&self, parameter: &Parameter) -> Result<(), ApiError> {
            self.check(&parameter.path)?;
            let mut stored = self.stored.lock().unwrap();
            let entry = stored
                .get_mut(&parameter.path)
                .ok_or_else(|| ApiError::NotFoundError(parameter.path.clone()))?;
            entry.value = parameter.value.expose().to_string();
            entry.writes += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::fake::FakeParameters;
    use super::*;
    use crate::config::{AccountId, AccountSet, RepositoryCoordinate};

    fn config(token: Option<&str>) -> Config {
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
            github_token: token.map(SecretString::new),
            role_name: String::from("GitHubActionsRole"),
            profiles: BTreeMap::new(),
        }
    }

    #[test]
    fn desired_parameter_paths() {
        let parameters = desired(&config(Some("ghp_secret")));
        let paths: Vec<&str> = parameters.iter().map(|p| p.path.as_str()).collect();

        assert_eq!(
            vec![
                "/cdk/accounts/dev",
                "/cdk/accounts/test",
                "/cdk/accounts/prod",
                "/cdk/accounts/pipeline",
                "/cdk/github/org",
                "/cdk/github/repo",
                "/cdk/github/branch",
                "/cdk/github/token",
            ],
            paths
        );
        assert_eq!("111111111111", parameters[0].value.expose());
        assert_eq!(ParameterKind::Secret, parameters[7].kind());
        assert_eq!(
            1,
            parameters
                .iter()
                .filter(|p| p.kind() == ParameterKind::Secret)
                .count()
        );
    }

    #[test]
    fn token_parameter_is_omitted_without_token() {
        let parameters = desired(&config(None));
        assert_eq!(7, parameters.len());
        assert_eq!(true, parameters.iter().all(|p| p.kind() == ParameterKind::Plain));
    }

    #[test]
    fn secret_value_is_never_rendered() {
        let parameters = desired(&config(Some("ghp_secret")));
        let token = parameters.last().unwrap();

        let json = serde_json::to_string(token).unwrap();
        assert_eq!(false, json.contains("ghp_secret"));
        assert_eq!(true, json.contains("\"kind\":\"secret\""));
        assert_eq!(false, format!("{:?}", token).contains("ghp_secret"));
    }

    #[tokio::test]
    async fn creates_then_overwrites_in_place() {
        let api = FakeParameters::default();
        let parameters = desired(&config(Some("ghp_secret")));

        let first = write_all(&api, &parameters).await.unwrap();
        assert_eq!(true, first.iter().all(|o| o.was_created()));

        let mut changed = config(Some("ghp_rotated"));
        changed.repository.branch = String::from("release");
        let second = write_all(&api, &desired(&changed)).await.unwrap();
        assert_eq!(true, second.iter().all(|o| !o.was_created()));

        assert_eq!(Some(String::from("release")), api.value("/cdk/github/branch"));
        assert_eq!(Some(String::from("ghp_rotated")), api.value("/cdk/github/token"));

        let stored = api.stored.lock().unwrap();
        let token = stored.get("/cdk/github/token").unwrap();
        assert_eq!(ParameterKind::Secret, token.kind);
        assert_eq!(2, token.writes);
        assert_eq!(Some(&String::from("pipeline-bootstrap")), token.tags.get("ManagedBy"));
    }

    #[tokio::test]
    async fn first_failure_halts_remaining_writes() {
        let api = FakeParameters {
            reject_path: Some(String::from("/cdk/accounts/prod")),
            ..FakeParameters::default()
        };

        let result = write_all(&api, &desired(&config(None))).await;

        assert_eq!(
            Err(ParameterWriteError {
                path: String::from("/cdk/accounts/prod"),
                source: ApiError::ServiceError(String::from("ParameterLimitExceeded")),
            }),
            result
        );
        assert_eq!(Some(String::from("222222222222")), api.value("/cdk/accounts/test"));
        assert_eq!(None, api.value("/cdk/accounts/pipeline"));
    }

    #[tokio::test]
    async fn remote_store_reads_through() {
        let api = FakeParameters::default();
        write_all(&api, &desired(&config(None))).await.unwrap();

        let store = RemoteStore(&api);
        assert_eq!(
            Ok(Some(String::from("test-org"))),
            store.lookup("/cdk/github/org").await
        );
        assert_eq!(Ok(None), store.lookup("/cdk/github/token").await);
    }

    #[tokio::test]
    async fn remote_store_failure_names_the_path() {
        let api = FakeParameters {
            unreachable: true,
            ..FakeParameters::default()
        };

        let result = RemoteStore(&api).lookup("/cdk/accounts/dev").await;

        assert_eq!(
            Err(ConfigurationError::RemoteLookup {
                path: String::from("/cdk/accounts/dev"),
                reason: String::from("Unknown error ocurred: dispatch failure."),
            }),
            result
        );
    }
}
