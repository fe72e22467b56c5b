use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::{fmt, fs, io, path::Path};
use validator::{Validate, ValidationError, ValidationErrors};

pub const DEFAULT_ROLE_NAME: &str = "GitHubActionsRole";

static ACCOUNT_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{12}$").unwrap());

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigurationError {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Missing required field `{0}`")]
    MissingField(String),

    #[error("Invalid value for `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Accounts `{first}` and `{second}` share the id {account}; every stage needs its own account")]
    DuplicateAccount {
        first: String,
        second: String,
        account: String,
    },

    #[error("Malformed context entry `{0}`, expected key=value")]
    MalformedContext(String),

    #[error("Unknown context key `{0}`")]
    UnknownContextKey(String),

    #[error("Remote lookup of {path} failed: {reason}")]
    RemoteLookup { path: String, reason: String },

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

/// Plaintext is only reachable through [`SecretString::expose`].
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}

impl Serialize for SecretString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("****")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn parse(field: &str, value: &str) -> Result<Self, ConfigurationError> {
        if !ACCOUNT_ID_PATTERN.is_match(value) {
            return Err(ConfigurationError::InvalidField {
                field: field.to_string(),
                reason: format!("`{}` is not a 12-digit AWS account id", value),
            });
        }

        return Ok(Self(value.to_string()));
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountSet {
    pub pipeline: AccountId,
    pub dev: AccountId,
    pub test: AccountId,
    pub prod: AccountId,
    pub region: String,
}

impl AccountSet {
    pub fn new(
        pipeline: AccountId,
        dev: AccountId,
        test: AccountId,
        prod: AccountId,
        region: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        let region = region.into();
        if region.trim().is_empty() {
            return Err(ConfigurationError::MissingField(String::from("region")));
        }

        let accounts = Self {
            pipeline,
            dev,
            test,
            prod,
            region,
        };

        let labelled = accounts.labelled();
        for (index, (first, account)) in labelled.iter().enumerate() {
            for (second, other) in &labelled[index + 1..] {
                if account == other {
                    return Err(ConfigurationError::DuplicateAccount {
                        first: first.to_string(),
                        second: second.to_string(),
                        account: account.to_string(),
                    });
                }
            }
        }

        return Ok(accounts);
    }

    /// Accounts in promotion order, labelled by the role they play.
    pub fn labelled(&self) -> [(&'static str, &AccountId); 4] {
        [
            ("pipeline", &self.pipeline),
            ("dev", &self.dev),
            ("test", &self.test),
            ("prod", &self.prod),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryCoordinate {
    pub owner: String,
    pub name: String,
    pub branch: String,
}

impl RepositoryCoordinate {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            branch: branch.into(),
        }
    }

    /// `owner/name`, the form GitHub uses in OIDC subjects.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub accounts: AccountSet,
    pub repository: RepositoryCoordinate,
    pub github_token: Option<SecretString>,
    pub role_name: String,
    pub profiles: BTreeMap<String, String>,
}

impl Config {
    pub fn profile_for(&self, label: &str) -> Option<&str> {
        self.profiles.get(label).map(String::as_str)
    }
}

/// A configurable value and the names it goes by in each source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Field {
    PipelineAccountId,
    DevAccountId,
    TestAccountId,
    ProdAccountId,
    Region,
    GithubOwner,
    GithubRepo,
    GithubBranch,
    GithubToken,
    RoleName,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::PipelineAccountId,
        Field::DevAccountId,
        Field::TestAccountId,
        Field::ProdAccountId,
        Field::Region,
        Field::GithubOwner,
        Field::GithubRepo,
        Field::GithubBranch,
        Field::GithubToken,
        Field::RoleName,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Field::PipelineAccountId => "pipeline_account_id",
            Field::DevAccountId => "dev_account_id",
            Field::TestAccountId => "test_account_id",
            Field::ProdAccountId => "prod_account_id",
            Field::Region => "region",
            Field::GithubOwner => "github_owner",
            Field::GithubRepo => "github_repo",
            Field::GithubBranch => "github_branch",
            Field::GithubToken => "github_token",
            Field::RoleName => "role_name",
        }
    }

    fn context_keys(self) -> &'static [&'static str] {
        match self {
            Field::PipelineAccountId => &["pipelineAccountId"],
            Field::DevAccountId => &["devAccountId"],
            Field::TestAccountId => &["testAccountId"],
            Field::ProdAccountId => &["prodAccountId"],
            Field::Region => &["region"],
            Field::GithubOwner => &["githubOrg", "githubOwner"],
            Field::GithubRepo => &["githubRepo"],
            Field::GithubBranch => &["githubBranch"],
            Field::GithubToken => &["githubToken"],
            Field::RoleName => &["roleName"],
        }
    }

    fn env_vars(self) -> &'static [&'static str] {
        match self {
            Field::PipelineAccountId => &["PIPELINE_ACCOUNT_ID"],
            Field::DevAccountId => &["DEV_ACCOUNT_ID"],
            Field::TestAccountId => &["TEST_ACCOUNT_ID"],
            Field::ProdAccountId => &["PROD_ACCOUNT_ID"],
            Field::Region => &["AWS_REGION", "CDK_DEFAULT_REGION"],
            Field::GithubOwner => &["GITHUB_OWNER", "GITHUB_ORG"],
            Field::GithubRepo => &["GITHUB_REPO"],
            Field::GithubBranch => &["GITHUB_BRANCH"],
            Field::GithubToken => &["GITHUB_TOKEN"],
            Field::RoleName => &["GITHUB_ACTIONS_ROLE_NAME"],
        }
    }

    /// Where the parameter store keeps this field, if it keeps it at all.
    pub fn parameter_path(self) -> Option<&'static str> {
        match self {
            Field::PipelineAccountId => Some("/cdk/accounts/pipeline"),
            Field::DevAccountId => Some("/cdk/accounts/dev"),
            Field::TestAccountId => Some("/cdk/accounts/test"),
            Field::ProdAccountId => Some("/cdk/accounts/prod"),
            Field::GithubOwner => Some("/cdk/github/org"),
            Field::GithubRepo => Some("/cdk/github/repo"),
            Field::GithubBranch => Some("/cdk/github/branch"),
            Field::GithubToken => Some("/cdk/github/token"),
            Field::Region | Field::RoleName => None,
        }
    }

    fn from_context_key(key: &str) -> Option<Field> {
        Field::ALL
            .into_iter()
            .find(|field| field.key() == key || field.context_keys().contains(&key))
    }
}

#[derive(Clone, Default, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[validate(required, custom = "validate_account_id")]
    pub pipeline_account_id: Option<String>,

    #[validate(required, custom = "validate_account_id")]
    pub dev_account_id: Option<String>,

    #[validate(required, custom = "validate_account_id")]
    pub test_account_id: Option<String>,

    #[validate(required, custom = "validate_account_id")]
    pub prod_account_id: Option<String>,

    #[validate(required, custom = "validate_not_blank")]
    pub region: Option<String>,

    #[validate(required, custom = "validate_not_blank")]
    pub github_owner: Option<String>,

    #[validate(required, custom = "validate_not_blank")]
    pub github_repo: Option<String>,

    #[validate(required, custom = "validate_not_blank")]
    pub github_branch: Option<String>,

    #[serde(skip_serializing)]
    pub github_token: Option<String>,

    #[validate(custom = "validate_not_blank")]
    pub role_name: Option<String>,

    #[serde(default)]
    pub profiles: BTreeMap<String, String>,
}

impl fmt::Debug for RawConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConfig")
            .field("pipeline_account_id", &self.pipeline_account_id)
            .field("dev_account_id", &self.dev_account_id)
            .field("test_account_id", &self.test_account_id)
            .field("prod_account_id", &self.prod_account_id)
            .field("region", &self.region)
            .field("github_owner", &self.github_owner)
            .field("github_repo", &self.github_repo)
            .field("github_branch", &self.github_branch)
            .field("github_token", &self.github_token.as_ref().map(|_| "****"))
            .field("role_name", &self.role_name)
            .field("profiles", &self.profiles)
            .finish()
    }
}

impl RawConfig {
    pub fn get(&self, field: Field) -> Option<&str> {
        let value = match field {
            Field::PipelineAccountId => &self.pipeline_account_id,
            Field::DevAccountId => &self.dev_account_id,
            Field::TestAccountId => &self.test_account_id,
            Field::ProdAccountId => &self.prod_account_id,
            Field::Region => &self.region,
            Field::GithubOwner => &self.github_owner,
            Field::GithubRepo => &self.github_repo,
            Field::GithubBranch => &self.github_branch,
            Field::GithubToken => &self.github_token,
            Field::RoleName => &self.role_name,
        };
        return value.as_deref();
    }

    fn slot(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::PipelineAccountId => &mut self.pipeline_account_id,
            Field::DevAccountId => &mut self.dev_account_id,
            Field::TestAccountId => &mut self.test_account_id,
            Field::ProdAccountId => &mut self.prod_account_id,
            Field::Region => &mut self.region,
            Field::GithubOwner => &mut self.github_owner,
            Field::GithubRepo => &mut self.github_repo,
            Field::GithubBranch => &mut self.github_branch,
            Field::GithubToken => &mut self.github_token,
            Field::RoleName => &mut self.role_name,
        }
    }

    /// Sets `field` unless a higher-precedence source already did.
    pub fn fill(&mut self, field: Field, value: impl Into<String>) {
        let slot = self.slot(field);
        if slot.is_none() {
            *slot = Some(value.into());
        }
    }

    fn fill_from(&mut self, other: &RawConfig) {
        for field in Field::ALL {
            if let Some(value) = other.get(field) {
                self.fill(field, value);
            }
        }
        for (label, profile) in &other.profiles {
            self.profiles
                .entry(label.clone())
                .or_insert_with(|| profile.clone());
        }
    }
}

pub fn parse(path: &Path) -> Result<RawConfig, ConfigurationError> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(ConfigurationError::FileNotFound(
                path.display().to_string(),
            )),
            _ => Err(ConfigurationError::Unknown(error.to_string())),
        },
    }?;

    let config: RawConfig = match serde_yaml::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(ConfigurationError::ParsingError(error.to_string())),
    }?;

    return Ok(config);
}

pub fn parse_context_pair(entry: &str) -> Result<(String, String), ConfigurationError> {
    match entry.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(ConfigurationError::MalformedContext(entry.to_string())),
    }
}

/// A remote key/value store consulted for fields no local source provided.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn lookup(&self, path: &str) -> Result<Option<String>, ConfigurationError>;
}

/// Merges configuration sources, highest precedence first:
/// context, environment, file, then the remote store when one is attached.
#[derive(Default)]
pub struct Resolver<'a> {
    file: Option<RawConfig>,
    environment: HashMap<String, String>,
    context: Vec<(String, String)>,
    remote: Option<&'a dyn RemoteSource>,
    require_token: bool,
}

impl<'a> Resolver<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, raw: RawConfig) -> Self {
        self.file = Some(raw);
        self
    }

    pub fn environment<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment = vars
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self
    }

    pub fn context(mut self, pairs: Vec<(String, String)>) -> Self {
        self.context = pairs;
        self
    }

    pub fn remote(mut self, store: &'a dyn RemoteSource) -> Self {
        self.remote = Some(store);
        self
    }

    pub fn require_token(mut self, require: bool) -> Self {
        self.require_token = require;
        self
    }

    /// Value of `field` from context, environment and file alone. Lets a
    /// caller pick the remote store's region before attaching it.
    pub fn local_value(&self, field: Field) -> Result<Option<String>, ConfigurationError> {
        let raw = self.merge_local()?;
        return Ok(raw.get(field).map(str::to_string));
    }

    fn merge_local(&self) -> Result<RawConfig, ConfigurationError> {
        let mut raw = RawConfig::default();

        // Later context entries win over earlier ones, as on a command line.
        for (key, value) in self.context.iter().rev() {
            let field = Field::from_context_key(key)
                .ok_or_else(|| ConfigurationError::UnknownContextKey(key.clone()))?;
            raw.fill(field, value.clone());
        }

        for field in Field::ALL {
            let from_env = field
                .env_vars()
                .iter()
                .filter_map(|name| self.environment.get(*name))
                .find(|value| !value.is_empty());
            if let Some(value) = from_env {
                raw.fill(field, value.clone());
            }
        }

        if let Some(file) = &self.file {
            raw.fill_from(file);
        }

        return Ok(raw);
    }

    pub async fn resolve(self) -> Result<Config, ConfigurationError> {
        let mut raw = self.merge_local()?;

        if let Some(remote) = self.remote {
            for field in Field::ALL {
                if raw.get(field).is_some() {
                    continue;
                }
                let path = match field.parameter_path() {
                    Some(path) => path,
                    None => continue,
                };
                if field == Field::GithubToken && !self.require_token {
                    continue;
                }
                if let Some(value) = remote.lookup(path).await? {
                    tracing::debug!(field = field.key(), path, "resolved from parameter store");
                    raw.fill(field, value);
                }
            }
        }

        return finish(raw, self.require_token);
    }
}

fn finish(raw: RawConfig, require_token: bool) -> Result<Config, ConfigurationError> {
    match raw.validate() {
        Ok(_) => (),
        Err(errors) => return Err(first_error(&errors)),
    }

    let github_token = match raw.github_token.as_deref() {
        Some(token) if !token.is_empty() => Some(SecretString::new(token)),
        _ => None,
    };
    if require_token && github_token.is_none() {
        return Err(ConfigurationError::MissingField(String::from(
            Field::GithubToken.key(),
        )));
    }

    let accounts = AccountSet::new(
        required_account(&raw, Field::PipelineAccountId)?,
        required_account(&raw, Field::DevAccountId)?,
        required_account(&raw, Field::TestAccountId)?,
        required_account(&raw, Field::ProdAccountId)?,
        required(&raw, Field::Region)?,
    )?;

    let repository = RepositoryCoordinate::new(
        required(&raw, Field::GithubOwner)?,
        required(&raw, Field::GithubRepo)?,
        required(&raw, Field::GithubBranch)?,
    );

    return Ok(Config {
        accounts,
        repository,
        github_token,
        role_name: raw
            .role_name
            .clone()
            .unwrap_or_else(|| String::from(DEFAULT_ROLE_NAME)),
        profiles: raw.profiles,
    });
}

fn required(raw: &RawConfig, field: Field) -> Result<String, ConfigurationError> {
    raw.get(field)
        .map(str::to_string)
        .ok_or_else(|| ConfigurationError::MissingField(field.key().to_string()))
}

fn required_account(raw: &RawConfig, field: Field) -> Result<AccountId, ConfigurationError> {
    let value = required(raw, field)?;
    AccountId::parse(field.key(), &value)
}

// Reports the alphabetically first failing field so the message is stable.
fn first_error(errors: &ValidationErrors) -> ConfigurationError {
    let ordered: BTreeMap<_, _> = errors.field_errors().into_iter().collect();
    let (field, failures) = match ordered.into_iter().next() {
        Some(entry) => entry,
        None => return ConfigurationError::Unknown(errors.to_string()),
    };

    let failure = match failures.first() {
        Some(failure) => failure,
        None => return ConfigurationError::Unknown(errors.to_string()),
    };

    if failure.code == "required" {
        return ConfigurationError::MissingField(field.to_string());
    }

    let reason = match &failure.message {
        Some(message) => message.to_string(),
        None => failure.code.to_string(),
    };
    return ConfigurationError::InvalidField {
        field: field.to_string(),
        reason,
    };
}

fn validate_account_id(value: &str) -> Result<(), ValidationError> {
    if !ACCOUNT_ID_PATTERN.is_match(value) {
        let mut error = ValidationError::new("account_id");
        error.message = Some(format!("`{}` is not a 12-digit AWS account id", value).into());
        return Err(error);
    }

    return Ok(());
}

fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut error = ValidationError::new("blank");
        error.message = Some("must not be empty".into());
        return Err(error);
    }

    return Ok(());
}
