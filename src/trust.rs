//! GitHub Actions OIDC federation: the identity provider and the role that
//! trusts it.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;

use crate::aws::ApiError;
use crate::config::{AccountSet, Config, RepositoryCoordinate};
use crate::error::ValidationError;
use crate::reconcile::{self, Outcome, Resource};

pub const GITHUB_OIDC_URL: &str = "https://token.actions.githubusercontent.com";
pub const STS_AUDIENCE: &str = "sts.amazonaws.com";

/// Issuer certificate chain thumbprints, oldest first. Append a new entry
/// when GitHub rotates its chain.
pub const GITHUB_OIDC_THUMBPRINTS: [&str; 2] = [
    "6938fd4d98bab03faadb97b34396831e3780aea1",
    "1c58a3a8518e8759bf075b76b750d4f2df264fcd",
];

pub const MANAGED_BY: &str = "pipeline-bootstrap";
pub const INLINE_POLICY_NAME: &str = "PipelineBootstrapAccess";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TrustSetupError {
    #[error("OIDC provider for {url} could not be set up: {source}")]
    Provider {
        url: String,
        #[source]
        source: ApiError,
    },

    #[error("IAM role {role} could not be set up: {source}")]
    Role {
        role: String,
        #[source]
        source: ApiError,
    },
}

/// The federated trust relationship one repository gets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustGrant {
    pub provider_url: String,
    pub audience: String,
    pub subject_pattern: String,
}

impl TrustGrant {
    pub fn new(repository: &RepositoryCoordinate) -> Result<Self, ValidationError> {
        if repository.owner.trim().is_empty() {
            return Err(ValidationError::EmptyRepositoryField("owner"));
        }
        if repository.name.trim().is_empty() {
            return Err(ValidationError::EmptyRepositoryField("name"));
        }

        return Ok(Self {
            provider_url: String::from(GITHUB_OIDC_URL),
            audience: String::from(STS_AUDIENCE),
            subject_pattern: format!("repo:{}:*", repository.full_name()),
        });
    }

    fn condition_key(&self, claim: &str) -> String {
        format!("{}:{}", host_of(&self.provider_url), claim)
    }

    pub fn policy_document(&self, provider_arn: &str) -> serde_json::Value {
        let audience_key = self.condition_key("aud");
        let subject_key = self.condition_key("sub");

        json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Federated": provider_arn },
                "Action": "sts:AssumeRoleWithWebIdentity",
                "Condition": {
                    "StringEquals": { audience_key: self.audience },
                    "StringLike": { subject_key: self.subject_pattern },
                },
            }],
        })
    }

    /// Evaluates the role's trust condition against a token's claims:
    /// exact match on audience, glob match on subject.
    pub fn permits(&self, audience: &str, subject: &str) -> bool {
        audience == self.audience && string_like(&self.subject_pattern, subject)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrustPlan {
    pub grant: TrustGrant,
    pub role_name: String,
    pub expected_provider_arn: String,
    pub thumbprints: Vec<String>,
    pub permissions: serde_json::Value,
    pub tags: BTreeMap<String, String>,
}

impl TrustPlan {
    pub fn new(config: &Config) -> Result<Self, ValidationError> {
        let grant = TrustGrant::new(&config.repository)?;
        let expected_provider_arn = format!(
            "arn:aws:iam::{}:oidc-provider/{}",
            config.accounts.pipeline,
            host_of(GITHUB_OIDC_URL)
        );

        let mut tags = BTreeMap::new();
        tags.insert(String::from("ManagedBy"), String::from(MANAGED_BY));
        tags.insert(String::from("Repository"), config.repository.full_name());

        return Ok(Self {
            grant,
            role_name: config.role_name.clone(),
            expected_provider_arn,
            thumbprints: GITHUB_OIDC_THUMBPRINTS.iter().map(|t| t.to_string()).collect(),
            permissions: permissions_document(&config.accounts),
            tags,
        });
    }
}

// Lets the workflow hop into the CDK roles of every account and read the
// pipeline's own parameters.
fn permissions_document(accounts: &AccountSet) -> serde_json::Value {
    let cdk_roles: Vec<String> = accounts
        .labelled()
        .iter()
        .map(|(_, account)| format!("arn:aws:iam::{}:role/cdk-*", account))
        .collect();

    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Sid": "AssumeCdkRoles",
                "Effect": "Allow",
                "Action": "sts:AssumeRole",
                "Resource": cdk_roles,
            },
            {
                "Sid": "ReadPipelineParameters",
                "Effect": "Allow",
                "Action": ["ssm:GetParameter", "ssm:GetParameters", "ssm:GetParametersByPath"],
                "Resource": format!(
                    "arn:aws:ssm:{}:{}:parameter/cdk/*",
                    accounts.region, accounts.pipeline
                ),
            },
        ],
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub url: String,
    pub client_ids: Vec<String>,
    pub thumbprints: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoleRequest {
    pub name: String,
    pub trust_policy: String,
    pub description: String,
    pub tags: BTreeMap<String, String>,
}

#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// ARNs of every OIDC provider in the account.
    async fn list_oidc_providers(&self) -> Result<Vec<String>, ApiError>;

    async fn oidc_provider_url(&self, arn: &str) -> Result<String, ApiError>;

    async fn create_oidc_provider(&self, request: &ProviderRequest) -> Result<String, ApiError>;

    /// The role's ARN, or `None` when no role has that name.
    async fn find_role(&self, name: &str) -> Result<Option<String>, ApiError>;

    async fn create_role(&self, request: &RoleRequest) -> Result<String, ApiError>;

    async fn replace_trust_policy(&self, role_name: &str, document: &str) -> Result<(), ApiError>;

    async fn put_inline_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        document: &str,
    ) -> Result<(), ApiError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrustOutcome {
    pub provider: Outcome<String>,
    pub role: Outcome<String>,
}

impl TrustOutcome {
    pub fn provider_arn(&self) -> &str {
        self.provider.id()
    }

    pub fn role_arn(&self) -> &str {
        self.role.id()
    }
}

struct ProviderResource<'a, A: IdentityApi> {
    api: &'a A,
    plan: &'a TrustPlan,
}

impl<'a, A: IdentityApi> ProviderResource<'a, A> {
    fn error(&self, source: ApiError) -> TrustSetupError {
        TrustSetupError::Provider {
            url: self.plan.grant.provider_url.clone(),
            source,
        }
    }
}

#[async_trait]
impl<'a, A: IdentityApi> Resource for ProviderResource<'a, A> {
    type Id = String;
    type Error = TrustSetupError;

    fn describe(&self) -> String {
        format!("oidc-provider {}", self.plan.grant.provider_url)
    }

    async fn find(&self) -> Result<Option<String>, TrustSetupError> {
        let wanted = host_of(&self.plan.grant.provider_url);
        let arns = self
            .api
            .list_oidc_providers()
            .await
            .map_err(|e| self.error(e))?;

        for arn in arns {
            let url = self
                .api
                .oidc_provider_url(&arn)
                .await
                .map_err(|e| self.error(e))?;
            if host_of(&url) == wanted {
                return Ok(Some(arn));
            }
        }

        return Ok(None);
    }

    async fn create(&self) -> Result<String, TrustSetupError> {
        let request = ProviderRequest {
            url: self.plan.grant.provider_url.clone(),
            client_ids: vec![self.plan.grant.audience.clone()],
            thumbprints: self.plan.thumbprints.clone(),
            tags: self.plan.tags.clone(),
        };

        self.api
            .create_oidc_provider(&request)
            .await
            .map_err(|e| self.error(e))
    }

    async fn update(&self, existing: String) -> Result<String, TrustSetupError> {
        tracing::info!(arn = %existing, "reusing existing OIDC provider");
        Ok(existing)
    }
}

struct RoleResource<'a, A: IdentityApi> {
    api: &'a A,
    plan: &'a TrustPlan,
    trust_policy: String,
}

impl<'a, A: IdentityApi> RoleResource<'a, A> {
    fn error(&self, source: ApiError) -> TrustSetupError {
        TrustSetupError::Role {
            role: self.plan.role_name.clone(),
            source,
        }
    }
}

#[async_trait]
impl<'a, A: IdentityApi> Resource for RoleResource<'a, A> {
    type Id = String;
    type Error = TrustSetupError;

    fn describe(&self) -> String {
        format!("iam-role {}", self.plan.role_name)
    }

    async fn find(&self) -> Result<Option<String>, TrustSetupError> {
        self.api
            .find_role(&self.plan.role_name)
            .await
            .map_err(|e| self.error(e))
    }

    async fn create(&self) -> Result<String, TrustSetupError> {
        let request = RoleRequest {
            name: self.plan.role_name.clone(),
            trust_policy: self.trust_policy.clone(),
            description: format!(
                "Assumed by GitHub Actions workflows of {}",
                self.plan.grant.subject_pattern
            ),
            tags: self.plan.tags.clone(),
        };

        self.api
            .create_role(&request)
            .await
            .map_err(|e| self.error(e))
    }

    // The trust policy is replaced as a whole so stale conditions never survive.
    async fn update(&self, existing: String) -> Result<String, TrustSetupError> {
        self.api
            .replace_trust_policy(&self.plan.role_name, &self.trust_policy)
            .await
            .map_err(|e| self.error(e))?;
        Ok(existing)
    }
}

pub async fn setup<A: IdentityApi>(api: &A, plan: &TrustPlan) -> Result<TrustOutcome, TrustSetupError> {
    let provider = reconcile::ensure(&ProviderResource { api, plan }).await?;

    let role_resource = RoleResource {
        api,
        plan,
        trust_policy: plan.grant.policy_document(provider.id()).to_string(),
    };
    let role = reconcile::ensure(&role_resource).await?;

    api.put_inline_policy(
        &plan.role_name,
        INLINE_POLICY_NAME,
        &plan.permissions.to_string(),
    )
    .await
    .map_err(|source| TrustSetupError::Role {
        role: plan.role_name.clone(),
        source,
    })?;

    return Ok(TrustOutcome { provider, role });
}

/// ARNs `setup` would end up with for resources that already exist,
/// looked up without writing anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingTrust {
    pub provider_arn: Option<String>,
    pub role_arn: Option<String>,
}

pub async fn existing<A: IdentityApi>(api: &A, plan: &TrustPlan) -> Result<ExistingTrust, TrustSetupError> {
    let provider_arn = ProviderResource { api, plan }.find().await?;
    let role_arn = api
        .find_role(&plan.role_name)
        .await
        .map_err(|source| TrustSetupError::Role {
            role: plan.role_name.clone(),
            source,
        })?;

    return Ok(ExistingTrust {
        provider_arn,
        role_arn,
    });
}

/// `https://host/` and `host` name the same issuer.
fn host_of(url: &str) -> &str {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    without_scheme.trim_end_matches('/')
}

// IAM StringLike: `*` matches any run of characters, `?` exactly one.
fn string_like(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    let (mut p, mut v) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, v));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            v = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    return p == pattern.len();
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::{IdentityApi, ProviderRequest, RoleRequest};
    use crate::aws::ApiError;
    use async_trait::async_trait;

    /// In-memory IAM: providers by ARN, roles by name.
    #[derive(Default)]
    pub struct FakeIdentity {
        pub providers: Mutex<BTreeMap<String, String>>,
        pub roles: Mutex<BTreeMap<String, (String, String)>>,
        pub inline_policies: Mutex<BTreeMap<(String, String), String>>,
        pub deny_role_writes: bool,
    }

    impl FakeIdentity {
        pub fn with_provider(arn: &str, url: &str) -> Self {
            let fake = Self::default();
            fake.providers
                .lock()
                .unwrap()
                .insert(arn.to_string(), url.to_string());
            fake
        }

        pub fn trust_policy(&self, role: &str) -> Option<String> {
            self.roles
                .lock()
                .unwrap()
                .get(role)
                .map(|(_, policy)| policy.clone())
        }
    }

    #[async_trait]
    impl IdentityApi for FakeIdentity {
        async fn list_oidc_providers(&self) -> Result<Vec<String>, ApiError> {
            Ok(self.providers.lock().unwrap().keys().cloned().collect())
        }

        async fn oidc_provider_url(&self, arn: &str) -> Result<String, ApiError> {
            self.providers
                .lock()
                .unwrap()
                .get(arn)
                .cloned()
                .ok_or_else(|| ApiError::NotFoundError(arn.to_string()))
        }

        async fn create_oidc_provider(&self, request: &ProviderRequest) -> Result<String, ApiError> {
            let host = request.url.trim_start_matches("https://");
            let arn = format!("arn:aws:iam::000000000000:oidc-provider/{}", host);
            self.providers
                .lock()
                .unwrap()
                .insert(arn.clone(), host.to_string());
            Ok(arn)
        }

        async fn find_role(&self, name: &str) -> Result<Option<String>, ApiError> {
            Ok(self
                .roles
                .lock()
                .unwrap()
                .get(name)
                .map(|(arn, _)| arn.clone()))
        }

        async fn create_role(&self, request: &RoleRequest) -> Result<String, ApiError> {
            if self.deny_role_writes {
                return Err(ApiError::ServiceError(String::from("AccessDenied")));
            }
            let arn = format!("arn:aws:iam::000000000000:role/{}", request.name);
            self.roles.lock().unwrap().insert(
                request.name.clone(),
                (arn.clone(), request.trust_policy.clone()),
            );
            Ok(arn)
        }

        async fn replace_trust_policy(&self, role_name: &str, document: &str) -> Result<(), ApiError> {
            if self.deny_role_writes {
                return Err(ApiError::ServiceError(String::from("AccessDenied")));
            }
            let mut roles = self.roles.lock().unwrap();
            let entry = roles
                .get_mut(role_name)
                .ok_or_else(|| ApiError::NotFoundError(role_name.to_string()))?;
            entry.1 = document.to_string();
            Ok(())
        }

        async fn put_inline_policy(
            &self,
            role_name: &str,
            policy_name: &str,
            document: &str,
        ) -> Result<(), ApiError> {
            self.inline_policies.lock().unwrap().insert(
                (role_name.to_string(), policy_name.to_string()),
                document.to_string(),
            );
            Ok(())
        }
    }
}
