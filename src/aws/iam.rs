use async_trait::async_trait;
use aws_sdk_iam::model::Tag;
use aws_sdk_iam::types::SdkError;
use std::collections::BTreeMap;

use super::{map_sdk_error, ApiError, AwsContext};
use crate::trust::{IdentityApi, ProviderRequest, RoleRequest};

pub struct IamClient {
    client: aws_sdk_iam::Client,
}

impl IamClient {
    pub async fn new(context: &AwsContext) -> Self {
        let sdk_config = context.load().await;
        let client = aws_sdk_iam::Client::new(&sdk_config);

        return Self { client };
    }
}

fn tags(tags: &BTreeMap<String, String>) -> Vec<Tag> {
    tags.iter()
        .map(|(key, value)| Tag::builder().key(key).value(value).build())
        .collect()
}

#[async_trait]
impl IdentityApi for IamClient {
    async fn list_oidc_providers(&self) -> Result<Vec<String>, ApiError> {
        let result = self
            .client
            .list_open_id_connect_providers()
            .send()
            .await
            .map_err(map_sdk_error)?;

        let arns = result
            .open_id_connect_provider_list()
            .unwrap_or_else(|| &[])
            .iter()
            .filter_map(|entry| entry.arn().map(str::to_string))
            .collect();

        return Ok(arns);
    }

    async fn oidc_provider_url(&self, arn: &str) -> Result<String, ApiError> {
        let result = self
            .client
            .get_open_id_connect_provider()
            .open_id_connect_provider_arn(arn)
            .send()
            .await
            .map_err(map_sdk_error)?;

        match result.url() {
            Some(url) => Ok(url.to_string()),
            None => Err(ApiError::NotFoundError(format!("URL of {}", arn))),
        }
    }

    async fn create_oidc_provider(&self, request: &ProviderRequest) -> Result<String, ApiError> {
        let mut builder = self
            .client
            .create_open_id_connect_provider()
            .url(&request.url)
            .set_tags(Some(tags(&request.tags)));
        for client_id in &request.client_ids {
            builder = builder.client_id_list(client_id);
        }
        for thumbprint in &request.thumbprints {
            builder = builder.thumbprint_list(thumbprint);
        }

        let result = builder.send().await.map_err(map_sdk_error)?;

        match result.open_id_connect_provider_arn() {
            Some(arn) => Ok(arn.to_string()),
            None => Err(ApiError::UnknownError(format!(
                "no ARN returned for provider {}",
                request.url
            ))),
        }
    }

    async fn find_role(&self, name: &str) -> Result<Option<String>, ApiError> {
        let result = self.client.get_role().role_name(name).send().await;

        let result = match result {
            Ok(data) => data,
            Err(SdkError::ServiceError { err, .. }) if err.is_no_such_entity_exception() => {
                return Ok(None);
            }
            Err(err) => return Err(map_sdk_error(err)),
        };

        let arn = result.role().and_then(|role| role.arn()).map(str::to_string);
        return Ok(arn);
    }

    async fn create_role(&self, request: &RoleRequest) -> Result<String, ApiError> {
        let result = self
            .client
            .create_role()
            .role_name(&request.name)
            .assume_role_policy_document(&request.trust_policy)
            .description(&request.description)
            .set_tags(Some(tags(&request.tags)))
            .send()
            .await
            .map_err(map_sdk_error)?;

        match result.role().and_then(|role| role.arn()) {
            Some(arn) => Ok(arn.to_string()),
            None => Err(ApiError::UnknownError(format!(
                "no ARN returned for role {}",
                request.name
            ))),
        }
    }

    async fn replace_trust_policy(&self, role_name: &str, document: &str) -> Result<(), ApiError> {
        self.client
            .update_assume_role_policy()
            .role_name(role_name)
            .policy_document(document)
            .send()
            .await
            .map_err(map_sdk_error)?;

        return Ok(());
    }

    async fn put_inline_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        document: &str,
    ) -> Result<(), ApiError> {
        self.client
            .put_role_policy()
            .role_name(role_name)
            .policy_name(policy_name)
            .policy_document(document)
            .send()
            .await
            .map_err(map_sdk_error)?;

        return Ok(());
    }
}
