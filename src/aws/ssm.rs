use async_trait::async_trait;
use aws_sdk_ssm::model::{ParameterType, Tag};
use aws_sdk_ssm::types::SdkError;
use std::collections::BTreeMap;

use super::{map_sdk_error, ApiError, AwsContext};
use crate::parameters::{Parameter, ParameterApi, ParameterKind};

pub struct SsmClient {
    client: aws_sdk_ssm::Client,
}

impl SsmClient {
    pub async fn new(context: &AwsContext) -> Self {
        let sdk_config = context.load().await;
        let client = aws_sdk_ssm::Client::new(&sdk_config);

        return Self { client };
    }
}

fn parameter_type(kind: ParameterKind) -> ParameterType {
    match kind {
        ParameterKind::Plain => ParameterType::String,
        ParameterKind::Secret => ParameterType::SecureString,
    }
}

#[async_trait]
impl ParameterApi for SsmClient {
    async fn get_parameter(&self, path: &str) -> Result<Option<String>, ApiError> {
        let result = self
            .client
            .get_parameter()
            .name(path)
            .with_decryption(true)
            .send()
            .await;

        let result = match result {
            Ok(data) => data,
            Err(SdkError::ServiceError { err, .. }) if err.is_parameter_not_found() => {
                return Ok(None);
            }
            Err(err) => return Err(map_sdk_error(err)),
        };

        let value = result
            .parameter()
            .and_then(|parameter| parameter.value())
            .map(str::to_string);
        return Ok(value);
    }

    async fn create_parameter(
        &self,
        parameter: &Parameter,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        let tags = tags
            .iter()
            .map(|(key, value)| Tag::builder().key(key).value(value).build())
            .collect();

        self.client
            .put_parameter()
            .name(&parameter.path)
            .value(parameter.value.expose())
            .r#type(parameter_type(parameter.kind()))
            .description(&parameter.description)
            .set_tags(Some(tags))
            .overwrite(false)
            .send()
            .await
            .map_err(map_sdk_error)?;

        return Ok(());
    }

    // SSM refuses tags together with overwrite; the tags from creation stay.
    async fn overwrite_parameter(&self, parameter: &Parameter) -> Result<(), ApiError> {
        self.client
            .put_parameter()
            .name(&parameter.path)
            .value(parameter.value.expose())
            .r#type(parameter_type(parameter.kind()))
            .description(&parameter.description)
            .overwrite(true)
            .send()
            .await
            .map_err(map_sdk_error)?;

        return Ok(());
    }
}
