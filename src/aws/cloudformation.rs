use async_trait::async_trait;
use aws_sdk_cloudformation::types::SdkError;
use std::collections::BTreeMap;

use super::{map_sdk_error, ApiError, AwsContext};
use crate::outputs::{CloudFormationApi, ExistingExport};

pub struct CloudFormationClient {
    client: aws_sdk_cloudformation::Client,
}

impl CloudFormationClient {
    pub async fn new(context: &AwsContext) -> Self {
        let sdk_config = context.load().await;
        let client = aws_sdk_cloudformation::Client::new(&sdk_config);

        return Self { client };
    }
}

#[async_trait]
impl CloudFormationApi for CloudFormationClient {
    async fn list_exports(&self) -> Result<Vec<ExistingExport>, ApiError> {
        let mut exports = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let result = self
                .client
                .list_exports()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(map_sdk_error)?;

            for export in result.exports().unwrap_or_else(|| &[]) {
                exports.push(ExistingExport {
                    name: export.name().unwrap_or_default().to_string(),
                    value: export.value().unwrap_or_default().to_string(),
                    exporting_stack_id: export.exporting_stack_id().unwrap_or_default().to_string(),
                });
            }

            match result.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        return Ok(exports);
    }

    async fn stack_outputs(
        &self,
        stack_name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, ApiError> {
        let result = self
            .client
            .describe_stacks()
            .stack_name(stack_name)
            .send()
            .await;

        // A missing stack comes back as a generic validation error.
        let result = match result {
            Ok(data) => data,
            Err(SdkError::ServiceError { err, .. }) if err.to_string().contains("does not exist") => {
                return Ok(None);
            }
            Err(err) => return Err(map_sdk_error(err)),
        };

        let stacks = result.stacks().unwrap_or_else(|| &[]);
        let stack = match stacks.first() {
            Some(stack) => stack,
            None => return Ok(None),
        };

        let outputs = stack
            .outputs()
            .unwrap_or_else(|| &[])
            .iter()
            .filter_map(|output| {
                let key = output.output_key()?;
                let value = output.output_value()?;
                Some((key.to_string(), value.to_string()))
            })
            .collect();

        return Ok(Some(outputs));
    }
}
