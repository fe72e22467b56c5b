//! Thin adapters from the AWS SDK clients to the traits the rest of the
//! crate programs against.

use aws_config::meta::region::RegionProviderChain;
use aws_config::profile::{ProfileFileCredentialsProvider, ProfileFileRegionProvider};
use aws_types::region::Region;
use aws_types::SdkConfig;

pub mod cloudformation;
pub mod iam;
pub mod ssm;

pub use cloudformation::CloudFormationClient;
pub use iam::IamClient;
pub use ssm::SsmClient;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),

    #[error("{0} not found")]
    NotFoundError(String),
}

/// Region and credentials for one account, handed to each client
/// explicitly instead of being read from a process-wide profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwsContext {
    pub region: Option<String>,
    pub profile: Option<String>,
}

impl AwsContext {
    pub fn new(region: Option<String>, profile: Option<String>) -> Self {
        Self { region, profile }
    }

    /// Region precedence: the explicit region, then the named profile's
    /// region, then the default chain.
    pub async fn load(&self) -> SdkConfig {
        let mut region = RegionProviderChain::first_try(self.region.clone().map(Region::new));
        if let Some(profile) = &self.profile {
            region = region.or_else(
                ProfileFileRegionProvider::builder()
                    .profile_name(profile)
                    .build(),
            );
        }

        let mut loader = aws_config::from_env().region(region.or_default_provider());
        if let Some(profile) = &self.profile {
            let credentials = ProfileFileCredentialsProvider::builder()
                .profile_name(profile)
                .build();
            loader = loader.credentials_provider(credentials);
        }

        return loader.load().await;
    }
}

pub(crate) fn map_sdk_error<E, R>(error: aws_sdk_cloudformation::types::SdkError<E, R>) -> ApiError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match error {
        aws_sdk_cloudformation::types::SdkError::ServiceError { err, .. } => {
            ApiError::ServiceError(err.to_string())
        }
        err => ApiError::UnknownError(err.to_string()),
    }
}
