//! Probe-then-write reconciliation shared by every managed resource.
//!
//! A [`Resource`] knows how to look itself up, create itself and bring an
//! existing copy up to date. [`ensure`] runs that sequence once; it never
//! retries, so a rerun of the whole setup is the recovery path.

use async_trait::async_trait;
use serde::Serialize;

#[async_trait]
pub trait Resource: Send + Sync {
    type Id: Send;
    type Error: Send;

    /// Human readable identity used in log lines.
    fn describe(&self) -> String;

    async fn find(&self) -> Result<Option<Self::Id>, Self::Error>;

    async fn create(&self) -> Result<Self::Id, Self::Error>;

    async fn update(&self, existing: Self::Id) -> Result<Self::Id, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "id", rename_all = "snake_case")]
pub enum Outcome<T> {
    Created(T),
    Updated(T),
}

impl<T> Outcome<T> {
    pub fn id(&self) -> &T {
        match self {
            Outcome::Created(id) | Outcome::Updated(id) => id,
        }
    }

    pub fn into_id(self) -> T {
        match self {
            Outcome::Created(id) | Outcome::Updated(id) => id,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Outcome::Created(_))
    }
}

pub async fn ensure<R: Resource>(resource: &R) -> Result<Outcome<R::Id>, R::Error> {
    let outcome = match resource.find().await? {
        Some(existing) => {
            tracing::debug!(resource = %resource.describe(), "exists, updating in place");
            Outcome::Updated(resource.update(existing).await?)
        }
        None => {
            tracing::debug!(resource = %resource.describe(), "absent, creating");
            Outcome::Created(resource.create().await?)
        }
    };

    tracing::info!(
        resource = %resource.describe(),
        created = outcome.was_created(),
        "reconciled"
    );
    return Ok(outcome);
}
