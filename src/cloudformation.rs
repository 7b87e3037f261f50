use std::time::Duration;

use aws_config::meta::region::RegionProviderChain;
use aws_sdk_cloudformation::model::{Capability, Output};
use aws_sdk_cloudformation::types::SdkError;
use aws_types::region::Region;
use log::{debug, info, warn};

use crate::config::ConfigEntry;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),

    #[error("Stack not found: {0}")]
    NotFoundError(String),

    #[error("No region configured for stack {0}, set it in the config or the environment")]
    MissingRegion(String),

    #[error("Stack {stack} ended in {status}: {reason}")]
    FailedStatus {
        stack: String,
        status: String,
        reason: String,
    },
}

/// What a deploy call did to the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deployment {
    Created(String),
    Updated(String),
    Unchanged,
}

pub struct StackClient {
    pub stack_name: String,

    client: aws_sdk_cloudformation::Client,
}

impl StackClient {
    pub async fn new(config_entry: &ConfigEntry) -> Result<Self, Error> {
        let stack_name = config_entry.name().to_string();

        let region = match config_entry.region.as_ref() {
            Some(provided_region) => Region::new(provided_region.clone()),
            None => match RegionProviderChain::default_provider().region().await {
                Some(region) => region,
                None => return Err(Error::MissingRegion(stack_name)),
            },
        };

        debug!("{}: using region {}", stack_name, region);
        let sdk_config = aws_config::from_env().region(region).load().await;
        let client = aws_sdk_cloudformation::Client::new(&sdk_config);

        return Ok(Self { stack_name, client });
    }

    /// Ask CloudFormation to check the template, returns its description
    pub async fn validate(&self, template_body: &str) -> Result<Option<String>, Error> {
        let result = self
            .client
            .validate_template()
            .template_body(template_body)
            .send()
            .await;

        let result = match result {
            Ok(data) => data,
            Err(SdkError::ServiceError { err, .. }) => {
                return Err(Error::ServiceError(err.to_string()));
            }
            Err(err) => return Err(Error::UnknownError(err.to_string())),
        };

        return Ok(result.description().map(str::to_string));
    }

    async fn describe(&self) -> Result<Option<aws_sdk_cloudformation::model::Stack>, Error> {
        let result = self
            .client
            .describe_stacks()
            .stack_name(&self.stack_name)
            .send()
            .await;

        let result = match result {
            Ok(data) => data,
            // Missing stacks are reported as a validation error
            Err(SdkError::ServiceError { err, .. })
                if err.message().unwrap_or_default().contains("does not exist") =>
            {
                return Ok(None);
            }
            Err(SdkError::ServiceError { err, .. }) => {
                return Err(Error::ServiceError(err.to_string()));
            }
            Err(err) => return Err(Error::UnknownError(err.to_string())),
        };

        let stacks = result.stacks().unwrap_or_else(|| &[]);
        return Ok(stacks.first().cloned());
    }

    pub async fn exists(&self) -> Result<bool, Error> {
        Ok(self.describe().await?.is_some())
    }

    /// Create the stack or update it in place
    pub async fn deploy(&self, template_body: &str) -> Result<Deployment, Error> {
        if !self.exists().await? {
            let result = self
                .client
                .create_stack()
                .stack_name(&self.stack_name)
                .template_body(template_body)
                .capabilities(Capability::CapabilityIam)
                .send()
                .await;

            return match result {
                Ok(data) => Ok(Deployment::Created(
                    data.stack_id().unwrap_or_default().to_string(),
                )),
                Err(SdkError::ServiceError { err, .. }) => Err(Error::ServiceError(err.to_string())),
                Err(err) => Err(Error::UnknownError(err.to_string())),
            };
        }

        let result = self
            .client
            .update_stack()
            .stack_name(&self.stack_name)
            .template_body(template_body)
            .capabilities(Capability::CapabilityIam)
            .send()
            .await;

        return match result {
            Ok(data) => Ok(Deployment::Updated(
                data.stack_id().unwrap_or_default().to_string(),
            )),
            Err(SdkError::ServiceError { err, .. })
                if err
                    .message()
                    .unwrap_or_default()
                    .contains("No updates are to be performed") =>
            {
                warn!("{}: template is unchanged, nothing to update", self.stack_name);
                Ok(Deployment::Unchanged)
            }
            Err(SdkError::ServiceError { err, .. }) => Err(Error::ServiceError(err.to_string())),
            Err(err) => Err(Error::UnknownError(err.to_string())),
        };
    }

    pub async fn destroy(&self) -> Result<(), Error> {
        let result = self
            .client
            .delete_stack()
            .stack_name(&self.stack_name)
            .send()
            .await;

        return match result {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError { err, .. }) => Err(Error::ServiceError(err.to_string())),
            Err(err) => Err(Error::UnknownError(err.to_string())),
        };
    }

    /// Poll until the stack settles, fails unless it lands in one of `expected`
    ///
    /// A stack that no longer exists counts as DELETE_COMPLETE.
    pub async fn wait(&self, expected: &[&str]) -> Result<String, Error> {
        loop {
            let stack = match self.describe().await? {
                Some(stack) => stack,
                None => return settled(&self.stack_name, "DELETE_COMPLETE", "", expected),
            };

            let status = stack
                .stack_status()
                .map(|status| status.as_str().to_string())
                .unwrap_or_default();

            if !status.ends_with("_IN_PROGRESS") {
                let reason = stack.stack_status_reason().unwrap_or_default();
                return settled(&self.stack_name, &status, reason, expected);
            }

            info!("{}: {}", self.stack_name, status);
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn get_outputs(&self) -> Result<Vec<Output>, Error> {
        let stack = match self.describe().await? {
            Some(stack) => stack,
            None => return Err(Error::NotFoundError(self.stack_name.clone())),
        };

        let outputs = stack.outputs().unwrap_or_else(|| &[]).to_vec();

        return Ok(outputs);
    }
}

fn settled(stack: &str, status: &str, reason: &str, expected: &[&str]) -> Result<String, Error> {
    if expected.contains(&status) {
        return Ok(status.to_string());
    }

    Err(Error::FailedStatus {
        stack: stack.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
    })
}
