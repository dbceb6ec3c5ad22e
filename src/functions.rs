//! Cloud function inventory
//!
//! Read-only view of the AWS Lambda API: list every function (with tags) or
//! fetch one by ARN. Tags drive mesh registration, and the list API does not
//! return them, so listing resolves each function individually.

use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::warn;

use crate::error::{Error, Result};

/// One cloud function and the tags that drive its mesh registration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LambdaFunction {
    /// Fully qualified function ARN
    pub arn: String,
    /// Function name; the default mesh service name
    pub name: String,
    /// Resource tags
    pub tags: HashMap<String, String>,
}

/// Function inventory operations used by the registrator.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FunctionClient: Send + Sync {
    /// Fetch one function (with tags) by ARN.
    async fn get_function(&self, arn: &str) -> Result<LambdaFunction>;

    /// List every function, keyed by ARN.
    ///
    /// A failure to resolve one function's tags skips that function (the
    /// next sync retries it); only a failure of the listing itself is an
    /// error.
    async fn list_functions(&self) -> Result<HashMap<String, LambdaFunction>>;
}

/// AWS Lambda implementation of [`FunctionClient`].
pub struct LambdaApiClient {
    client: aws_sdk_lambda::Client,
    page_size: i32,
}

impl LambdaApiClient {
    /// Create a client from shared SDK config with the given listing page
    /// size.
    pub fn new(sdk_config: &aws_config::SdkConfig, page_size: i32) -> Self {
        Self {
            client: aws_sdk_lambda::Client::new(sdk_config),
            page_size,
        }
    }

    /// Create from a pre-built client (for testing).
    pub fn from_client(client: aws_sdk_lambda::Client, page_size: i32) -> Self {
        Self { client, page_size }
    }
}

#[async_trait]
impl FunctionClient for LambdaApiClient {
    async fn get_function(&self, arn: &str) -> Result<LambdaFunction> {
        let out = self
            .client
            .get_function()
            .function_name(arn)
            .send()
            .await
            .map_err(|err| Error::functions(format!("failed to get function {arn}: {err}")))?;

        let configuration = out
            .configuration()
            .ok_or_else(|| Error::functions(format!("function {arn} has no configuration")))?;

        Ok(LambdaFunction {
            arn: configuration.function_arn().unwrap_or_default().to_string(),
            name: configuration.function_name().unwrap_or_default().to_string(),
            tags: out.tags().cloned().unwrap_or_default(),
        })
    }

    async fn list_functions(&self) -> Result<HashMap<String, LambdaFunction>> {
        let mut functions = HashMap::new();

        let mut pages = self
            .client
            .list_functions()
            .max_items(self.page_size)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page
                .map_err(|err| Error::functions(format!("failed to list functions: {err}")))?;
            for summary in page.functions() {
                let Some(arn) = summary.function_arn() else {
                    continue;
                };
                match self.get_function(arn).await {
                    Ok(function) => {
                        functions.insert(function.arn.clone(), function);
                    }
                    Err(err) => {
                        // Skipped functions are retried on the next sync.
                        warn!(arn = %arn, error = %err, "failed to resolve function tags");
                    }
                }
            }
        }

        Ok(functions)
    }
}
