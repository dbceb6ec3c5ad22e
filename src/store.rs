//! Secure parameter store access
//!
//! The registrator writes each managed service's mTLS material here and the
//! extension reads it back. Values are stored encrypted; anything larger
//! than the standard-tier limit is promoted to the advanced tier.

use async_trait::async_trait;
use aws_sdk_ssm::error::SdkError;
use aws_sdk_ssm::types::{ParameterTier, ParameterType};
#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Largest value the standard parameter tier accepts, in bytes.
const STANDARD_TIER_MAX_BYTES: usize = 4096;

/// Key/value store for JSON blobs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ParamStore: Send + Sync {
    /// Get the decrypted value for the given key.
    async fn get(&self, key: &str) -> Result<String>;

    /// Write the value for the given key, overwriting any existing value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove the value for the given key. Removing a key that does not
    /// exist is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Pick the storage tier for a value of the given size.
fn tier_for(len: usize) -> ParameterTier {
    if len > STANDARD_TIER_MAX_BYTES {
        ParameterTier::Advanced
    } else {
        ParameterTier::Standard
    }
}

/// AWS Systems Manager Parameter Store client.
pub struct SsmStore {
    client: aws_sdk_ssm::Client,
}

impl SsmStore {
    /// Create a store client from shared SDK config.
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_ssm::Client::new(sdk_config),
        }
    }

    /// Create from a pre-built client (for testing).
    pub fn from_client(client: aws_sdk_ssm::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ParamStore for SsmStore {
    async fn get(&self, key: &str) -> Result<String> {
        let out = self
            .client
            .get_parameter()
            .name(key)
            .with_decryption(true)
            .send()
            .await
            .map_err(|err| Error::store(format!("failed to get parameter {key}: {err}")))?;

        out.parameter()
            .and_then(|p| p.value())
            .map(str::to_string)
            .ok_or_else(|| Error::store(format!("parameter store value does not exist for {key}")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.client
            .put_parameter()
            .name(key)
            .value(value)
            .overwrite(true)
            .r#type(ParameterType::SecureString)
            .tier(tier_for(value.len()))
            .send()
            .await
            .map_err(|err| Error::store(format!("failed to put parameter {key}: {err}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.client.delete_parameter().name(key).send().await {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(se)) if se.err().is_parameter_not_found() => Ok(()),
            Err(err) => Err(Error::store(format!(
                "failed to delete parameter {key}: {err}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_tier_up_to_the_limit() {
        assert_eq!(tier_for(0), ParameterTier::Standard);
        assert_eq!(tier_for(STANDARD_TIER_MAX_BYTES), ParameterTier::Standard);
    }

    #[test]
    fn advanced_tier_above_the_limit() {
        assert_eq!(tier_for(STANDARD_TIER_MAX_BYTES + 1), ParameterTier::Advanced);
    }
}
