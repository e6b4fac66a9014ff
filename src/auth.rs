//! Node credentials carried in call metadata.
//!
//! Every authenticated call carries exactly one `node-urn` value and exactly
//! one `node-secret` value. Anything else is rejected before the registry is
//! consulted.

use tonic::metadata::{AsciiMetadataValue, MetadataMap};

use crate::error::{DispatchError, Result};

/// Metadata key holding the node identity.
pub const NODE_URN_HEADER: &str = "node-urn";

/// Metadata key holding the shared secret.
pub const NODE_SECRET_HEADER: &str = "node-secret";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub urn: String,
    pub secret: String,
}

// Keeps the secret out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("urn", &self.urn)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(urn: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            urn: urn.into(),
            secret: secret.into(),
        }
    }

    /// Extract credentials from inbound call metadata.
    pub fn from_metadata(metadata: &MetadataMap) -> Result<Self> {
        let urn = single_value(metadata, NODE_URN_HEADER)?;
        let secret = single_value(metadata, NODE_SECRET_HEADER)?;
        Ok(Self { urn, secret })
    }

    /// Attach these credentials to outbound call metadata.
    pub fn apply(&self, metadata: &mut MetadataMap) -> Result<()> {
        let urn = AsciiMetadataValue::try_from(self.urn.as_str())
            .map_err(|_| DispatchError::Auth(format!("{} is not valid ASCII", NODE_URN_HEADER)))?;
        let secret = AsciiMetadataValue::try_from(self.secret.as_str()).map_err(|_| {
            DispatchError::Auth(format!("{} is not valid ASCII", NODE_SECRET_HEADER))
        })?;
        metadata.insert(NODE_URN_HEADER, urn);
        metadata.insert(NODE_SECRET_HEADER, secret);
        Ok(())
    }
}

fn single_value(metadata: &MetadataMap, key: &'static str) -> Result<String> {
    let mut values = metadata.get_all(key).iter();
    let value = match (values.next(), values.next()) {
        (Some(value), None) => value,
        (None, _) => return Err(DispatchError::Auth(format!("missing {} header", key))),
        (Some(_), Some(_)) => {
            return Err(DispatchError::Auth(format!("multiple {} headers", key)));
        }
    };

    value
        .to_str()
        .map(str::to_owned)
        .map_err(|_| DispatchError::Auth(format!("invalid {} header", key)))
}
