//! The seam between the runtime and a vendor connector.
//!
//! A connector implements [`CapabilityProvider`] once for its device
//! family; the bridge owns scheduling, ordering, validation, and
//! publication.

use async_trait::async_trait;
use thiserror::Error;

use devbridge_broker::payload::Values;
use devbridge_broker::{DeviceId, ErrorCode, ErrorObject};

use crate::model::DeviceDescriptor;

/// Failure reported by a provider for one device operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    /// Whether repeating the same request may succeed.
    pub retriable: bool,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }

    pub fn to_error_object(&self) -> ErrorObject {
        ErrorObject::new(ErrorCode::ProviderError, &self.message).retriable(self.retriable)
    }
}

#[async_trait]
pub trait CapabilityProvider: Send + Sync + 'static {
    /// Read the device. May return a partial map; absent fields keep
    /// their cached value.
    async fn get_state(&self, device: &DeviceDescriptor) -> Result<Values, ProviderError>;

    /// Apply already-validated values. Returns the values the device now
    /// reports for the touched fields; an empty map means "as requested".
    async fn apply_command(
        &self,
        device: &DeviceDescriptor,
        values: &Values,
    ) -> Result<Values, ProviderError>;

    /// Called once a parasitic device's required data has been resolved.
    async fn bind_parasite(&self, device: &DeviceId, resolved: &Values) -> Result<(), ProviderError> {
        let _ = (device, resolved);
        Ok(())
    }
}
