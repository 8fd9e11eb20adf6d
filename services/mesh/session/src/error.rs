//! Engine error taxonomy

use mesh_crypto::CryptoError;
use mesh_storage::{AllocationError, StorageError};
use mesh_wire::{CodecError, FailureCode, WireError};
use thiserror::Error;

use crate::provisioning::ProvisioningError;

/// Errors surfaced by the mesh engine
#[derive(Error, Debug)]
pub enum MeshError {
    /// Peer sent something the protocol does not allow here
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// MIC or confirmation check failed
    #[error("authentication failure")]
    AuthenticationFailure,

    /// The 24-bit sequence space of a source is used up
    #[error("sequence numbers exhausted for {0:#06x}")]
    SequenceExhausted(u16),

    /// No contiguous unicast block is free
    #[error("no free unicast addresses for {0} elements")]
    AddressSpaceExhausted(u8),

    /// Key unknown or bound to another network key
    #[error("key mismatch: {0}")]
    KeyMismatch(String),

    /// A provisioning session is already running
    #[error("provisioning session busy")]
    SessionBusy,

    /// Retransmissions or a provisioning step ran out of time
    #[error("transport timeout")]
    TransportTimeout,

    /// Acknowledged message got no matching response in time
    #[error("no response")]
    NoResponse,

    /// Operation cancelled by the caller
    #[error("cancelled")]
    Cancelled,

    /// Local node has no network keys or address yet
    #[error("not provisioned")]
    NotProvisioned,

    /// Device aborted provisioning with a Failed PDU
    #[error("device reported provisioning failure {0:?}")]
    RemoteFailure(FailureCode),

    /// Bearer write failed
    #[error("bearer error: {0}")]
    Bearer(String),

    /// Persistence failed
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Range allocation failed
    #[error("allocation error: {0}")]
    Allocation(AllocationError),

    /// Invalid argument or state
    #[error("invalid: {0}")]
    Invalid(String),
}

impl MeshError {
    /// Machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            MeshError::ProtocolViolation(_) => "protocol_violation",
            MeshError::AuthenticationFailure => "authentication_failure",
            MeshError::SequenceExhausted(_) => "sequence_exhausted",
            MeshError::AddressSpaceExhausted(_) => "address_space_exhausted",
            MeshError::KeyMismatch(_) => "key_mismatch",
            MeshError::SessionBusy => "session_busy",
            MeshError::TransportTimeout => "transport_timeout",
            MeshError::NoResponse => "no_response",
            MeshError::Cancelled => "cancelled",
            MeshError::NotProvisioned => "not_provisioned",
            MeshError::RemoteFailure(_) => "remote_failure",
            MeshError::Bearer(_) => "bearer",
            MeshError::Storage(_) => "storage",
            MeshError::Allocation(_) => "allocation",
            MeshError::Invalid(_) => "invalid",
        }
    }
}

impl From<AllocationError> for MeshError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::AddressSpaceExhausted { element_count } => {
                MeshError::AddressSpaceExhausted(element_count)
            }
            other => MeshError::Allocation(other),
        }
    }
}

impl From<StorageError> for MeshError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Allocation(alloc) => alloc.into(),
            other => MeshError::Storage(other),
        }
    }
}

impl From<CryptoError> for MeshError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailure => MeshError::AuthenticationFailure,
            other => MeshError::Invalid(other.to_string()),
        }
    }
}

impl From<WireError> for MeshError {
    fn from(err: WireError) -> Self {
        MeshError::ProtocolViolation(err.to_string())
    }
}

impl From<CodecError> for MeshError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Crypto(crypto) => crypto.into(),
            CodecError::Wire(wire) => MeshError::Invalid(wire.to_string()),
            other => MeshError::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<ProvisioningError> for MeshError {
    fn from(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::Remote(code) => MeshError::RemoteFailure(code),
            ProvisioningError::ConfirmationFailed => MeshError::AuthenticationFailure,
            ProvisioningError::Crypto(CryptoError::AuthenticationFailure) => {
                MeshError::AuthenticationFailure
            }
            other => MeshError::ProtocolViolation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_mapping() {
        let err: MeshError = StorageError::Allocation(AllocationError::AddressSpaceExhausted {
            element_count: 3,
        })
        .into();
        assert!(matches!(err, MeshError::AddressSpaceExhausted(3)));
        assert_eq!(err.reason(), "address_space_exhausted");
    }

    #[test]
    fn test_provisioning_mapping() {
        let err: MeshError = ProvisioningError::ConfirmationFailed.into();
        assert!(matches!(err, MeshError::AuthenticationFailure));

        let err: MeshError = ProvisioningError::Remote(FailureCode::OutOfResources).into();
        assert_eq!(err.reason(), "remote_failure");

        let err: MeshError = ProvisioningError::Malformed(WireError::Incomplete).into();
        assert_eq!(err.reason(), "protocol_violation");
    }
}
