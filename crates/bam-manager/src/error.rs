/// Errors returned by BAM registry, connection and pipe operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BamError {
    /// The driver has not finished initialization. Callers may retry later.
    NotReady,
    /// A null, zero or out-of-range input.
    InvalidArgument,
    /// The handle or physical address does not resolve to a device.
    NotFound,
    /// A device with the same physical address is already registered.
    AlreadyExists,
    /// The endpoint does not own the pipe it claims.
    OwnershipViolation,
    /// The endpoint is not connected to any device.
    NotConnected,
    /// The connection map does not name this endpoint for its role.
    CorruptState,
    /// A transfer descriptor failed admission control.
    InvalidDescriptor,
    /// An allocator or resource manager ran out of resources.
    ResourceExhausted,
    /// `n` devices are still registered and the driver cannot be torn down.
    InUse(usize),
    /// A collaborator failed for a reason not otherwise classified.
    Failure,
}

impl BamError {
    /// `true` for errors that only mean "not yet", as opposed to a hard
    /// failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BamError::NotReady)
    }
}

impl core::fmt::Display for BamError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BamError::NotReady => write!(f, "driver is not ready"),
            BamError::InvalidArgument => write!(f, "invalid argument"),
            BamError::NotFound => write!(f, "device not found"),
            BamError::AlreadyExists => write!(f, "device already registered"),
            BamError::OwnershipViolation => {
                write!(f, "client is not the owner of the pipe")
            }
            BamError::NotConnected => write!(f, "endpoint is not connected"),
            BamError::CorruptState => write!(f, "client context is corrupt"),
            BamError::InvalidDescriptor => {
                write!(f, "transfer descriptor rejected")
            }
            BamError::ResourceExhausted => write!(f, "resources exhausted"),
            BamError::InUse(n) => {
                write!(f, "{} devices are still registered", n)
            }
            BamError::Failure => write!(f, "operation failed"),
        }
    }
}
