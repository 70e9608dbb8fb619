//! Error types shared by every kernel subsystem

use core::fmt;

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors that can occur in kernel operations
///
/// Every fallible operation in the network stack and the scheduler returns
/// one of these kinds. Link and IP layers usually swallow packet-level
/// errors (drop + counter) instead of propagating them; socket-level and
/// scheduler-control calls return them to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Parameter out of range or structurally wrong
    InvalidArgument,

    /// Route/socket/task/ARP entry absent
    NotFound,

    /// Unknown socket handle
    BadDescriptor,

    /// Operation requires an established connection
    NotConnected,

    /// Operation rejects an established connection
    AlreadyConnected,

    /// Bind collision without REUSEADDR
    AddressInUse,

    /// Ephemeral port pool exhausted
    AddressNotAvailable,

    /// Non-blocking path with no progress possible
    WouldBlock,

    /// IPv4 DF set and fragmentation needed
    MessageTooBig,

    /// No route to the destination
    HostUnreachable,

    /// Peer sent RST on an established connection
    ConnectionReset,

    /// Segment arrived for a closed port
    ConnectionRefused,

    /// Checksum failure, state-machine violation, malformed header
    ProtocolError,

    /// Unknown socket option
    NoProtoOption,

    /// Table full, queue full, out of memory
    ResourceExhausted,

    /// Operation exceeded its deadline
    Timeout,

    /// Invariant broken inside the kernel
    Internal,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::NotFound => write!(f, "not found"),
            KernelError::BadDescriptor => write!(f, "bad descriptor"),
            KernelError::NotConnected => write!(f, "not connected"),
            KernelError::AlreadyConnected => write!(f, "already connected"),
            KernelError::AddressInUse => write!(f, "address in use"),
            KernelError::AddressNotAvailable => write!(f, "address not available"),
            KernelError::WouldBlock => write!(f, "operation would block"),
            KernelError::MessageTooBig => write!(f, "message too big"),
            KernelError::HostUnreachable => write!(f, "host unreachable"),
            KernelError::ConnectionReset => write!(f, "connection reset"),
            KernelError::ConnectionRefused => write!(f, "connection refused"),
            KernelError::ProtocolError => write!(f, "protocol error"),
            KernelError::NoProtoOption => write!(f, "unknown protocol option"),
            KernelError::ResourceExhausted => write!(f, "resource exhausted"),
            KernelError::Timeout => write!(f, "operation timed out"),
            KernelError::Internal => write!(f, "internal invariant broken"),
        }
    }
}

impl std::error::Error for KernelError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", KernelError::WouldBlock), "operation would block");
        assert_eq!(format!("{}", KernelError::HostUnreachable), "host unreachable");
    }

    #[test]
    fn test_error_in_result() {
        fn failing() -> KernelResult<()> {
            Err(KernelError::NotFound)
        }
        assert_eq!(failing(), Err(KernelError::NotFound));
    }
}
