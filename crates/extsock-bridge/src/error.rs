use extsock_frame::Opcode;

/// Errors that can occur in bridge operations.
///
/// Apart from [`BridgeError::Terminated`], every variant returned by a
/// running device is fatal: the device records it as its fault and stops.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] extsock_transport::TransportError),

    /// Frame-level error (bad opcode, bad length, I/O).
    #[error("frame error: {0}")]
    Frame(#[from] extsock_frame::FrameError),

    /// A frame arrived that is not valid in the current phase.
    #[error("unexpected {opcode} during {context}")]
    UnexpectedOpcode {
        context: &'static str,
        opcode: Opcode,
    },

    /// The response does not answer the request that was sent.
    #[error("expected {expected} in response to {request}, got {actual}")]
    ResponseMismatch {
        request: Opcode,
        expected: Opcode,
        actual: Opcode,
    },

    /// A response arrived while no synchronous request was outstanding.
    #[error("unsolicited {0} with no request outstanding")]
    UnsolicitedResponse(Opcode),

    /// Region registration was rejected.
    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    /// Registration did not complete in time.
    #[error("registration timed out after {0:?}")]
    RegistrationTimeout(std::time::Duration),

    /// The device process closed the connection.
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// The transport reader thread panicked.
    #[error("transport reader panicked")]
    ReaderPanicked,

    /// The device has been shut down, either by close or after a fault.
    #[error("device terminated")]
    Terminated,
}

pub type Result<T> = std::result::Result<T, BridgeError>;
