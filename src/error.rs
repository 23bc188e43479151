use std::time::Duration;

/// Errors raised while talking to a JBD BMS.
///
/// Every protocol fault names the register that was requested and, where
/// one was received, the raw frame that caused it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Writing the request to the transport failed. The request was aborted.
    #[error("Cannot write request for register {register:#04X}: {source}")]
    TransportWrite {
        register: u8,
        #[source]
        source: std::io::Error,
    },
    /// The frame checksum disagrees with its payload.
    #[error("Checksum mismatch in response to register {register:#04X}: {frame:02X?}")]
    ChecksumMismatch { register: u8, frame: Vec<u8> },
    /// The frame is too short, badly delimited, echoes the wrong register or
    /// its fields point outside the frame.
    #[error("Malformed response to register {register:#04X} ({reason}): {frame:02X?}")]
    MalformedFrame {
        register: u8,
        reason: String,
        frame: Vec<u8>,
    },
    /// No complete frame arrived within the configured window.
    #[error("No response to register {register:#04X} within {elapsed:?}")]
    Timeout { register: u8, elapsed: Duration },
    /// The register id is not one this crate can decode.
    #[error("Unsupported register {0:#04X}")]
    UnsupportedRegister(u8),
    /// Reading the response failed or the transport closed while a request
    /// was outstanding.
    #[error("Cannot read response to register {register:#04X}: {source}")]
    TransportRead {
        register: u8,
        #[source]
        source: std::io::Error,
    },
    /// The serial port could not be opened or configured.
    #[cfg(feature = "tokio-serial-async")]
    #[error("Serial port error: {0}")]
    TokioSerial(#[from] tokio_serial::Error),
}

impl Error {
    /// True for failures of an exchange with the device, false for errors
    /// the caller caused or that happened outside a request.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            Error::TransportWrite { .. }
                | Error::ChecksumMismatch { .. }
                | Error::MalformedFrame { .. }
                | Error::Timeout { .. }
                | Error::TransportRead { .. }
        )
    }

    pub(crate) fn malformed(register: u8, reason: impl Into<String>, frame: &[u8]) -> Self {
        Error::MalformedFrame {
            register,
            reason: reason.into(),
            frame: frame.to_vec(),
        }
    }
}
