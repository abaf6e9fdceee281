use std::{error::Error, fmt};

use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, CONTROLS};
use tracing::{debug, trace};

use crate::metadata::{MetadataMap, GRPC_MESSAGE, GRPC_STATUS};

// Bytes percent-encoded inside `grpc-message`, per the gRPC HTTP/2 mapping.
const ENCODE_SET: &AsciiSet = &CONTROLS.add(b'%');

/// A "status" describing the result of a call.
///
/// Every call terminates with a trailer carrying a `Status`; a non-[`Code::Ok`]
/// status is surfaced to the caller as an error.
#[derive(Clone)]
pub struct Status {
    /// The status code, carried in the `grpc-status` trailer.
    code: Code,
    /// A relevant error message, carried in the `grpc-message` trailer.
    message: String,
}

/// Status codes used by [`Status`], mirroring the gRPC code table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

// ===== impl Status =====

impl Status {
    /// Create a new `Status` with the associated code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
        }
    }

    /// The operation completed successfully.
    pub fn ok(message: impl Into<String>) -> Status {
        Status::new(Code::Ok, message)
    }

    /// The operation was cancelled, typically by the caller.
    pub fn cancelled(message: impl Into<String>) -> Status {
        Status::new(Code::Cancelled, message)
    }

    /// The client specified an invalid argument.
    pub fn invalid_argument(message: impl Into<String>) -> Status {
        Status::new(Code::InvalidArgument, message)
    }

    /// The deadline expired before the operation could complete.
    pub fn deadline_exceeded(message: impl Into<String>) -> Status {
        Status::new(Code::DeadlineExceeded, message)
    }

    /// Some requested entity was not found.
    pub fn not_found(message: impl Into<String>) -> Status {
        Status::new(Code::NotFound, message)
    }

    /// The entity that a client attempted to create already exists.
    pub fn already_exists(message: impl Into<String>) -> Status {
        Status::new(Code::AlreadyExists, message)
    }

    /// Some resource has been exhausted.
    pub fn resource_exhausted(message: impl Into<String>) -> Status {
        Status::new(Code::ResourceExhausted, message)
    }

    /// The system is not in a state required for the operation.
    pub fn failed_precondition(message: impl Into<String>) -> Status {
        Status::new(Code::FailedPrecondition, message)
    }

    /// The operation is not implemented or not supported.
    pub fn unimplemented(message: impl Into<String>) -> Status {
        Status::new(Code::Unimplemented, message)
    }

    /// An internal invariant was broken.
    pub fn internal(message: impl Into<String>) -> Status {
        Status::new(Code::Internal, message)
    }

    /// The service is currently unavailable.
    pub fn unavailable(message: impl Into<String>) -> Status {
        Status::new(Code::Unavailable, message)
    }

    /// Extract a `Status` from an arbitrary error, walking source chains.
    pub fn from_error(err: &(dyn Error + 'static)) -> Status {
        Status::try_from_error(err).unwrap_or_else(|| Status::new(Code::Unknown, err.to_string()))
    }

    fn try_from_error(err: &(dyn Error + 'static)) -> Option<Status> {
        let mut cause = Some(err);

        while let Some(err) = cause {
            if let Some(status) = err.downcast_ref::<Status>() {
                return Some(status.clone());
            }

            cause = err.source();
        }

        None
    }

    /// Get the [`Code`] of this `Status`.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the text error message of this `Status`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Extract a status from trailer metadata, if one is present.
    pub fn from_metadata(metadata: &MetadataMap) -> Option<Status> {
        metadata.get(GRPC_STATUS).map(|code| {
            let code = Code::from_bytes(code.as_bytes());
            let message = metadata
                .get(GRPC_MESSAGE)
                .map(|raw| match percent_decode_str(raw).decode_utf8() {
                    Ok(cow) => cow.into_owned(),
                    Err(err) => {
                        debug!("error decoding grpc-message: {}", err);
                        raw.to_string()
                    }
                })
                .unwrap_or_default();
            Status { code, message }
        })
    }

    /// Render this status as trailer metadata.
    pub fn to_metadata(&self) -> MetadataMap {
        let mut metadata = MetadataMap::with_capacity(2);
        self.add_to(&mut metadata);
        metadata
    }

    /// Insert the `grpc-status` and `grpc-message` entries into `metadata`.
    pub fn add_to(&self, metadata: &mut MetadataMap) {
        metadata.insert(GRPC_STATUS, (self.code as i32).to_string());
        if !self.message.is_empty() {
            metadata.insert(
                GRPC_MESSAGE,
                percent_encode(self.message.as_bytes(), ENCODE_SET).to_string(),
            );
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A manual impl to reduce the noise of frequently empty fields.
        let mut builder = f.debug_struct("Status");

        builder.field("code", &self.code);

        if !self.message.is_empty() {
            builder.field("message", &self.message);
        }

        builder.finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status: {:?}, message: {:?}",
            self.code(),
            self.message()
        )
    }
}

impl Error for Status {}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        Status::new(Code::Unavailable, err.to_string())
    }
}

/// Take the `Status` from `trailers` if one is present, mapping its absence
/// to an error: a stream that ends without a status did not terminate
/// cleanly.
pub(crate) fn infer_status(trailers: Option<&MetadataMap>) -> Result<(), Status> {
    if let Some(trailers) = trailers {
        if let Some(status) = Status::from_metadata(trailers) {
            if status.code() == Code::Ok {
                return Ok(());
            }
            return Err(status);
        }
    }
    trace!("trailers missing grpc-status");
    Err(Status::internal("stream ended without grpc-status"))
}

// ===== impl Code =====

impl Code {
    /// Get the `Code` that represents the integer, if known.
    ///
    /// If not known, returns `Code::Unknown`.
    pub fn from_i32(i: i32) -> Code {
        Code::from(i)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Code {
        match bytes.len() {
            1 => match bytes[0] {
                b'0' => Code::Ok,
                b'1' => Code::Cancelled,
                b'2' => Code::Unknown,
                b'3' => Code::InvalidArgument,
                b'4' => Code::DeadlineExceeded,
                b'5' => Code::NotFound,
                b'6' => Code::AlreadyExists,
                b'7' => Code::PermissionDenied,
                b'8' => Code::ResourceExhausted,
                b'9' => Code::FailedPrecondition,
                _ => Code::parse_err(),
            },
            2 => match (bytes[0], bytes[1]) {
                (b'1', b'0') => Code::Aborted,
                (b'1', b'1') => Code::OutOfRange,
                (b'1', b'2') => Code::Unimplemented,
                (b'1', b'3') => Code::Internal,
                (b'1', b'4') => Code::Unavailable,
                (b'1', b'5') => Code::DataLoss,
                (b'1', b'6') => Code::Unauthenticated,
                _ => Code::parse_err(),
            },
            _ => Code::parse_err(),
        }
    }

    fn parse_err() -> Code {
        trace!("error parsing grpc-status");
        Code::Unknown
    }
}

impl From<i32> for Code {
    fn from(i: i32) -> Self {
        match i {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;

    #[derive(Debug)]
    struct Nested(BoxError);

    impl fmt::Display for Nested {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "nested error: {}", self.0)
        }
    }

    impl std::error::Error for Nested {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&*self.0)
        }
    }

    #[test]
    fn from_error_status() {
        let orig = Status::new(Code::OutOfRange, "out of range");
        let found = Status::from_error(&orig);

        assert_eq!(orig.code(), found.code());
        assert_eq!(orig.message(), found.message());
    }

    #[test]
    fn from_error_nested() {
        let orig = Nested(Box::new(Status::new(Code::OutOfRange, "out of range")));
        let found = Status::from_error(&orig);

        assert_eq!(found.code(), Code::OutOfRange);
        assert_eq!(found.message(), "out of range");
    }

    #[test]
    fn metadata_round_trip_percent_encodes() {
        let orig = Status::internal("naughty \u{1f4a9} message\n");
        let metadata = orig.to_metadata();

        assert_eq!(metadata.get(GRPC_STATUS), Some("13"));
        assert!(!metadata.get(GRPC_MESSAGE).unwrap().contains('\n'));

        let found = Status::from_metadata(&metadata).unwrap();
        assert_eq!(found.code(), Code::Internal);
        assert_eq!(found.message(), orig.message());
    }

    #[test]
    fn code_from_i32_round_trips() {
        for i in 0..=16 {
            let code = Code::from(i);
            assert_eq!(i, code as i32);
        }
        assert_eq!(Code::from(-1), Code::Unknown);
        assert_eq!(Code::from(17), Code::Unknown);
    }
}
