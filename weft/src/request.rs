use std::time::Duration;

use crate::metadata::MetadataMap;

/// An outbound call or an accepted inbound call, pairing a message (or a
/// stream of messages) with its initial metadata.
#[derive(Debug)]
pub struct Request<T> {
    metadata: MetadataMap,
    timeout: Option<Duration>,
    message: T,
}

impl<T> Request<T> {
    /// Create a new request with empty metadata.
    pub fn new(message: T) -> Self {
        Request {
            metadata: MetadataMap::new(),
            timeout: None,
            message,
        }
    }

    /// Get a reference to the message.
    pub fn get_ref(&self) -> &T {
        &self.message
    }

    /// Get a mutable reference to the message.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.message
    }

    /// Get a reference to the custom request metadata.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// Get a mutable reference to the request metadata.
    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    /// Set a deadline for the call. Encoded as `grpc-timeout` on the wire;
    /// on expiry the caller observes [`crate::Code::DeadlineExceeded`].
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// The deadline for the call, if one was set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Consumes `self`, returning the message.
    pub fn into_inner(self) -> T {
        self.message
    }

    pub(crate) fn from_parts(metadata: MetadataMap, message: T) -> Self {
        Request {
            metadata,
            timeout: None,
            message,
        }
    }

    pub(crate) fn into_parts(self) -> (MetadataMap, Option<Duration>, T) {
        (self.metadata, self.timeout, self.message)
    }

    pub fn map<F, U>(self, f: F) -> Request<U>
    where
        F: FnOnce(T) -> U,
    {
        Request {
            metadata: self.metadata,
            timeout: self.timeout,
            message: f(self.message),
        }
    }
}

/// A `/Service/Method` path identifying the target of a call.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodPath {
    service: String,
    method: String,
}

impl MethodPath {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        MethodPath {
            service: service.into(),
            method: method.into(),
        }
    }

    /// Parse a `/Service/Method` string.
    pub fn parse(path: &str) -> Option<Self> {
        let mut parts = path.strip_prefix('/')?.splitn(2, '/');
        let service = parts.next()?;
        let method = parts.next()?;
        if service.is_empty() || method.is_empty() {
            return None;
        }
        Some(MethodPath::new(service, method))
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl std::fmt::Display for MethodPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}/{}", self.service, self.method)
    }
}

impl From<(&str, &str)> for MethodPath {
    fn from((service, method): (&str, &str)) -> Self {
        MethodPath::new(service, method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_path_round_trip() {
        let path = MethodPath::new("router", "p2p");
        assert_eq!(path.to_string(), "/router/p2p");
        assert_eq!(MethodPath::parse("/router/p2p"), Some(path));
    }

    #[test]
    fn method_path_rejects_malformed() {
        assert_eq!(MethodPath::parse("router/p2p"), None);
        assert_eq!(MethodPath::parse("/router"), None);
        assert_eq!(MethodPath::parse("//p2p"), None);
        assert_eq!(MethodPath::parse("/router/"), None);
    }
}
