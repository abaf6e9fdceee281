use std::fmt;

/// A type-erased error for transport internals.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
#[allow(dead_code)]
pub enum Never {}

impl fmt::Display for Never {
    fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {}
    }
}

impl std::error::Error for Never {}
