//! Error values carried through the session state machines
//!
//! A [`SessionError`] is what a state handler hands back to the FSM engine. It
//! records a human-readable message, the operation that failed and the source
//! location of the failing call, so the `Error` state can report where things
//! went wrong without any shared mutable error slot.

use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct SessionError {
    message: String,
    origin: &'static str,
    location: &'static Location<'static>,
    #[source]
    source: Option<BoxError>,
}

impl SessionError {
    #[track_caller]
    pub fn new(origin: &'static str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            origin,
            location: Location::caller(),
            source: None,
        }
    }

    #[track_caller]
    pub fn with_source(
        origin: &'static str,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            message: message.into(),
            origin,
            location: Location::caller(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Name of the operation that failed, e.g. `"connect"`.
    pub fn origin(&self) -> &'static str {
        self.origin
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// One line suitable for stderr: message, cause, origin and location.
    pub fn describe(&self) -> String {
        let mut line = self.message.clone();
        if let Some(src) = &self.source {
            line.push_str(&format!(": {}", src));
        }
        format!(
            "{} (in {} at {}:{})",
            line,
            self.origin,
            self.location.file(),
            self.location.line()
        )
    }
}

/// Attach an origin and message to a foreign error, capturing the caller's location.
pub trait SessionResultExt<T> {
    fn during(self, origin: &'static str, message: &str) -> Result<T, SessionError>;
}

impl<T, E> SessionResultExt<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    #[track_caller]
    fn during(self, origin: &'static str, message: &str) -> Result<T, SessionError> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(SessionError::with_source(origin, message, e)),
        }
    }
}

/// Faults in the state table itself, never in the work a handler does.
#[derive(Debug, thiserror::Error)]
pub enum FsmError<S: fmt::Debug> {
    #[error("state {from:?} returned undeclared successor {to:?}")]
    UndeclaredTransition { from: S, to: S },
    #[error("state {state:?} fails into {failure:?} instead of the error state")]
    UnreportedFailure { state: S, failure: S },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_location_points_at_caller() {
        let line = line!() + 1;
        let err = SessionError::new("bind", "Binding failed");
        assert_eq!(err.location().line(), line);
        assert!(err.location().file().ends_with("error.rs"));
        assert_eq!(err.origin(), "bind");
    }

    #[test]
    fn test_during_wraps_source() {
        let res: Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        let line = line!() + 1;
        let err = res.during("connect", "Failed to connect socket").unwrap_err();
        assert_eq!(err.location().line(), line);
        assert_eq!(err.message(), "Failed to connect socket");
        assert!(err.describe().contains("refused"));
        assert!(err.describe().contains("in connect"));
        assert!(err.source().is_some());
    }
}
