use std::{error::Error as StdError, fmt, io};

/// A `Result` alias where the `Err` case is `reqcore::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur while admitting, scheduling, pooling, or
/// revalidating requests.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
            }),
        }
    }

    /// A `DispatcherConfig`/`PoolConfig`/`CacheConfig` value was invalid
    /// (e.g. `max_requests < max_requests_per_host`).
    pub fn configuration<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Configuration, Some(e))
    }

    /// An internal invariant was violated — a bug in this crate, not in the
    /// caller or the network.
    pub fn assertion<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Assertion, Some(e))
    }

    /// The transport engine failed to establish or use a connection. This
    /// kind of error may be safe to retry on a fresh route.
    pub fn transport<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Transport, Some(e))
    }

    /// A peer violated the HTTP/1.1 or HTTP/2 protocol in a way that makes
    /// the connection unusable.
    pub fn protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Protocol, Some(e))
    }

    /// A call was cancelled, either explicitly via its tag or because the
    /// dispatcher or pool it depended on was shut down.
    pub fn cancelled() -> Error {
        Error::new(Kind::Cancelled, None::<BoxError>)
    }
}

impl Error {
    /// Returns true if the error is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self.inner.kind, Kind::Configuration)
    }

    /// Returns true if the error indicates an internal invariant violation.
    pub fn is_assertion(&self) -> bool {
        matches!(self.inner.kind, Kind::Assertion)
    }

    /// Returns true if the error originated in the transport engine.
    pub fn is_transport(&self) -> bool {
        matches!(self.inner.kind, Kind::Transport)
    }

    /// Returns true if the error is a protocol violation.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if the error represents cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.kind, Kind::Cancelled)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("reqcore::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Configuration => f.write_str("invalid configuration")?,
            Kind::Assertion => f.write_str("internal invariant violated")?,
            Kind::Transport => f.write_str("transport error")?,
            Kind::Protocol => f.write_str("protocol error")?,
            Kind::Cancelled => f.write_str("call was cancelled")?,
        };

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Configuration,
    Assertion,
    Transport,
    Protocol,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_source_chain() {
        let root = Error::cancelled();
        assert!(root.source().is_none());

        let link = Error::transport(io::Error::other("reset"));
        assert!(link.source().is_some());
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn mem_size_of() {
        use std::mem::size_of;
        assert_eq!(size_of::<Error>(), size_of::<usize>());
    }

    #[test]
    fn kind_predicates() {
        assert!(Error::configuration("bad").is_configuration());
        assert!(Error::assertion("bug").is_assertion());
        assert!(Error::transport("refused").is_transport());
        assert!(Error::protocol("bad frame").is_protocol());
        assert!(Error::cancelled().is_cancelled());
    }

    #[test]
    fn display_includes_source() {
        let err = Error::transport(io::Error::other("connection refused"));
        let rendered = err.to_string();
        assert!(rendered.contains("transport error"));
        assert!(rendered.contains("connection refused"));
    }
}
