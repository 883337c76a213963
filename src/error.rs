use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use uuid::Uuid;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Opening the connection failed or timed out
    Connection,
    /// Mid-session I/O failure on an established connection
    Transport,
    /// An ack or connect deadline was exceeded
    Timeout,
    /// The outbound queue evicted or rejected an envelope. Informational, not fatal.
    QueueOverflow,
    /// A message permanently failed after its retry budget
    MaxRetries,
    /// The client gave up automatic reconnection; a new `connect()` is required
    MaxReconnects,
    /// The operation was cancelled by an explicit disconnect
    Cancelled,
    /// Internal error from dependencies (e.g. payload serialization)
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn connection<S: Into<String>>(reason: S) -> Self {
        Connection {
            reason: reason.into(),
        }
        .into()
    }

    pub fn transport<S: Into<String>>(reason: S) -> Self {
        Transport {
            reason: reason.into(),
        }
        .into()
    }

    pub fn timeout<S: Into<String>>(what: S) -> Self {
        Timeout { what: what.into() }.into()
    }

    #[must_use]
    pub fn queue_overflow(envelope_id: Uuid) -> Self {
        QueueOverflow { envelope_id }.into()
    }

    #[must_use]
    pub fn max_retries(envelope_id: Uuid) -> Self {
        MaxRetries { envelope_id }.into()
    }

    #[must_use]
    pub fn max_reconnects(attempts: u32) -> Self {
        MaxReconnects { attempts }.into()
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Cancelled.into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Connection {
    pub reason: String,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection failed: {}", self.reason)
    }
}

impl StdError for Connection {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Transport {
    pub reason: String,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: {}", self.reason)
    }
}

impl StdError for Transport {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Timeout {
    pub what: String,
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timed out waiting for {}", self.what)
    }
}

impl StdError for Timeout {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct QueueOverflow {
    pub envelope_id: Uuid,
}

impl fmt::Display for QueueOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "outbound queue overflow dropped envelope {}", self.envelope_id)
    }
}

impl StdError for QueueOverflow {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct MaxRetries {
    pub envelope_id: Uuid,
}

impl fmt::Display for MaxRetries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delivery of envelope {} failed after exhausting its retry budget",
            self.envelope_id
        )
    }
}

impl StdError for MaxRetries {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct MaxReconnects {
    pub attempts: u32,
}

impl fmt::Display for MaxReconnects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gave up reconnecting after {} attempts", self.attempts)
    }
}

impl StdError for MaxReconnects {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled by disconnect")
    }
}

impl StdError for Cancelled {}

impl From<Connection> for Error {
    fn from(err: Connection) -> Self {
        Self::with_source(Kind::Connection, err)
    }
}

impl From<Transport> for Error {
    fn from(err: Transport) -> Self {
        Self::with_source(Kind::Transport, err)
    }
}

impl From<Timeout> for Error {
    fn from(err: Timeout) -> Self {
        Self::with_source(Kind::Timeout, err)
    }
}

impl From<QueueOverflow> for Error {
    fn from(err: QueueOverflow) -> Self {
        Self::with_source(Kind::QueueOverflow, err)
    }
}

impl From<MaxRetries> for Error {
    fn from(err: MaxRetries) -> Self {
        Self::with_source(Kind::MaxRetries, err)
    }
}

impl From<MaxReconnects> for Error {
    fn from(err: MaxReconnects) -> Self {
        Self::with_source(Kind::MaxReconnects, err)
    }
}

impl From<Cancelled> for Error {
    fn from(err: Cancelled) -> Self {
        Self::with_source(Kind::Cancelled, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::with_source(Kind::Internal, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::with_source(Kind::Transport, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_reconnects_display_should_succeed() {
        let err = Error::max_reconnects(5);

        assert_eq!(err.kind(), Kind::MaxReconnects);
        assert_eq!(
            err.to_string(),
            "MaxReconnects: gave up reconnecting after 5 attempts"
        );
    }

    #[test]
    fn downcast_recovers_payload() {
        let id = Uuid::new_v4();
        let err = Error::max_retries(id);

        let payload = err.downcast_ref::<MaxRetries>().expect("missing payload");
        assert_eq!(payload.envelope_id, id);
    }

    #[test]
    fn serde_error_maps_to_internal() {
        let bad = serde_json::from_str::<serde_json::Value>("{");
        let err: Error = bad.expect_err("should fail").into();
        assert_eq!(err.kind(), Kind::Internal);
    }
}
