//! Parse errors for the Memcache ASCII dialect.

/// Error produced while parsing a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The buffer does not yet hold a complete reply. Not fatal: read more
    /// bytes and call the parser again.
    #[error("incomplete reply")]
    Incomplete,

    /// The reply is malformed or not part of the dialect.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// A numeric field could not be parsed as ASCII decimal.
    #[error("invalid number in reply")]
    InvalidNumber,
}

impl ParseError {
    /// True when the caller should buffer more data and retry.
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ParseError::Incomplete)
    }
}
