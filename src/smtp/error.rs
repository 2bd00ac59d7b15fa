use super::reply::SmtpReply;

/// Error classification for the SMTP client. The dispatcher only
/// ever sees these three kinds; it never inspects transport internals.
#[derive(Debug, thiserror::Error)]
pub enum SmtpError {
    /// A `4yz` reply, or a transport failure we consider retryable (connect
    /// timeout, connection reset).
    #[error("transient SMTP failure: {0}")]
    Transient(SmtpReply),

    /// A `5yz` reply other than the ones the protocol subset treats as
    /// success (`250`/`251`) or as a forward (`551`).
    #[error("permanent SMTP failure: {0}")]
    Permanent(SmtpReply),

    /// Protocol or IO errors that aren't a classified reply at all: a
    /// dropped connection mid-command, a line that doesn't parse as a
    /// reply, a read/write timeout.
    #[error("local SMTP/IO error: {0}")]
    Local(String),
}

impl SmtpError {
    pub fn from_io(e: std::io::Error) -> Self {
        SmtpError::Local(e.to_string())
    }

    /// Classify a completed reply into an error, given the set of reply
    /// codes the calling operation accepts as success.
    pub fn from_reply(reply: SmtpReply, accepted: &[u16]) -> Result<SmtpReply, Self> {
        if reply.is_one_of(accepted) {
            Ok(reply)
        } else if reply.is_transient() {
            Err(SmtpError::Transient(reply))
        } else if reply.is_permanent() {
            Err(SmtpError::Permanent(reply))
        } else {
            Err(SmtpError::Local(format!(
                "unexpected reply outside any known class: {reply}"
            )))
        }
    }
}
