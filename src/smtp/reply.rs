/// A single SMTP server reply, after multi-line continuations (`250-...`)
/// have been collapsed into one `{code, text}` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub text: String,
}

impl SmtpReply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn is(&self, code: u16) -> bool {
        self.code == code
    }

    pub fn is_one_of(&self, codes: &[u16]) -> bool {
        codes.contains(&self.code)
    }

    /// Reply-code class per RFC 5321: `2yz`/`3yz` success, `4yz` transient,
    /// `5yz` permanent.
    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn is_permanent(&self) -> bool {
        (500..600).contains(&self.code)
    }
}

impl std::fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Parse one line of a (possibly multi-line) SMTP reply: `"250-more\r\n"` or
/// `"250 done\r\n"`. Returns `(code, text, is_final)`.
pub fn parse_reply_line(line: &str) -> Option<(u16, &str, bool)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() < 3 {
        return None;
    }

    let (code_str, rest) = line.split_at(3);
    let code: u16 = code_str.parse().ok()?;

    match rest.chars().next() {
        Some('-') => Some((code, &rest[1..], false)),
        Some(' ') => Some((code, &rest[1..], true)),
        None => Some((code, "", true)),
        _ => None,
    }
}

/// Pick the first whitespace-delimited token in `text` that contains `@`,
/// for 551 forward-address chasing.
pub fn first_forward_address(text: &str) -> Option<&str> {
    text.split_whitespace().find(|token| token.contains('@'))
}
