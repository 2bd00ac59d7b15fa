const MAX_SUBJECT_LEN: usize = 1000;

/// A notification subject line, validated against the `≤1000 chars` bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject(String);

impl Subject {
    pub fn parse(s: String) -> Result<Self, String> {
        if s.chars().count() > MAX_SUBJECT_LEN {
            return Err(format!(
                "{} is too long: subject must be at most {} characters",
                s, MAX_SUBJECT_LEN
            ));
        }

        Ok(Self(s))
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Subject {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Subject::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::Subject;

    #[test]
    fn a_subject_at_the_length_limit_is_accepted() {
        let subject = "x".repeat(1000);
        assert!(Subject::parse(subject).is_ok());
    }

    #[test]
    fn a_subject_over_the_length_limit_is_rejected() {
        let subject = "x".repeat(1001);
        assert!(Subject::parse(subject).is_err());
    }

    #[test]
    fn an_empty_subject_is_accepted() {
        assert!(Subject::parse(String::new()).is_ok());
    }

    #[quickcheck_macros::quickcheck]
    fn any_subject_up_to_the_limit_is_valid(len: u16) -> bool {
        let len = (len as usize) % (super::MAX_SUBJECT_LEN + 1);
        Subject::parse("a".repeat(len)).is_ok()
    }
}
