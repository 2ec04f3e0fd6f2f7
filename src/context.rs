use std::convert::TryFrom;
use std::fmt;

use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;

use crate::segment::Segment;

const SESSION_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SESSION_ID_LENGTH: usize = 13;

lazy_static! {
    static ref SESSION_ID_REGEX: Regex = Regex::new(r"^[0-9a-z]{1,64}$").unwrap();
}

/// SessionIdentity supplies the opaque identifier used as entropy for percentage rollouts.
///
/// The identifier is only requested when a percentage flag is evaluated, which lets an
/// implementation create it lazily. It must return the same value for the lifetime of the session.
pub trait SessionIdentity {
    fn identifier(&self) -> &str;
}

impl SessionIdentity for String {
    fn identifier(&self) -> &str {
        self
    }
}

/// A session identifier: 1 to 64 lowercase base-36 characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random identifier of 13 base-36 characters.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    /// Generate an identifier from the provided random source.
    pub fn generate_with<R: Rng>(rng: &mut R) -> Self {
        let id = (0..SESSION_ID_LENGTH)
            .map(|_| SESSION_ID_ALPHABET[rng.gen_range(0..SESSION_ID_ALPHABET.len())] as char)
            .collect();
        SessionId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl SessionIdentity for SessionId {
    fn identifier(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if SESSION_ID_REGEX.is_match(&value) {
            Ok(SessionId(value))
        } else {
            Err(format!("'{}' is not a valid session identifier", value))
        }
    }
}

impl TryFrom<&str> for SessionId {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_owned())
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// EvaluationContext carries the inputs of an evaluation that do not belong to the flag itself:
/// the active segment and the session identity.
#[derive(Clone, Copy)]
pub struct EvaluationContext<'a> {
    active_segment: Segment,
    session: &'a dyn SessionIdentity,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(active_segment: Segment, session: &'a dyn SessionIdentity) -> Self {
        Self {
            active_segment,
            session,
        }
    }

    pub fn active_segment(&self) -> Segment {
        self.active_segment
    }

    /// Returns the session identifier, creating it if the identity is lazy.
    pub fn session_identifier(&self) -> &'a str {
        self.session.identifier()
    }
}

impl fmt::Debug for EvaluationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationContext")
            .field("active_segment", &self.active_segment)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use spectral::prelude::*;
    use std::cell::Cell;
    use test_case::test_case;

    struct CountingSession {
        id: String,
        calls: Cell<usize>,
    }

    impl SessionIdentity for CountingSession {
        fn identifier(&self) -> &str {
            self.calls.set(self.calls.get() + 1);
            &self.id
        }
    }

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_that!(a.as_str().len()).is_equal_to(SESSION_ID_LENGTH);
        assert_that!(SessionId::try_from(a.to_string())).is_ok_containing(a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn seeded_generation_is_reproducible() {
        let a = SessionId::generate_with(&mut StdRng::seed_from_u64(7));
        let b = SessionId::generate_with(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test_case("")]
    #[test_case("ABC")]
    #[test_case("abc-def")]
    #[test_case("has space")]
    fn rejects_malformed_ids(raw: &str) {
        assert_that!(SessionId::try_from(raw)).is_err();
    }

    #[test]
    fn context_reads_identity_on_demand() {
        let session = CountingSession {
            id: "k3j2h1".to_string(),
            calls: Cell::new(0),
        };
        let context = EvaluationContext::new(Segment::Beta, &session);
        assert_that!(context.active_segment()).is_equal_to(Segment::Beta);
        assert_eq!(session.calls.get(), 0);

        assert_eq!(context.session_identifier(), "k3j2h1");
        assert_eq!(session.calls.get(), 1);
    }

    proptest! {
        #[test]
        fn any_base36_string_is_accepted(raw in "[0-9a-z]{1,64}") {
            prop_assert!(SessionId::try_from(raw.as_str()).is_ok());
        }
    }
}
