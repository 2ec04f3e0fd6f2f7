use std::convert::TryFrom;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Segment is a coarse category of the requesting identity.
///
/// [Segment::All] is a wildcard: when it is the active segment, every segment-restricted flag
/// passes. It is never a valid restriction inside a flag's allowed segments.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    #[default]
    All,
    Guest,
    Beta,
    Premium,
}

impl Segment {
    /// The segments that may appear in a flag's allowed segments.
    pub const CONCRETE: [Segment; 3] = [Segment::Guest, Segment::Beta, Segment::Premium];

    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::All => "all",
            Segment::Guest => "guest",
            Segment::Beta => "beta",
            Segment::Premium => "premium",
        }
    }

    /// Returns true if this is the [Segment::All] wildcard.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Segment::All)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Segment {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "all" => Ok(Segment::All),
            "guest" => Ok(Segment::Guest),
            "beta" => Ok(Segment::Beta),
            "premium" => Ok(Segment::Premium),
            other => Err(format!("unknown segment '{}'", other)),
        }
    }
}

impl TryFrom<String> for Segment {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}
