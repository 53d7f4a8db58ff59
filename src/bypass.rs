//! Bypass switches.
//!
//! A bypass switch is a short letter code where each letter enables non-fatal handling of a
//! specific class of pipeline event.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Letters enabled when no switch is given.
pub const DEFAULT_SWITCH: &str = "DBSCLR";

/// Set of bypass options for a pipeline run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BypassSwitch {
    switch: String,
    /// D: skip driver failures and try further drivers
    pub skip_driver: bool,
    /// B: skip box compute errors
    pub skip_boxfail: bool,
    /// S: skip soft failures (NaN-only boxes in validation)
    pub skip_softfail: bool,
    /// C: skip data sum errors for non-summable arrays
    pub skip_data_sum: bool,
    /// X: skip initial shape errors using the tolerance method
    pub skip_xkshape: bool,
    /// F: skip scanning and go straight to compute
    pub skip_scan: bool,
    /// L: skip adding download links in compute
    pub skip_links: bool,
}

impl BypassSwitch {
    /// Return a new BypassSwitch
    ///
    /// A leading `+` appends the remaining letters to [DEFAULT_SWITCH].
    ///
    /// # Arguments
    ///
    /// * `switch`: Letter code
    pub fn new(switch: &str) -> Self {
        let switch = match switch.strip_prefix('+') {
            Some(extra) => format!("{}{}", DEFAULT_SWITCH, extra),
            None => switch.to_string(),
        };
        let has = |c: char| switch.contains(c);
        BypassSwitch {
            skip_driver: has('D'),
            skip_boxfail: has('B'),
            skip_softfail: has('S'),
            skip_data_sum: has('C'),
            skip_xkshape: has('X'),
            skip_scan: has('F'),
            skip_links: has('L'),
            switch,
        }
    }

    /// Description of every letter.
    pub fn help() -> &'static str {
        "Bypass switch options:
  \"D\" - * Skip driver failures - Pipeline tries different options for NetCDF (default).
      -   Only need to turn this skip off if all drivers fail (KerchunkDriverFatal).
  \"B\" - * Skip Box compute errors.
  \"S\" - * Skip Soft fails (NaN-only boxes in validation) (default).
  \"C\" - * Skip calculation (data sum) errors (time array typically cannot be summed) (default).
  \"X\" -   Skip initial shape errors, by attempting XKShape tolerance method (special case.)
  \"R\" -   Reserved, accepted for older switch codes and ignored.
  \"F\" -   Skip scanning (fasttrack) and go straight to compute.
  \"L\" -   Skip adding links in compute (download links)."
    }
}

impl Default for BypassSwitch {
    fn default() -> Self {
        Self::new(DEFAULT_SWITCH)
    }
}

impl fmt::Display for BypassSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.switch)
    }
}

impl FromStr for BypassSwitch {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl Serialize for BypassSwitch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.switch)
    }
}

impl<'de> Deserialize<'de> for BypassSwitch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let switch = String::deserialize(deserializer)?;
        Ok(Self::new(&switch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_test::{assert_tokens, Token};

    #[test]
    fn default_switch() {
        let bypass = BypassSwitch::default();
        assert!(bypass.skip_driver);
        assert!(bypass.skip_boxfail);
        assert!(bypass.skip_softfail);
        assert!(bypass.skip_data_sum);
        assert!(bypass.skip_links);
        assert!(!bypass.skip_xkshape);
        assert!(!bypass.skip_scan);
        assert_eq!("DBSCLR", bypass.to_string());
    }

    #[test]
    fn extend_default() {
        let bypass: BypassSwitch = "+XF".parse().unwrap();
        assert!(bypass.skip_xkshape);
        assert!(bypass.skip_scan);
        assert!(bypass.skip_driver);
        assert_eq!("DBSCLRXF", bypass.to_string());
    }

    #[test]
    fn shepherd_switch() {
        let bypass = BypassSwitch::new("DFLS");
        assert!(bypass.skip_driver && bypass.skip_scan && bypass.skip_links);
        assert!(bypass.skip_softfail);
        assert!(!bypass.skip_data_sum);
    }

    #[test]
    fn reserved_letter_kept() {
        let bypass = BypassSwitch::new("DR");
        assert_eq!(
            BypassSwitch {
                switch: "DR".to_string(),
                ..BypassSwitch::new("D")
            },
            bypass
        );
        assert_eq!("DR", bypass.to_string());
        assert!(BypassSwitch::help().contains("\"R\" -   Reserved"));
    }

    #[test]
    fn serde_tokens() {
        assert_tokens(&BypassSwitch::new("DS"), &[Token::Str("DS")]);
    }
}
