//! Semantic version strings for job definitions.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Error returned when a version string is not valid semver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version '{input}': {reason}")]
pub struct VersionError {
  pub input: String,
  pub reason: String,
}

/// A parsed `MAJOR.MINOR.PATCH[-PRE][+BUILD]` version.
///
/// Build metadata is kept for display but ignored when comparing.
#[derive(Debug, Clone, Eq)]
pub struct Version {
  pub major: u64,
  pub minor: u64,
  pub patch: u64,
  pub pre: Vec<String>,
  pub build: Option<String>,
}

impl Version {
  pub fn parse(input: &str) -> Result<Self, VersionError> {
    let err = |reason: &str| VersionError {
      input: input.to_string(),
      reason: reason.to_string(),
    };

    let (rest, build) = match input.split_once('+') {
      Some((rest, build)) => {
        if !valid_identifiers(build) {
          return Err(err("invalid build metadata"));
        }
        (rest, Some(build.to_string()))
      }
      None => (input, None),
    };

    let (core, pre) = match rest.split_once('-') {
      Some((core, pre)) => {
        if !valid_identifiers(pre) {
          return Err(err("invalid pre-release"));
        }
        let pre: Vec<String> = pre.split('.').map(str::to_string).collect();
        if pre
          .iter()
          .any(|id| is_numeric(id) && id.len() > 1 && id.starts_with('0'))
        {
          return Err(err("numeric pre-release identifiers must not have leading zeros"));
        }
        (core, pre)
      }
      None => (rest, Vec::new()),
    };

    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() != 3 {
      return Err(err("expected MAJOR.MINOR.PATCH"));
    }

    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
      if !is_numeric(part) {
        return Err(err("version components must be numeric"));
      }
      if part.len() > 1 && part.starts_with('0') {
        return Err(err("version components must not have leading zeros"));
      }
      *slot = part.parse().map_err(|_| err("version component out of range"))?;
    }

    Ok(Self {
      major: numbers[0],
      minor: numbers[1],
      patch: numbers[2],
      pre,
      build,
    })
  }

  pub fn is_prerelease(&self) -> bool {
    !self.pre.is_empty()
  }
}

fn is_numeric(s: &str) -> bool {
  !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn valid_identifiers(s: &str) -> bool {
  s.split('.')
    .all(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-'))
}

fn compare_identifier(a: &str, b: &str) -> Ordering {
  match (is_numeric(a), is_numeric(b)) {
    (true, true) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    (true, false) => Ordering::Less,
    (false, true) => Ordering::Greater,
    (false, false) => a.cmp(b),
  }
}

impl Ord for Version {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .major
      .cmp(&other.major)
      .then(self.minor.cmp(&other.minor))
      .then(self.patch.cmp(&other.patch))
      .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
          for (a, b) in self.pre.iter().zip(&other.pre) {
            let ord = compare_identifier(a, b);
            if ord != Ordering::Equal {
              return ord;
            }
          }
          self.pre.len().cmp(&other.pre.len())
        }
      })
  }
}

impl PartialOrd for Version {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl PartialEq for Version {
  fn eq(&self, other: &Self) -> bool {
    self.cmp(other) == Ordering::Equal
  }
}

impl FromStr for Version {
  type Err = VersionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl fmt::Display for Version {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
    if !self.pre.is_empty() {
      write!(f, "-{}", self.pre.join("."))?;
    }
    if let Some(build) = &self.build {
      write!(f, "+{}", build)?;
    }
    Ok(())
  }
}
