// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./version_test.rs"]
mod version_test;

use semver::Version;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum VersionRangeError {
  #[error("empty version range")]
  Empty,
  #[error("invalid version range component '{0}'")]
  InvalidComponent(String),
  #[error("dangling operator '{0}' in version range")]
  DanglingOperator(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
  Eq,
  Ne,
  Gt,
  Ge,
  Lt,
  Le,
}

impl Operator {
  // Splits a leading operator off of a token. A token without an operator is an equality check.
  fn split(token: &str) -> (Self, &str) {
    for (prefix, operator) in [
      (">=", Self::Ge),
      ("<=", Self::Le),
      ("==", Self::Eq),
      ("!=", Self::Ne),
      (">", Self::Gt),
      ("<", Self::Lt),
      ("=", Self::Eq),
      ("!", Self::Ne),
    ] {
      if let Some(rest) = token.strip_prefix(prefix) {
        return (operator, rest);
      }
    }
    (Self::Eq, token)
  }
}

//
// Comparator
//

#[derive(Debug, Clone, PartialEq, Eq)]
enum Comparator {
  Compare(Operator, Version),
  // Matches versions outside of [lower, upper). Produced by != against a wildcard.
  Outside(Version, Version),
}

impl Comparator {
  fn matches(&self, version: &Version) -> bool {
    match self {
      Self::Compare(operator, bound) => match operator {
        Operator::Eq => version == bound,
        Operator::Ne => version != bound,
        Operator::Gt => version > bound,
        Operator::Ge => version >= bound,
        Operator::Lt => version < bound,
        Operator::Le => version <= bound,
      },
      Self::Outside(lower, upper) => version < lower || version >= upper,
    }
  }
}

fn is_wildcard(component: &str) -> bool {
  matches!(component, "x" | "X" | "*")
}

// Parses a single "<op><version>" token, expanding wildcard or partial versions into bounds.
fn parse_comparators(token: &str) -> Result<Vec<Comparator>, VersionRangeError> {
  let invalid = || VersionRangeError::InvalidComponent(token.to_string());
  let (operator, version) = Operator::split(token);
  if version.is_empty() {
    return Err(VersionRangeError::DanglingOperator(token.to_string()));
  }

  if let Ok(version) = Version::parse(version) {
    return Ok(vec![Comparator::Compare(operator, version)]);
  }

  let mut fixed = Vec::with_capacity(3);
  let mut saw_wildcard = false;
  for component in version.split('.') {
    if is_wildcard(component) {
      saw_wildcard = true;
    } else if saw_wildcard {
      return Err(invalid());
    } else {
      fixed.push(component.parse::<u64>().map_err(|_| invalid())?);
    }
  }
  if version.split('.').count() > 3 || fixed.len() >= 3 {
    return Err(invalid());
  }

  let (lower, upper) = match fixed.as_slice() {
    [] => {
      return Ok(match operator {
        Operator::Eq | Operator::Ge | Operator::Le => vec![],
        // Nothing is greater, less than, or different from "any version".
        Operator::Ne | Operator::Gt | Operator::Lt => {
          vec![Comparator::Compare(Operator::Lt, Version::new(0, 0, 0))]
        },
      });
    },
    [major] => (Version::new(*major, 0, 0), Version::new(major + 1, 0, 0)),
    [major, minor] => (
      Version::new(*major, *minor, 0),
      Version::new(*major, minor + 1, 0),
    ),
    _ => return Err(invalid()),
  };

  Ok(match operator {
    Operator::Eq => vec![
      Comparator::Compare(Operator::Ge, lower),
      Comparator::Compare(Operator::Lt, upper),
    ],
    Operator::Ne => vec![Comparator::Outside(lower, upper)],
    Operator::Gt => vec![Comparator::Compare(Operator::Ge, upper)],
    Operator::Ge => vec![Comparator::Compare(Operator::Ge, lower)],
    Operator::Lt => vec![Comparator::Compare(Operator::Lt, lower)],
    Operator::Le => vec![Comparator::Compare(Operator::Lt, upper)],
  })
}

//
// VersionRange
//

/// A semver range such as `>=4.10.0 <4.12.0 || 4.14.x`. Alternatives are separated by `||` and
/// the comparators of an alternative, separated by whitespace, must all match. An operator may be
/// separated from its version by whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
  alternatives: Vec<Vec<Comparator>>,
}

impl VersionRange {
  pub fn parse(range: &str) -> Result<Self, VersionRangeError> {
    if range.trim().is_empty() {
      return Err(VersionRangeError::Empty);
    }

    let mut alternatives = Vec::new();
    for alternative in range.split("||") {
      let mut comparators = Vec::new();
      let mut pending_operator: Option<&str> = None;
      for token in alternative.split_whitespace() {
        if let Some(operator) = pending_operator.take() {
          comparators.extend(parse_comparators(&format!("{operator}{token}"))?);
        } else if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '!')) {
          pending_operator = Some(token);
        } else {
          comparators.extend(parse_comparators(token)?);
        }
      }
      if let Some(operator) = pending_operator {
        return Err(VersionRangeError::DanglingOperator(operator.to_string()));
      }
      if alternative.trim().is_empty() {
        return Err(VersionRangeError::Empty);
      }
      alternatives.push(comparators);
    }

    Ok(Self { alternatives })
  }

  #[must_use]
  pub fn matches(&self, version: &Version) -> bool {
    self
      .alternatives
      .iter()
      .any(|comparators| comparators.iter().all(|c| c.matches(version)))
  }
}

/// Parses a cluster version, discarding pre-release and build metadata so that nightly and
/// candidate builds compare as their release version.
#[must_use]
pub fn parse_cluster_version(version: &str) -> Option<Version> {
  let version = Version::parse(version.trim()).ok()?;
  Some(Version::new(version.major, version.minor, version.patch))
}

/// Returns true if the cluster version satisfies the range. An empty or malformed cluster version
/// never matches, and neither does a malformed range; neither case is an error.
#[must_use]
pub fn cluster_version_matches(cluster_version: &str, range: &str) -> bool {
  let Some(version) = parse_cluster_version(cluster_version) else {
    log::debug!("cluster version '{cluster_version}' is not a valid version");
    return false;
  };
  match VersionRange::parse(range) {
    Ok(range) => range.matches(&version),
    Err(e) => {
      log::debug!("unable to parse version range '{range}': {e}");
      false
    },
  }
}
