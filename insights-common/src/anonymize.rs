// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./anonymize_test.rs"]
mod anonymize_test;

use base64ct::{Base64UrlUnpadded, Encoding};
use sha2::{Digest, Sha256};

pub const HASH_LENGTH: usize = 12;

/// Returns the first 12 characters of the unpadded URL safe base64 encoding of the SHA-256 digest
/// of the input.
#[must_use]
pub fn hash_string(s: &str) -> String {
  let digest = Sha256::digest(s.as_bytes());
  let mut encoded = Base64UrlUnpadded::encode_string(&digest);
  encoded.truncate(HASH_LENGTH);
  encoded
}

/// Reduces a command or argument to a short semantic token so that paths and flag values are not
/// leaked. Flags without a value reduce to the empty string.
#[must_use]
pub fn normalize_argument(s: &str) -> &str {
  let mut s = s.trim();
  if let Some((head, _)) = s.split_once(' ') {
    s = head;
  }
  if s.starts_with('-') {
    let Some((flag, _)) = s.split_once('=') else {
      return "";
    };
    s = flag;
  }
  let s = s.trim_matches(|c| c == '/' || c == '\\');
  s.rfind(['/', '\\']).map_or(s, |index| &s[index + 1 ..])
}

/// Shorthand for `hash_string(normalize_argument(s))`, the form used for first commands and
/// arguments.
#[must_use]
pub fn hash_argument(s: &str) -> String {
  hash_string(normalize_argument(s))
}

/// Replaces every character with `x`, keeping only the length of the value.
#[must_use]
pub fn mask_string(s: &str) -> String {
  "x".repeat(s.chars().count())
}
