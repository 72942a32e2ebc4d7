// Copyright contributors to this project.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments,
  clippy::new_without_default,
  clippy::new_ret_no_self,
  clippy::mutex_atomic
)]

//! Content hashing for the build engine: a `Fingerprint`/`Digest` pair describing
//! file content by size and cryptographic hash, and a `CachedDigest` that avoids
//! re-hashing a file whose stat metadata hasn't moved since the last read.

mod cache;

pub use cache::{CachedDigest, StatKey};

use std::fmt;
use std::io::Write;

use serde::de::{Error as SerdeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha2Digest, Sha256};

pub const FINGERPRINT_SIZE: usize = 32;

/// A SHA-256 digest of some content, rendered as a 32-byte array.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

pub static EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
  0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
  0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

pub static EMPTY_DIGEST: Digest = Digest {
  hash: EMPTY_FINGERPRINT,
  size_bytes: 0,
};

impl Fingerprint {
  pub fn from_bytes_unsafe(bytes: &[u8]) -> Fingerprint {
    if bytes.len() != FINGERPRINT_SIZE {
      panic!(
        "Input length was not {}: {:?}",
        FINGERPRINT_SIZE,
        bytes.len()
      );
    }
    let mut array = [0_u8; FINGERPRINT_SIZE];
    array.copy_from_slice(bytes);
    Fingerprint(array)
  }

  pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
    <[u8; FINGERPRINT_SIZE]>::try_from(
      hex::decode(hex_string).map_err(|e| format!("Invalid hex string: {e:?}"))?,
    )
    .map(Fingerprint)
    .map_err(|vec| format!("Input length was not {FINGERPRINT_SIZE}: {}", vec.len()))
  }

  pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    let mut s = String::new();
    for &byte in &self.0 {
      fmt::Write::write_fmt(&mut s, format_args!("{byte:02x}")).unwrap();
    }
    s
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_hex())
  }
}

impl fmt::Debug for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Fingerprint<{}>", self.to_hex())
  }
}

impl Serialize for Fingerprint {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_hex())
  }
}

struct FingerprintVisitor;

impl<'de> Visitor<'de> for FingerprintVisitor {
  type Value = Fingerprint;

  fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
    formatter.write_str("a hex string representing a 32 byte sha256 hash")
  }

  fn visit_str<E: SerdeError>(self, value: &str) -> Result<Fingerprint, E> {
    Fingerprint::from_hex_string(value).map_err(E::custom)
  }
}

impl<'de> Deserialize<'de> for Fingerprint {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    deserializer.deserialize_str(FingerprintVisitor)
  }
}

/// The content-address of a piece of data: its fingerprint plus its length, so that
/// truncated reads can be detected without touching the content itself.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Digest {
  pub hash: Fingerprint,
  pub size_bytes: usize,
}

impl Digest {
  pub fn new(hash: Fingerprint, size_bytes: usize) -> Digest {
    Digest { hash, size_bytes }
  }

  pub fn of_bytes(bytes: &[u8]) -> Digest {
    let mut hasher = WriterHasher::new();
    hasher
      .write_all(bytes)
      .expect("Writing to an in-memory hasher should never fail");
    let (fingerprint, size) = hasher.finish();
    Digest::new(fingerprint, size)
  }
}

impl fmt::Debug for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Digest<{}, {}>", self.hash, self.size_bytes)
  }
}

/// A `Write` implementation that feeds every byte through a running SHA-256 hasher,
/// so content can be hashed while being copied/read in a single pass.
pub struct WriterHasher {
  hasher: Sha256,
  size: usize,
}

impl WriterHasher {
  pub fn new() -> WriterHasher {
    WriterHasher {
      hasher: Sha256::default(),
      size: 0,
    }
  }

  /// Returns the fingerprint and number of bytes written so far.
  pub fn finish(self) -> (Fingerprint, usize) {
    (
      Fingerprint::from_bytes_unsafe(&self.hasher.finalize()),
      self.size,
    )
  }
}

impl Write for WriterHasher {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.hasher.update(buf);
    self.size += buf.len();
    Ok(buf.len())
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::{Digest, Fingerprint, EMPTY_DIGEST, EMPTY_FINGERPRINT};

  #[test]
  fn empty_digest_matches_empty_fingerprint() {
    assert_eq!(Digest::of_bytes(b""), EMPTY_DIGEST);
    assert_eq!(EMPTY_DIGEST.hash, EMPTY_FINGERPRINT);
  }

  #[test]
  fn hex_round_trip() {
    let digest = Digest::of_bytes(b"hello world");
    let hex = digest.hash.to_hex();
    let parsed = Fingerprint::from_hex_string(&hex).unwrap();
    assert_eq!(digest.hash, parsed);
  }

  #[test]
  fn distinct_content_distinct_digest() {
    assert_ne!(Digest::of_bytes(b"hi"), Digest::of_bytes(b"bye"));
  }
}
