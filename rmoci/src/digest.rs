use oci_spec::image::{Digest, DigestAlgorithm};
use sha2::Sha256;

use crate::error::{Error, Result};

/// Check `<algo>:<hex>` syntax with the hex length matching the algorithm.
/// Only the registered algorithms are accepted; we compute sha256 ourselves
/// but pass sha512 content through untouched.
pub fn validate(s: &str) -> Result<()> {
    let (algo, hex) = s
        .split_once(':')
        .ok_or_else(|| Error::InvalidReference(format!("bad digest {s}")))?;
    let want = match algo {
        "sha256" => 64,
        "sha512" => 128,
        _ => return Err(Error::InvalidReference(format!("bad digest algorithm {s}"))),
    };
    if hex.len() != want || !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return Err(Error::InvalidReference(format!("bad digest {s}")));
    }
    Ok(())
}

pub fn from_data(x: impl AsRef<[u8]>) -> Digest {
    use sha2::Digest as _;
    use std::str::FromStr;
    oci_spec::image::Sha256Digest::from_str(&hex::encode(Sha256::digest(x)))
        .unwrap()
        .into()
}

pub fn data_matches(expected: &Digest, data: &[u8]) -> Result<bool> {
    match expected.algorithm() {
        DigestAlgorithm::Sha256 => {
            use sha2::Digest as _;
            Ok(hex::encode(Sha256::digest(data)) == expected.digest())
        }
        algo => Err(Error::UnsupportedApi(format!(
            "digest algorithm not handled {algo}"
        ))),
    }
}

pub fn check_data_matches(expected: Option<&Digest>, data: &[u8]) -> Result<()> {
    if let Some(expected) = expected {
        if !data_matches(expected, data)? {
            return Err(Error::DigestMismatch);
        }
    }
    Ok(())
}
