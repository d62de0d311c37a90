use md5::{Digest, Md5};
use russh::keys::PublicKey;

use super::AuthError;

/// Colon-separated MD5 digest of the key's SSH wire encoding.
///
/// Matches `ssh-keygen -l -E md5` without the `MD5:` prefix. The identity
/// service indexes keys by this string, so the format must not drift.
pub fn fingerprint(key: &PublicKey) -> Result<String, AuthError> {
    let blob = key
        .to_bytes()
        .map_err(|err| AuthError::KeyEncoding(err.to_string()))?;
    Ok(fingerprint_blob(&blob))
}

pub fn fingerprint_blob(blob: &[u8]) -> String {
    Md5::digest(blob)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
