use thiserror::Error;

/// Errors returned while loading node key material.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("secret key is not valid hex")]
    NotHex,
    #[error("secret key must be 32 bytes, got {0}")]
    WrongLength(usize),
}

/// Parses a 32-byte Ed25519 secret key from hex text.
///
/// Surrounding whitespace (trailing newline in key files) is ignored.
pub fn parse_secret_key_hex(text: &str) -> Result<[u8; 32], KeyError> {
    let raw = hex::decode(text.trim()).map_err(|_| KeyError::NotHex)?;
    let len = raw.len();
    raw.try_into().map_err(|_| KeyError::WrongLength(len))
}
