//! Pluggable decrypt stage.

use thiserror::Error;

#[derive(Error, Debug)]
#[error("decrypt stage failed: {0}")]
pub struct DecryptError(pub String);

/// External decryption layer applied to every chunk before it reaches the
/// parser and the partition writer.
///
/// Implementations may hold cipher state across calls; chunks arrive in
/// stream order with no gaps. The writer never learns whether decryption
/// occurred.
pub trait DecryptStage: Send {
    /// Transform one ciphertext chunk into plaintext.
    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError>;
}
