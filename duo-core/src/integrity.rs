//! Integrity: whole-content SHA-256 digests, computed in a single streaming pass.

use std::io::Read;

use sha2::{Digest, Sha256};

/// Fixed read buffer used when digesting a stream.
pub const DIGEST_BUFFER_SIZE: usize = 64 * 1024;

/// Incremental digest. Feed bytes in order, then take the lowercase hex digest.
#[derive(Default)]
pub struct StreamDigest {
    hasher: Sha256,
}

impl StreamDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Hex digest of an in-memory buffer.
pub fn digest_hex(bytes: &[u8]) -> String {
    let mut d = StreamDigest::new();
    d.update(bytes);
    d.finish_hex()
}

/// Hex digest of everything readable from `reader`.
pub fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut digest = StreamDigest::new();
    let mut buf = vec![0u8; DIGEST_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finish_hex())
}

/// Compare a declared digest against a computed one. Hex case is ignored.
pub fn digests_match(declared: &str, computed: &str) -> bool {
    declared.trim().eq_ignore_ascii_case(computed.trim())
}
