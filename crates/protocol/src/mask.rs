//! Client-to-server payload masking (RFC 6455 Section 5.3)

/// 4-byte masking key carried by every client frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskKey([u8; 4]);

impl MaskKey {
    /// Wrap raw key bytes
    pub fn new(key: [u8; 4]) -> Self {
        Self(key)
    }

    /// Read the key from the first four bytes of `buf`
    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        let key: [u8; 4] = buf.get(..4)?.try_into().ok()?;
        Some(Self(key))
    }

    /// Raw key bytes
    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }

    /// Apply the mask in place. Masking and unmasking are the same operation.
    pub fn apply_inplace(&self, data: &mut [u8]) {
        xor_words(data, self.0);
    }

    /// Apply the mask and return a new buffer
    pub fn apply(&self, data: &[u8]) -> Vec<u8> {
        let mut result = data.to_vec();
        self.apply_inplace(&mut result);
        result
    }
}

/// XOR `data[i]` with `key[i % 4]`
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    xor_words(data, key);
}

/// Word-at-a-time XOR. Every chunk starts at a multiple of 4, so the key
/// stays aligned with the payload index.
#[inline]
fn xor_words(data: &mut [u8], key: [u8; 4]) {
    let word = u32::from_ne_bytes(key);
    let mut chunks = data.chunks_exact_mut(4);

    for chunk in &mut chunks {
        let value = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&value.to_ne_bytes());
    }

    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= key[i];
    }
}
