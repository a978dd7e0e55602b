use byteorder::{BigEndian, ByteOrder};

//-------------------------------------------------------------------------

/// Boundary between user key types and the byte strings the engine stores.
/// Ordering and equality inside the trie are byte-lexicographic, so
/// encodings should be chosen to make that the order the caller wants
/// (hence big-endian for the integer impls).
pub trait TrieKey {
    /// Set for key types whose encoding always has the same length.  No
    /// such key can be a proper prefix of another, which lets the engine
    /// skip its end-of-string bookkeeping entirely.
    const FIXED_LEN: Option<usize> = None;

    fn to_bytes(&self, out: &mut Vec<u8>);

    /// Decode a key previously produced by to_bytes.
    fn from_bytes(bytes: &[u8]) -> Self;
}

//-------------------------------------------------------------------------

impl TrieKey for Vec<u8> {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        bytes.to_vec()
    }
}

impl TrieKey for String {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

impl TrieKey for u32 {
    const FIXED_LEN: Option<usize> = Some(4);

    fn to_bytes(&self, out: &mut Vec<u8>) {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, *self);
        out.extend_from_slice(&buf);
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        BigEndian::read_u32(bytes)
    }
}

impl TrieKey for u64 {
    const FIXED_LEN: Option<usize> = Some(8);

    fn to_bytes(&self, out: &mut Vec<u8>) {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, *self);
        out.extend_from_slice(&buf);
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        BigEndian::read_u64(bytes)
    }
}

impl<const N: usize> TrieKey for [u8; N] {
    const FIXED_LEN: Option<usize> = Some(N);

    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; N];
        buf.copy_from_slice(bytes);
        buf
    }
}

//-------------------------------------------------------------------------

pub fn encode<K: TrieKey>(key: &K) -> Vec<u8> {
    let mut out = Vec::new();
    key.to_bytes(&mut out);
    if let Some(n) = K::FIXED_LEN {
        debug_assert_eq!(out.len(), n);
    }
    out
}

//-------------------------------------------------------------------------


//-------------------------------------------------------------------------
