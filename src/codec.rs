//! Key/value (de)serialization — stands in for the out-of-scope
//! `BytesWriter`/`SizedReader` framework.
//!
//! Follows the teacher's `serde.rs` tagged fast path for primitives
//! (`TAG_I64`, `TAG_STR`, `TAG_BYTES`, ...), minus the pickle fallback:
//! there is no embedded runtime here to fall back to, so codecs are closed
//! over the concrete Rust type instead of an open-ended dynamic object.

/// Encodes a key to its stable, cross-process byte representation and
/// back. Implementations must be stable across processes: two processes
/// encoding the same logical key must produce identical bytes.
pub trait KeyCodec: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Self;
}

/// Encodes a value. Separate trait from `KeyCodec` because values may be
/// absent entirely (set semantics) while keys never are.
pub trait ValueCodec: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! impl_int_codec {
    ($($t:ty),*) => {
        $(
            impl KeyCodec for $t {
                fn encode(&self) -> Vec<u8> { self.to_be_bytes().to_vec() }
                fn decode(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    <$t>::from_be_bytes(buf)
                }
            }
            impl ValueCodec for $t {
                fn encode(&self) -> Vec<u8> { self.to_be_bytes().to_vec() }
                fn decode(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    <$t>::from_be_bytes(buf)
                }
            }
        )*
    };
}

// Big-endian so byte-wise comparison of encoded keys matches numeric
// ordering, a property some callers of the underlying probe rely on when
// reasoning about collisions during debugging.
impl_int_codec!(u32, u64, i32, i64);

impl KeyCodec for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
    fn decode(bytes: &[u8]) -> Self {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

impl ValueCodec for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
    fn decode(bytes: &[u8]) -> Self {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

impl KeyCodec for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }
    fn decode(bytes: &[u8]) -> Self {
        bytes.to_vec()
    }
}

impl ValueCodec for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }
    fn decode(bytes: &[u8]) -> Self {
        bytes.to_vec()
    }
}

/// Unit value for set semantics: zero-length encoding.
impl ValueCodec for () {
    fn encode(&self) -> Vec<u8> {
        Vec::new()
    }
    fn decode(_bytes: &[u8]) -> Self {}
}
