//! FNV-1a digests used to key the script cache and to check cache envelopes.

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;
const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;

pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV32_OFFSET, |hash, b| {
        (hash ^ *b as u32).wrapping_mul(FNV32_PRIME)
    })
}

pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV64_OFFSET, |hash, b| {
        (hash ^ *b as u64).wrapping_mul(FNV64_PRIME)
    })
}

/// Digest of a source text as stored in script holders and cache keys.
pub fn code_digest(code: &str) -> u64 {
    fnv1a_64(code.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn single_bit_changes_digest() {
        assert_ne!(code_digest("42"), code_digest("43"));
    }
}
