use lazy_static::lazy_static;

/// The fixed hash seed (the FNV-1a offset basis). Hashes are deterministic
/// across runs so that table layouts are reproducible.
pub const HASH_SEED: u64 = 0xcbf2_9ce4_8422_2325;

/// Bits of the hash stored in the tag word of a node as an equality
/// pre-check.
pub const FINGERPRINT_BITS: u32 = 24;

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

lazy_static! {
    /// One 256-entry table of random words per input byte, expanded from the
    /// fixed seed. Sixteen tables cover the two 8-byte node words.
    static ref TABLES: Box<[[u64; 256]; 16]> = {
        let mut state = HASH_SEED;
        let mut tables = Box::new([[0u64; 256]; 16]);
        for table in tables.iter_mut() {
            for entry in table.iter_mut() {
                *entry = splitmix64(&mut state);
            }
        }
        tables
    };
}

/// Tabulation hash over the 16 bytes of a node's two content words.
///
/// Tabulation hashing is 3-independent, which is what keeps the collision
/// chains short even for the very regular bit patterns produced by packed
/// node words.
#[inline]
pub fn tabhash16(a: u64, b: u64) -> u64 {
    let tables = &*TABLES;
    let mut h = HASH_SEED;
    let mut x = a;
    for table in &tables[0..8] {
        h ^= table[(x & 0xff) as usize];
        x >>= 8;
    }
    let mut y = b;
    for table in &tables[8..16] {
        h ^= table[(y & 0xff) as usize];
        y >>= 8;
    }
    h
}

#[cfg(test)]
mod test {
    use super::tabhash16;

    #[test]
    pub fn deterministic() {
        assert_eq!(tabhash16(1, 2), tabhash16(1, 2));
        assert_eq!(tabhash16(0, 0), tabhash16(0, 0));
    }

    #[test]
    pub fn argument_order_matters() {
        assert_ne!(tabhash16(1, 2), tabhash16(2, 1));
    }

    #[test]
    pub fn top_bits_spread() {
        // The top 24 bits serve as a fingerprint, so they must not collapse
        // for consecutive inputs.
        let mut seen = std::collections::HashSet::new();
        for i in 0..4096u64 {
            seen.insert(tabhash16(i, i << 40) >> 40);
        }
        assert!(seen.len() > 3500);
    }
}
