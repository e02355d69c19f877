//! Challenge signing for the DFU handshake.
//!
//! The controller authenticates the host by handing out a 16-byte random
//! challenge and expecting it back signed with a key derived from the device
//! UID. The substitution box and round constants for the derivation are not
//! fixed: they are read out of the firmware image itself, at fixed distances
//! from the image's signing base offset.

/// Distance from the base offset to the 256-byte substitution box.
const SBOX_OFFSET: usize = 0xA802;
/// Distance from the base offset to the round-constant vector. Index 0 is
/// unused; indices 1..=10 are read from the image.
const RCON_OFFSET: usize = 0xAA02;

/// Historical base offset of the signing tables in Brightway images. Shipping
/// callers pass the discovered `63 7C` pattern offset instead.
pub const DEFAULT_BASE_OFFSET: usize = 0x17080;

const ROUNDS: usize = 10;
const KEY_LEN: usize = 176;

/// Substitution box and round constants extracted from a firmware image.
#[derive(Clone)]
pub struct Tables {
    sbox: [u8; 256],
    rcon: [u8; ROUNDS + 1],
}

impl Tables {
    /// Reads the signing tables at `base_offset` inside `fw`, or `None` if the
    /// image is too short to contain them.
    pub fn extract(fw: &[u8], base_offset: usize) -> Option<Self> {
        let sbox_start = base_offset.checked_add(SBOX_OFFSET)?;
        let rcon_start = base_offset.checked_add(RCON_OFFSET)?;
        if fw.len() < sbox_start + 256 || fw.len() < rcon_start + ROUNDS + 1 {
            return None;
        }

        let mut sbox = [0; 256];
        sbox.copy_from_slice(&fw[sbox_start..sbox_start + 256]);

        let mut rcon = [0; ROUNDS + 1];
        for (i, value) in rcon.iter_mut().enumerate().skip(1) {
            *value = fw[rcon_start + i];
        }

        Some(Tables { sbox, rcon })
    }
}

/// Expands the 16-byte UID into the 176-byte round-key schedule.
fn gen_key(uid: &[u8; 16], tables: &Tables) -> [u8; KEY_LEN] {
    let mut key = [0; KEY_LEN];
    key[..16].copy_from_slice(uid);

    for j in (16..KEY_LEN).step_by(4) {
        key.copy_within(j - 16..j - 12, j);

        let mixer: [u8; 4] = if j % 16 != 0 {
            [key[j - 4], key[j - 3], key[j - 2], key[j - 1]]
        } else {
            // Rotate-then-substitute; the round constant only touches byte 0.
            [
                tables.sbox[key[j - 3] as usize] ^ tables.rcon[j / 16],
                tables.sbox[key[j - 2] as usize],
                tables.sbox[key[j - 1] as usize],
                tables.sbox[key[j - 4] as usize],
            ]
        };
        for i in 0..4 {
            key[j + i] ^= mixer[i];
        }
    }
    key
}

/// GF(2⁸) doubling with `0x1B` reduction.
fn xtime(value: u8) -> u8 {
    (value << 1) ^ if value & 0x80 != 0 { 0x1B } else { 0 }
}

/// In-place column mix applied between rounds, on each 4-byte column.
fn mix_columns(state: &mut [u8; 16]) {
    for column in (0..16).step_by(4) {
        let deltas = [
            state[column] ^ state[column + 1],
            state[column + 1] ^ state[column + 2],
            state[column + 2] ^ state[column + 3],
            state[column + 3] ^ state[column],
        ];
        let spread = deltas[0] ^ deltas[2];
        for i in 0..4 {
            state[column + i] ^= xtime(deltas[i]) ^ spread;
        }
    }
}

fn rotate_left_one(state: &mut [u8; 16], indices: &[usize]) {
    let first = state[indices[0]];
    for pair in indices.windows(2) {
        state[pair[0]] = state[pair[1]];
    }
    state[*indices.last().unwrap()] = first;
}

/// Signs the 16-byte challenge `rand` with the key derived from `uid`, using
/// the given signing tables.
pub fn sign_rand(uid: &[u8; 16], rand: &[u8; 16], tables: &Tables) -> [u8; 16] {
    let key = gen_key(uid, tables);

    let mut state = *rand;
    for round in 0..ROUNDS {
        if round > 0 {
            mix_columns(&mut state);
        }
        for i in 0..16 {
            state[i] ^= key[round * 16 + i];
        }
        for byte in &mut state {
            *byte = tables.sbox[*byte as usize];
        }
        rotate_left_one(&mut state, &[1, 5, 9, 13]);
        rotate_left_one(&mut state, &[2, 10]);
        rotate_left_one(&mut state, &[3, 15, 11, 7]);
        rotate_left_one(&mut state, &[6, 14]);
    }
    for i in 0..16 {
        state[i] ^= key[ROUNDS * 16 + i];
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tables() -> Tables {
        // An arbitrary bijective substitution and non-trivial round constants;
        // the algorithm doesn't care whether they are the AES ones.
        let mut sbox = [0; 256];
        for (i, value) in sbox.iter_mut().enumerate() {
            *value = (i as u8).wrapping_mul(167).wrapping_add(43).rotate_left(3);
        }
        let mut rcon = [0; 11];
        for (i, value) in rcon.iter_mut().enumerate().skip(1) {
            *value = (i as u8).wrapping_mul(0x1D);
        }
        Tables { sbox, rcon }
    }

    fn fw_with_tables(base: usize) -> Vec<u8> {
        let tables = test_tables();
        let mut fw = vec![0x55; base + RCON_OFFSET + 0x20];
        fw[base + SBOX_OFFSET..base + SBOX_OFFSET + 256].copy_from_slice(&tables.sbox);
        for i in 1..=10 {
            fw[base + RCON_OFFSET + i] = tables.rcon[i];
        }
        fw
    }

    #[test]
    fn extract_reads_tables_at_base() {
        let fw = fw_with_tables(0x400);
        let tables = Tables::extract(&fw, 0x400).unwrap();
        let expected = test_tables();
        assert_eq!(tables.sbox, expected.sbox);
        assert_eq!(tables.rcon, expected.rcon);
    }

    #[test]
    fn extract_rejects_truncated_image() {
        let fw = vec![0; 0x1000];
        assert!(Tables::extract(&fw, 0x400).is_none());
        assert!(Tables::extract(&fw, usize::MAX - 0x100).is_none());
    }

    #[test]
    fn key_schedule_is_deterministic() {
        let tables = test_tables();
        let uid = *b"foobarfoobar1337";
        assert_eq!(gen_key(&uid, &tables), gen_key(&uid, &tables));
    }

    #[test]
    fn key_schedule_starts_with_uid() {
        let tables = test_tables();
        let uid = *b"foobarfoobar1337";
        let key = gen_key(&uid, &tables);
        assert_eq!(&key[..16], &uid);
    }

    #[test]
    fn sign_is_deterministic() {
        let tables = test_tables();
        let uid = *b"foobarfoobar1337";
        let rand: [u8; 16] = core::array::from_fn(|i| i as u8 + 1);
        assert_eq!(sign_rand(&uid, &rand, &tables), sign_rand(&uid, &rand, &tables));
    }

    #[test]
    fn sign_has_no_collisions_over_sample() {
        // Statistical stand-in for the permutation property: a few thousand
        // distinct inputs must produce distinct outputs under a fixed key.
        let tables = test_tables();
        let uid = *b"foobarfoobar1337";

        let mut seen = std::collections::HashSet::new();
        let mut rand = [0_u8; 16];
        let mut seed = 0x243F_6A88_u32;
        for _ in 0..4096 {
            for byte in &mut rand {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                *byte = (seed >> 24) as u8;
            }
            assert!(seen.insert(sign_rand(&uid, &rand, &tables)));
        }
    }

    #[test]
    fn sign_depends_on_every_table() {
        let tables = test_tables();
        let uid = *b"foobarfoobar1337";
        let rand = [0x5A; 16];
        let baseline = sign_rand(&uid, &rand, &tables);

        let mut other = tables.clone();
        other.rcon[10] ^= 0xFF;
        assert_ne!(sign_rand(&uid, &rand, &other), baseline);

        let mut other_uid = uid;
        other_uid[15] ^= 0x01;
        assert_ne!(sign_rand(&other_uid, &rand, &tables), baseline);
    }
}
