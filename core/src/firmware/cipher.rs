//! XTEA payload decryption.
//!
//! Some vendor bundles ship the image XTEA-encrypted under a key embedded in
//! the flasher tooling. Blocks are 64-bit, words little-endian, 32 rounds; a
//! trailing partial block is passed through untouched.

/// Key embedded in the vendor's container tooling.
const PAYLOAD_KEY: [u32; 4] = [0x2065_7242, 0x6874_6769, 0x2079_6177, 0x2144_5055];

const DELTA: u32 = 0x9E37_79B9;
const ROUNDS: u32 = 32;

fn decrypt_block(block: &mut [u8]) {
    let mut v0 = u32::from_le_bytes(block[0..4].try_into().unwrap());
    let mut v1 = u32::from_le_bytes(block[4..8].try_into().unwrap());

    let mut sum = DELTA.wrapping_mul(ROUNDS);
    for _ in 0..ROUNDS {
        v1 = v1.wrapping_sub(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(PAYLOAD_KEY[((sum >> 11) & 3) as usize])),
        );
        sum = sum.wrapping_sub(DELTA);
        v0 = v0.wrapping_sub(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                ^ (sum.wrapping_add(PAYLOAD_KEY[(sum & 3) as usize])),
        );
    }

    block[0..4].copy_from_slice(&v0.to_le_bytes());
    block[4..8].copy_from_slice(&v1.to_le_bytes());
}

/// Decrypts a whole payload. Always succeeds; whether the result is a
/// plausible image is for the caller to judge.
pub fn decrypt_payload(payload: &[u8]) -> Vec<u8> {
    let mut out = payload.to_vec();
    let full_blocks = out.len() / 8 * 8;
    for block in out[..full_blocks].chunks_exact_mut(8) {
        decrypt_block(block);
    }
    out
}

#[cfg(test)]
fn encrypt_block(block: &mut [u8]) {
    let mut v0 = u32::from_le_bytes(block[0..4].try_into().unwrap());
    let mut v1 = u32::from_le_bytes(block[4..8].try_into().unwrap());

    let mut sum = 0_u32;
    for _ in 0..ROUNDS {
        v0 = v0.wrapping_add(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                ^ (sum.wrapping_add(PAYLOAD_KEY[(sum & 3) as usize])),
        );
        sum = sum.wrapping_add(DELTA);
        v1 = v1.wrapping_add(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(PAYLOAD_KEY[((sum >> 11) & 3) as usize])),
        );
    }

    block[0..4].copy_from_slice(&v0.to_le_bytes());
    block[4..8].copy_from_slice(&v1.to_le_bytes());
}

#[cfg(test)]
pub fn encrypt_payload(payload: &[u8]) -> Vec<u8> {
    let mut out = payload.to_vec();
    let full_blocks = out.len() / 8 * 8;
    for block in out[..full_blocks].chunks_exact_mut(8) {
        encrypt_block(block);
    }
    out
}
