//! Shamir secret sharing over GF(2^8) plus share hashing/validation.
//!
//! The DEK is split byte-wise: for each of its 32 bytes, a random polynomial
//! of degree threshold-1 has that byte as its constant term and is evaluated
//! at x = 1..=n. Share layout: `[x, y_0, ..., y_31]` (33 bytes).

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use stet_core::{StetError, StetResult};

use crate::dek::{Dek, Share};
use crate::{DEK_SIZE, SHARE_HASH_SIZE};

/// GF(2^8) with the AES reduction polynomial x^8 + x^4 + x^3 + x + 1.
mod gf256 {
    /// Carry-less multiply with reduction after each doubling.
    pub fn mul(mut a: u8, mut b: u8) -> u8 {
        let mut acc = 0u8;
        for _ in 0..8 {
            if b & 1 == 1 {
                acc ^= a;
            }
            let overflow = a & 0x80 != 0;
            a <<= 1;
            if overflow {
                a ^= 0x1b;
            }
            b >>= 1;
        }
        acc
    }

    /// Multiplicative inverse as a^254 (Fermat). inv(0) == 0.
    pub fn inv(a: u8) -> u8 {
        let mut result = 1u8;
        let mut base = a;
        let mut exp = 254u32;
        while exp > 0 {
            if exp & 1 == 1 {
                result = mul(result, base);
            }
            base = mul(base, base);
            exp >>= 1;
        }
        result
    }

    /// Horner evaluation; coefficients ordered constant-term first.
    pub fn eval(coeffs: &[u8], x: u8) -> u8 {
        let mut acc = 0u8;
        for &c in coeffs.iter().rev() {
            acc = mul(acc, x) ^ c;
        }
        acc
    }
}

/// SHA-256 digest of a plaintext share, stored beside its wrapped form.
pub fn hash_share(share: &[u8]) -> [u8; SHARE_HASH_SIZE] {
    let digest = Sha256::digest(share);
    digest.into()
}

/// Constant-time check of a share against its stored hash.
pub fn validate_share(share: &[u8], expected: &[u8]) -> bool {
    if expected.len() != SHARE_HASH_SIZE {
        return false;
    }
    let hash = hash_share(share);
    hash.as_slice().ct_eq(expected).into()
}

/// Split a DEK into `n` shares, any `threshold` of which reconstruct it.
pub fn split(dek: &Dek, n: u8, threshold: u8) -> StetResult<Vec<Share>> {
    if threshold < 2 || threshold > n {
        return Err(StetError::ConfigInvalid(format!(
            "cannot split into {n} shares with threshold {threshold}"
        )));
    }

    let mut buffers: Vec<Vec<u8>> = (1..=n)
        .map(|x| {
            let mut data = vec![0u8; DEK_SIZE + 1];
            data[0] = x;
            data
        })
        .collect();

    let mut coeffs = vec![0u8; threshold as usize];
    for (byte_idx, &secret_byte) in dek.as_bytes().iter().enumerate() {
        coeffs[0] = secret_byte;
        OsRng.fill_bytes(&mut coeffs[1..]);

        for buffer in &mut buffers {
            let x = buffer[0];
            buffer[byte_idx + 1] = gf256::eval(&coeffs, x);
        }
    }
    coeffs.zeroize();

    Ok(buffers.into_iter().map(Share::new).collect())
}

/// Recombine shares into the DEK via Lagrange interpolation at x = 0.
///
/// When more than `threshold` shares are supplied, only the first
/// `threshold` (in input order) participate.
pub fn combine(shares: &[Share], threshold: usize) -> StetResult<Dek> {
    for share in shares {
        if share.len() < 2 {
            return Err(StetError::MalformedShare);
        }
        if share.len() != shares[0].len() {
            return Err(StetError::LengthMismatch);
        }
    }
    if shares.len() < threshold {
        return Err(StetError::InsufficientShares {
            got: shares.len(),
            need: threshold,
        });
    }

    let mut seen = [false; 256];
    for share in shares {
        let x = share.as_bytes()[0];
        if seen[x as usize] {
            return Err(StetError::DuplicateShare(x));
        }
        seen[x as usize] = true;
    }

    if shares[0].len() != DEK_SIZE + 1 {
        return Err(StetError::MalformedShare);
    }

    let subset = &shares[..threshold];
    let xs: Vec<u8> = subset.iter().map(|s| s.as_bytes()[0]).collect();

    // Lagrange basis at x = 0: L_j(0) = prod_{m != j} x_m / (x_j + x_m).
    let mut basis = vec![0u8; threshold];
    for j in 0..threshold {
        let mut numerator = 1u8;
        let mut denominator = 1u8;
        for m in 0..threshold {
            if m == j {
                continue;
            }
            numerator = gf256::mul(numerator, xs[m]);
            denominator = gf256::mul(denominator, xs[j] ^ xs[m]);
        }
        basis[j] = gf256::mul(numerator, gf256::inv(denominator));
    }

    let mut dek_bytes = [0u8; DEK_SIZE];
    for (byte_idx, out) in dek_bytes.iter_mut().enumerate() {
        let mut acc = 0u8;
        for j in 0..threshold {
            acc ^= gf256::mul(subset[j].as_bytes()[byte_idx + 1], basis[j]);
        }
        *out = acc;
    }

    let dek = Dek::from_bytes(dek_bytes);
    dek_bytes.zeroize();
    Ok(dek)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dek() -> Dek {
        let mut bytes = [0u8; DEK_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Dek::from_bytes(bytes)
    }

    #[test]
    fn test_gf256_mul_identity_and_zero() {
        for a in 0..=255u8 {
            assert_eq!(gf256::mul(a, 1), a);
            assert_eq!(gf256::mul(1, a), a);
            assert_eq!(gf256::mul(a, 0), 0);
            assert_eq!(gf256::mul(0, a), 0);
        }
    }

    #[test]
    fn test_gf256_mul_commutative() {
        for a in 0..=255u8 {
            for b in 0..=255u8 {
                assert_eq!(gf256::mul(a, b), gf256::mul(b, a));
            }
        }
    }

    #[test]
    fn test_gf256_inverse_exhaustive() {
        assert_eq!(gf256::inv(0), 0);
        for a in 1..=255u8 {
            let ai = gf256::inv(a);
            assert_eq!(gf256::mul(a, ai), 1, "a={a} inv={ai}");
        }
    }

    #[test]
    fn test_gf256_eval() {
        // constant polynomial
        assert_eq!(gf256::eval(&[7], 0), 7);
        assert_eq!(gf256::eval(&[7], 200), 7);
        // 5 + 3x at x=1: addition is XOR
        assert_eq!(gf256::eval(&[5, 3], 1), 5 ^ 3);
    }

    #[test]
    fn test_split_combine_roundtrip() {
        let dek = test_dek();
        let shares = split(&dek, 5, 3).unwrap();
        assert_eq!(shares.len(), 5);
        for (i, share) in shares.iter().enumerate() {
            assert_eq!(share.len(), DEK_SIZE + 1);
            assert_eq!(share.as_bytes()[0], (i + 1) as u8);
        }

        let recovered = combine(&shares[..3], 3).unwrap();
        assert_eq!(recovered.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn test_combine_any_subset() {
        let dek = test_dek();
        let shares = split(&dek, 5, 3).unwrap();

        for combo in [[0usize, 1, 2], [0, 2, 4], [1, 3, 4], [2, 3, 4]] {
            let subset: Vec<Share> = combo.iter().map(|&i| shares[i].clone()).collect();
            let recovered = combine(&subset, 3).unwrap();
            assert_eq!(recovered.as_bytes(), dek.as_bytes());
        }
    }

    #[test]
    fn test_combine_uses_first_threshold_shares() {
        let dek = test_dek();
        let mut shares = split(&dek, 4, 2).unwrap();

        // Corrupt a share beyond the first `threshold`; it must not be read.
        let mut tampered = shares[3].as_bytes().to_vec();
        tampered[5] ^= 0xFF;
        shares[3] = Share::new(tampered);

        let recovered = combine(&shares, 2).unwrap();
        assert_eq!(recovered.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn test_combine_insufficient_shares() {
        let dek = test_dek();
        let shares = split(&dek, 5, 3).unwrap();
        let result = combine(&shares[..2], 3);
        assert!(matches!(
            result,
            Err(StetError::InsufficientShares { got: 2, need: 3 })
        ));
    }

    #[test]
    fn test_below_threshold_reveals_nothing_usable() {
        // Two different DEKs, identical x-coordinates: with threshold-1
        // shares the codec refuses to interpolate at all.
        let shares = split(&test_dek(), 3, 3).unwrap();
        assert!(combine(&shares[..2], 3).is_err());
    }

    #[test]
    fn test_combine_duplicate_share() {
        let dek = test_dek();
        let shares = split(&dek, 3, 2).unwrap();
        let dupes = vec![shares[1].clone(), shares[1].clone()];
        assert!(matches!(
            combine(&dupes, 2),
            Err(StetError::DuplicateShare(2))
        ));
    }

    #[test]
    fn test_combine_malformed_share() {
        let short = vec![Share::new(vec![1]), Share::new(vec![2])];
        assert!(matches!(
            combine(&short, 2),
            Err(StetError::MalformedShare)
        ));

        // Consistent length but not a 32-byte secret
        let odd = vec![Share::new(vec![1, 9, 9]), Share::new(vec![2, 8, 8])];
        assert!(matches!(combine(&odd, 2), Err(StetError::MalformedShare)));
    }

    #[test]
    fn test_combine_length_mismatch() {
        let dek = test_dek();
        let shares = split(&dek, 2, 2).unwrap();
        let mixed = vec![shares[0].clone(), Share::new(vec![2, 0, 0])];
        assert!(matches!(
            combine(&mixed, 2),
            Err(StetError::LengthMismatch)
        ));
    }

    #[test]
    fn test_split_rejects_bad_parameters() {
        let dek = test_dek();
        assert!(split(&dek, 3, 1).is_err());
        assert!(split(&dek, 3, 4).is_err());
    }

    #[test]
    fn test_max_shares() {
        let dek = test_dek();
        let shares = split(&dek, 255, 2).unwrap();
        assert_eq!(shares.len(), 255);
        let recovered = combine(&[shares[250].clone(), shares[7].clone()], 2).unwrap();
        assert_eq!(recovered.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn test_hash_and_validate() {
        let share = b"some share material";
        let hash = hash_share(share);
        assert!(validate_share(share, &hash));
        assert!(!validate_share(b"other material", &hash));
        assert!(!validate_share(share, &hash[..31]));
    }
}
