//! Threshold secret sharing for password escrow.
//!
//! A secret is split bytewise into N shares over GF(256) such that any K
//! shares reconstruct it and any fewer reveal nothing. Shares carry their
//! own scheme parameters and an integrity checksum so reconstruction can
//! reject mismatched or corrupted inputs before interpolating.

use crate::{PkvaultError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

const SHARE_VERSION: u8 = 1;
const CHECKSUM_LEN: usize = 8;

/// One share of a split secret.
///
/// Self-describing: carries the share index, the scheme parameters it was
/// produced under, and a truncated SHA-256 checksum over all of them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscrowShare {
    pub version: u8,
    /// Evaluation point, 1-based. Index 0 would expose the secret.
    pub index: u8,
    #[serde(with = "crate::identity::hex_bytes")]
    pub value: Vec<u8>,
    pub total: u8,
    pub threshold: u8,
    #[serde(with = "crate::identity::hex_bytes")]
    pub checksum: Vec<u8>,
}

impl EscrowShare {
    fn compute_checksum(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update([self.version, self.index, self.total, self.threshold]);
        hasher.update(&self.value);
        hasher.finalize()[..CHECKSUM_LEN].to_vec()
    }

    /// Checks the share's own integrity.
    ///
    /// An index of zero is the secret itself, not an evaluation point, and
    /// an index above the recorded total cannot have come from the split
    /// that produced this share.
    pub fn verify(&self) -> Result<()> {
        if self.index == 0 || self.index > self.total {
            return Err(PkvaultError::InconsistentShares(format!(
                "share index {} outside 1..={}",
                self.index, self.total
            )));
        }
        let computed = self.compute_checksum();
        if self.checksum.ct_eq(&computed).unwrap_u8() == 0 {
            return Err(PkvaultError::InconsistentShares(format!(
                "share {} failed its checksum",
                self.index
            )));
        }
        Ok(())
    }
}

/// Splits and reconstructs secrets with Shamir's scheme over GF(256).
#[derive(Debug, Clone)]
pub struct EscrowEngine {
    max_shares: u8,
}

impl EscrowEngine {
    pub fn new(max_shares: u8) -> Self {
        Self { max_shares }
    }

    /// Splits `secret` into `total` shares, any `threshold` of which
    /// reconstruct it.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::Parameter`] if `threshold` is zero, exceeds
    /// `total`, or `total` exceeds the configured maximum.
    pub fn split(&self, secret: &[u8], total: u8, threshold: u8) -> Result<Vec<EscrowShare>> {
        if threshold == 0 {
            return Err(PkvaultError::Parameter(
                "escrow threshold must be at least 1".to_string(),
            ));
        }
        if threshold > total {
            return Err(PkvaultError::Parameter(format!(
                "escrow threshold {} exceeds share count {}",
                threshold, total
            )));
        }
        if total > self.max_shares {
            return Err(PkvaultError::Parameter(format!(
                "share count {} exceeds maximum {}",
                total, self.max_shares
            )));
        }
        if secret.is_empty() {
            return Err(PkvaultError::Parameter(
                "cannot split an empty secret".to_string(),
            ));
        }

        // One random polynomial per secret byte, degree threshold - 1,
        // constant term = the secret byte.
        let mut rng = rand::rngs::OsRng;
        let mut coeffs: Vec<Zeroizing<Vec<u8>>> = Vec::with_capacity(secret.len());
        for &byte in secret {
            let mut poly = Zeroizing::new(vec![0u8; threshold as usize]);
            poly[0] = byte;
            rng.fill_bytes(&mut poly[1..]);
            coeffs.push(poly);
        }

        let mut shares = Vec::with_capacity(total as usize);
        for index in 1..=total {
            let value: Vec<u8> = coeffs
                .iter()
                .map(|poly| eval_poly(poly, index))
                .collect();
            let mut share = EscrowShare {
                version: SHARE_VERSION,
                index,
                value,
                total,
                threshold,
                checksum: Vec::new(),
            };
            share.checksum = share.compute_checksum();
            shares.push(share);
        }
        Ok(shares)
    }

    /// Reconstructs a secret from at least `threshold` distinct shares.
    ///
    /// # Errors
    ///
    /// - [`PkvaultError::InsufficientShares`]: fewer distinct shares than
    ///   the threshold recorded in them
    /// - [`PkvaultError::InconsistentShares`]: shares from different splits,
    ///   duplicate indices, or a failed checksum
    pub fn reconstruct(&self, shares: &[EscrowShare]) -> Result<Zeroizing<Vec<u8>>> {
        let first = shares.first().ok_or(PkvaultError::InsufficientShares {
            have: 0,
            need: 1,
        })?;

        for share in shares {
            share.verify()?;
            if share.version != first.version {
                return Err(PkvaultError::InconsistentShares(
                    "shares carry different versions".to_string(),
                ));
            }
            if share.total != first.total
                || share.threshold != first.threshold
                || share.value.len() != first.value.len()
            {
                return Err(PkvaultError::InconsistentShares(
                    "shares were not produced by the same split".to_string(),
                ));
            }
        }

        let mut indices: Vec<u8> = shares.iter().map(|s| s.index).collect();
        indices.sort_unstable();
        indices.dedup();
        if indices.len() != shares.len() {
            return Err(PkvaultError::InconsistentShares(
                "duplicate share indices".to_string(),
            ));
        }
        if shares.len() < first.threshold as usize {
            return Err(PkvaultError::InsufficientShares {
                have: shares.len(),
                need: first.threshold,
            });
        }

        // Only threshold shares are needed; extras are ignored.
        let used = &shares[..first.threshold as usize];
        let mut secret = Zeroizing::new(vec![0u8; first.value.len()]);
        for (pos, byte) in secret.iter_mut().enumerate() {
            let points: Vec<(u8, u8)> = used.iter().map(|s| (s.index, s.value[pos])).collect();
            *byte = interpolate_at_zero(&points);
        }
        Ok(secret)
    }
}

fn eval_poly(coeffs: &[u8], x: u8) -> u8 {
    // Horner evaluation, highest coefficient first.
    let mut acc = 0u8;
    for &c in coeffs.iter().rev() {
        acc = gf_mul(acc, x) ^ c;
    }
    acc
}

fn interpolate_at_zero(points: &[(u8, u8)]) -> u8 {
    let mut acc = 0u8;
    for (i, &(xi, yi)) in points.iter().enumerate() {
        let mut num = 1u8;
        let mut den = 1u8;
        for (j, &(xj, _)) in points.iter().enumerate() {
            if i == j {
                continue;
            }
            num = gf_mul(num, xj);
            den = gf_mul(den, xi ^ xj);
        }
        acc ^= gf_mul(yi, gf_mul(num, gf_inv(den)));
    }
    acc
}

// GF(2^8) with the AES reduction polynomial x^8 + x^4 + x^3 + x + 1.
fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        let carry = a & 0x80;
        a <<= 1;
        if carry != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    product
}

fn gf_pow(base: u8, mut exp: u8) -> u8 {
    let mut result = 1u8;
    let mut acc = base;
    while exp != 0 {
        if exp & 1 != 0 {
            result = gf_mul(result, acc);
        }
        acc = gf_mul(acc, acc);
        exp >>= 1;
    }
    result
}

fn gf_inv(a: u8) -> u8 {
    // a^254 = a^-1 in GF(2^8); inputs are nonzero by construction
    // (denominators are products of distinct nonzero indices).
    gf_pow(a, 254)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_arithmetic() {
        assert_eq!(gf_mul(0x53, 0xca), 0x01);
        assert_eq!(gf_inv(0x53), 0xca);
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1);
        }
    }

    #[test]
    fn test_threshold_reconstruction() {
        let engine = EscrowEngine::new(255);
        let shares = engine.split(b"correct horse battery staple", 5, 3).unwrap();
        assert_eq!(shares.len(), 5);

        // Any three shares suffice, in any order.
        let subset = vec![shares[4].clone(), shares[1].clone(), shares[2].clone()];
        let secret = engine.reconstruct(&subset).unwrap();
        assert_eq!(secret.as_slice(), b"correct horse battery staple");
    }

    #[test]
    fn test_all_shares_reconstruct() {
        let engine = EscrowEngine::new(255);
        let shares = engine.split(b"secret", 4, 2).unwrap();
        let secret = engine.reconstruct(&shares).unwrap();
        assert_eq!(secret.as_slice(), b"secret");
    }

    #[test]
    fn test_below_threshold_fails() {
        let engine = EscrowEngine::new(255);
        let shares = engine.split(b"secret", 5, 3).unwrap();

        let err = engine.reconstruct(&shares[..2]).unwrap_err();
        assert!(matches!(
            err,
            PkvaultError::InsufficientShares { have: 2, need: 3 }
        ));
    }

    #[test]
    fn test_duplicate_shares_do_not_count() {
        let engine = EscrowEngine::new(255);
        let shares = engine.split(b"secret", 5, 3).unwrap();

        let dupes = vec![shares[0].clone(), shares[0].clone(), shares[1].clone()];
        let err = engine.reconstruct(&dupes).unwrap_err();
        assert!(matches!(err, PkvaultError::InconsistentShares(_)));
    }

    #[test]
    fn test_threshold_above_total_rejected() {
        let engine = EscrowEngine::new(255);
        let err = engine.split(b"secret", 3, 5).unwrap_err();
        assert!(matches!(err, PkvaultError::Parameter(_)));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let engine = EscrowEngine::new(255);
        let err = engine.split(b"secret", 3, 0).unwrap_err();
        assert!(matches!(err, PkvaultError::Parameter(_)));
    }

    #[test]
    fn test_max_shares_enforced() {
        let engine = EscrowEngine::new(10);
        let err = engine.split(b"secret", 11, 3).unwrap_err();
        assert!(matches!(err, PkvaultError::Parameter(_)));
    }

    #[test]
    fn test_mixed_splits_rejected() {
        let engine = EscrowEngine::new(255);
        let a = engine.split(b"secret", 3, 2).unwrap();
        let b = engine.split(b"secret", 5, 2).unwrap();

        let mixed = vec![a[0].clone(), b[1].clone()];
        let err = engine.reconstruct(&mixed).unwrap_err();
        assert!(matches!(err, PkvaultError::InconsistentShares(_)));
    }

    #[test]
    fn test_zero_index_share_rejected() {
        let engine = EscrowEngine::new(255);
        let shares = engine.split(b"secret", 3, 2).unwrap();

        // An evaluation point at zero is the secret itself; a forged share
        // claiming index 0 must not reach interpolation, even with a
        // checksum recomputed to match.
        let mut forged = shares[0].clone();
        forged.index = 0;
        forged.checksum = forged.compute_checksum();

        assert!(matches!(
            forged.verify(),
            Err(PkvaultError::InconsistentShares(_))
        ));
        let err = engine
            .reconstruct(&[forged, shares[1].clone()])
            .unwrap_err();
        assert!(matches!(err, PkvaultError::InconsistentShares(_)));
    }

    #[test]
    fn test_index_above_total_rejected() {
        let engine = EscrowEngine::new(255);
        let shares = engine.split(b"secret", 3, 2).unwrap();

        let mut forged = shares[0].clone();
        forged.index = 4;
        forged.checksum = forged.compute_checksum();

        assert!(matches!(
            forged.verify(),
            Err(PkvaultError::InconsistentShares(_))
        ));
    }

    #[test]
    fn test_tampered_share_rejected() {
        let engine = EscrowEngine::new(255);
        let mut shares = engine.split(b"secret", 3, 2).unwrap();
        shares[0].value[0] ^= 0xff;

        let err = engine.reconstruct(&shares[..2]).unwrap_err();
        assert!(matches!(err, PkvaultError::InconsistentShares(_)));
    }

    #[test]
    fn test_single_share_of_threshold_one() {
        let engine = EscrowEngine::new(255);
        let shares = engine.split(b"s", 1, 1).unwrap();
        let secret = engine.reconstruct(&shares).unwrap();
        assert_eq!(secret.as_slice(), b"s");
    }
}
