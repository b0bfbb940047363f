//! Crypto engine dispatch for the cbke crate
//!
//! This crate is used by applications and tests to decide which crypto engine to use. The
//! protocol engine in cbke is generic over [`CryptoTrait`], so embedded users can also pass
//! the vendor ECC library of their SoC directly; this crate only provides the default choice
//! for the host.
#![cfg_attr(not(test), no_std)]

/// Convenience re-export
pub use cbke_shared::CryptoEngine as CryptoTrait;

use cbke_shared::Eui64;

#[cfg(feature = "sim")]
pub type Crypto = cbke_crypto_sim::SimCrypto<rand_core::OsRng>;

/// An engine for a device whose certificates carry `subject` and were issued by `issuer`.
#[cfg(feature = "sim")]
pub const fn default_crypto(subject: Eui64, issuer: Eui64) -> Crypto {
    cbke_crypto_sim::SimCrypto::new(rand_core::OsRng, subject, issuer)
}

/// See test_implements_crypto
#[allow(dead_code)]
fn test_helper<T: CryptoTrait>() {}

/// Ensure at build time that whichever type as selected for Crypto actually implements the
/// CryptoEngine trait, and that one is actually defined.
#[allow(dead_code)]
fn test_implements_crypto() {
    test_helper::<Crypto>()
}

#[cfg(test)]
mod tests {
    use cbke_shared::*;
    use hexlit::hex;
    use rstest::rstest;

    use super::*;

    const SUBJECT: Eui64 = hex!("000d6f0000198b36");
    const ISSUER: Eui64 = hex!("5445535453454341");

    #[rstest]
    #[case(Curve::Secp163k1)]
    #[case(Curve::Secp283k1)]
    fn test_default_crypto(#[case] curve: Curve) {
        let mut crypto = default_crypto(SUBJECT, ISSUER);
        assert!(crypto.supported_suites().contains(curve));

        let certificate = crypto.get_certificate(curve).unwrap();
        assert_eq!(certificate.as_slice().len(), curve.certificate_len());
        assert_eq!(certificate.issuer(), ISSUER);

        let handle = crypto.generate_keys(curve).unwrap();
        match crypto.poll_completion() {
            Some(Completion::KeysGenerated { handle: done, result }) => {
                assert_eq!(done, handle);
                assert_eq!(result.unwrap().curve(), curve);
            }
            other => panic!("unexpected completion {:?}", other),
        }
        crypto.clear_temporary_data(curve, false).unwrap();
    }

    #[test]
    fn test_fresh_ephemeral_keys() {
        let mut crypto = default_crypto(SUBJECT, ISSUER);
        let mut keys = [None, None];
        for key in keys.iter_mut() {
            crypto.generate_keys(Curve::Secp163k1).unwrap();
            if let Some(Completion::KeysGenerated { result, .. }) = crypto.poll_completion() {
                *key = result.ok();
            }
            crypto.clear_temporary_data(Curve::Secp163k1, false).unwrap();
        }
        assert!(keys[0].is_some());
        assert_ne!(keys[0], keys[1]);
    }
}
