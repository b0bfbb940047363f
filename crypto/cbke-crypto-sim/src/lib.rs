//! A simulated CBKE crypto engine
//!
//! This engine stands in for the vendor ECC library on hosts and in tests. It keeps the same
//! contract (certificates per curve, ephemeral key generation and SMAC calculation completed
//! asynchronously, commit or discard of the link key), but it does **not** perform ECMQV: the
//! shared secret is a hash over the public data of both parties. Two instances agree on the
//! SMACs exactly when they see the same certificates and ephemeral public keys, which is all
//! the protocol layer can observe. Never use it to protect real traffic.
#![cfg_attr(not(test), no_std)]

use cbke_shared::{
    BufferSignature, BytesDigest, Certificate, Completion, CryptoEngine, CryptoError, Curve,
    Eui64, OperationHandle, OperationKind, PublicKey, Smac, SmacPair, SuiteSet,
    MAX_CERTIFICATE_LEN, MAX_PUBLIC_KEY_LEN, PRIVATE_KEY_LEN_283K1, SMAC_LEN,
};
use defmt_or_log::trace;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

pub const LINK_KEY_LEN: usize = 16;
pub type BytesLinkKey = [u8; LINK_KEY_LEN];

/// SMAC message prefix of the initiator (MACU)
const SMAC_PREFIX_INITIATOR: u8 = 0x02;
/// SMAC message prefix of the responder (MACV)
const SMAC_PREFIX_RESPONDER: u8 = 0x03;

struct EphemeralKey {
    curve: Curve,
    private: [u8; PRIVATE_KEY_LEN_283K1],
    public: PublicKey,
}

impl Drop for EphemeralKey {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

/// A simulated engine holding one device's certificates and temporary key material.
///
/// Its size depends on the implementation of Rng passed in at creation.
pub struct SimCrypto<Rng: rand_core::RngCore + rand_core::CryptoRng> {
    rng: Rng,
    subject: Eui64,
    issuer: Eui64,
    suites: SuiteSet,
    missing_certificates: SuiteSet,
    next_id: u16,
    pending: Option<Completion>,
    ephemeral: Option<EphemeralKey>,
    link_key: Option<BytesLinkKey>,
    committed_link_key: Option<BytesLinkKey>,
    last_clear: Option<bool>,
    fail_next: Option<OperationKind>,
}

impl<Rng: rand_core::RngCore + rand_core::CryptoRng> SimCrypto<Rng> {
    /// Creates an engine for the device `subject`, with certificates issued by `issuer` on both
    /// curves.
    pub const fn new(rng: Rng, subject: Eui64, issuer: Eui64) -> Self {
        Self {
            rng,
            subject,
            issuer,
            suites: SuiteSet::ALL,
            missing_certificates: SuiteSet::EMPTY,
            next_id: 0,
            pending: None,
            ephemeral: None,
            link_key: None,
            committed_link_key: None,
            last_clear: None,
            fail_next: None,
        }
    }

    /// Restricts the curves the engine has key material for.
    pub fn with_suites(mut self, suites: SuiteSet) -> Self {
        self.suites = suites;
        self
    }

    /// Makes certificate retrieval for `curve` fail, as with a corrupted token.
    pub fn remove_certificate(&mut self, curve: Curve) {
        self.missing_certificates = self.missing_certificates.with(curve);
    }

    /// Makes the next operation of the given kind complete with [`CryptoError::Failed`].
    pub fn fail_next(&mut self, kind: OperationKind) {
        self.fail_next = Some(kind);
    }

    /// The `commit_link_key` argument of the most recent `clear_temporary_data` call.
    pub fn last_clear(&self) -> Option<bool> {
        self.last_clear
    }

    pub fn committed_link_key(&self) -> Option<&BytesLinkKey> {
        self.committed_link_key.as_ref()
    }

    pub fn has_temporary_data(&self) -> bool {
        self.ephemeral.is_some() || self.link_key.is_some()
    }

    /// Signs `digest` with the device's identity on `curve`, as verified by `dsa_verify`.
    pub fn sign_digest(
        &mut self,
        curve: Curve,
        digest: &BytesDigest,
    ) -> Result<BufferSignature, CryptoError> {
        let certificate = self.get_certificate(curve)?;
        simulated_signature(&certificate, digest)
    }

    fn next_handle(&mut self, kind: OperationKind) -> OperationHandle {
        self.next_id = self.next_id.wrapping_add(1);
        OperationHandle {
            kind,
            id: self.next_id,
        }
    }

    fn take_failure(&mut self, kind: OperationKind) -> bool {
        if self.fail_next == Some(kind) {
            self.fail_next = None;
            true
        } else {
            false
        }
    }

    fn build_certificate(&self, curve: Curve) -> Result<Certificate, CryptoError> {
        let params = curve.params();
        let mut content = [0u8; MAX_CERTIFICATE_LEN];
        let bytes = &mut content[..params.certificate_len];

        // reconstruction data, deterministic per device and curve
        Hkdf::<Sha256>::new(Some(&self.issuer[..]), &self.subject)
            .expand(&[b'c', curve as u8], bytes)
            .map_err(|_| CryptoError::Failed)?;
        bytes[params.subject_offset..params.subject_offset + self.subject.len()]
            .copy_from_slice(&self.subject);
        // written last, so that the issuer wins where the two fields overlap
        bytes[params.issuer_offset..params.issuer_offset + self.issuer.len()]
            .copy_from_slice(&self.issuer);

        Certificate::from_slice(curve, bytes).ok_or(CryptoError::Failed)
    }
}

impl<Rng: rand_core::RngCore + rand_core::CryptoRng> core::fmt::Debug for SimCrypto<Rng> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_struct("cbke_crypto_sim::SimCrypto")
            .field("rng", &core::any::type_name::<Rng>())
            .field("subject", &self.subject)
            .field("suites", &self.suites)
            .field("pending", &self.pending.as_ref().map(|c| c.handle()))
            .finish()
    }
}

impl<Rng: rand_core::RngCore + rand_core::CryptoRng> CryptoEngine for SimCrypto<Rng> {
    fn supported_suites(&self) -> SuiteSet {
        self.suites
    }

    fn get_certificate(&mut self, curve: Curve) -> Result<Certificate, CryptoError> {
        if !self.suites.contains(curve) || self.missing_certificates.contains(curve) {
            return Err(CryptoError::NoLocalResources);
        }
        self.build_certificate(curve)
    }

    fn generate_keys(&mut self, curve: Curve) -> Result<OperationHandle, CryptoError> {
        trace!("Enter generate_keys");
        if !self.suites.contains(curve) {
            return Err(CryptoError::NoValidSuite);
        }
        if self.pending.is_some() {
            return Err(CryptoError::OperationInProgress);
        }
        let handle = self.next_handle(OperationKind::GenerateKeys);
        if self.take_failure(OperationKind::GenerateKeys) {
            self.pending = Some(Completion::KeysGenerated {
                handle,
                result: Err(CryptoError::Failed),
            });
            return Ok(handle);
        }

        let params = curve.params();
        let mut private = [0u8; PRIVATE_KEY_LEN_283K1];
        self.rng.fill_bytes(&mut private[..params.private_key_len]);

        // compressed point: parity byte followed by the x coordinate
        let mut public = [0u8; MAX_PUBLIC_KEY_LEN];
        public[0] = 0x02 | (private[0] & 0x01);
        Hkdf::<Sha256>::new(None, &private[..params.private_key_len])
            .expand(b"cbke-sim-public", &mut public[1..params.public_key_len])
            .map_err(|_| CryptoError::Failed)?;
        let public = PublicKey::from_slice(curve, &public[..params.public_key_len])
            .ok_or(CryptoError::Failed)?;

        self.ephemeral = Some(EphemeralKey {
            curve,
            private,
            public,
        });
        private.zeroize();
        self.pending = Some(Completion::KeysGenerated {
            handle,
            result: Ok(public),
        });
        Ok(handle)
    }

    fn calculate_smacs(
        &mut self,
        curve: Curve,
        am_initiator: bool,
        partner_certificate: &Certificate,
        partner_public_key: &PublicKey,
    ) -> Result<OperationHandle, CryptoError> {
        trace!("Enter calculate_smacs");
        if !self.suites.contains(curve) {
            return Err(CryptoError::NoValidSuite);
        }
        if self.pending.is_some() {
            return Err(CryptoError::OperationInProgress);
        }
        let own_public_key = match &self.ephemeral {
            Some(ephemeral) if ephemeral.curve == curve => ephemeral.public,
            _ => return Err(CryptoError::Failed),
        };
        let handle = self.next_handle(OperationKind::CalculateSmacs);
        if self.take_failure(OperationKind::CalculateSmacs) {
            self.pending = Some(Completion::SmacsCalculated {
                handle,
                result: Err(CryptoError::Failed),
            });
            return Ok(handle);
        }

        let own_certificate = self.build_certificate(curve)?;
        let (cert_u, cert_v, qe_u, qe_v) = if am_initiator {
            (&own_certificate, partner_certificate, &own_public_key, partner_public_key)
        } else {
            (partner_certificate, &own_certificate, partner_public_key, &own_public_key)
        };

        let mut z: [u8; 32] = Sha256::new()
            .chain_update(b"cbke-sim-z")
            .chain_update(cert_u.as_slice())
            .chain_update(cert_v.as_slice())
            .chain_update(qe_u.as_slice())
            .chain_update(qe_v.as_slice())
            .finalize()
            .into();

        // MacKey || KeyData
        let mut okm = [0u8; SMAC_LEN + LINK_KEY_LEN];
        let expanded = Hkdf::<Sha256>::new(None, &z).expand(b"cbke-sim-kdf", &mut okm);
        z.zeroize();
        expanded.map_err(|_| CryptoError::Failed)?;

        let (mac_key, key_data) = okm.split_at(SMAC_LEN);
        let smacs = compute_smac(
            mac_key,
            SMAC_PREFIX_INITIATOR,
            &cert_u.subject(),
            &cert_v.subject(),
            qe_u,
            qe_v,
        )
        .and_then(|initiator| {
            let responder = compute_smac(
                mac_key,
                SMAC_PREFIX_RESPONDER,
                &cert_v.subject(),
                &cert_u.subject(),
                qe_v,
                qe_u,
            )?;
            Ok(SmacPair {
                initiator,
                responder,
            })
        });

        let mut link_key = BytesLinkKey::default();
        link_key.copy_from_slice(key_data);
        okm.zeroize();
        self.link_key = Some(link_key);
        link_key.zeroize();

        self.pending = Some(Completion::SmacsCalculated {
            handle,
            result: smacs,
        });
        Ok(handle)
    }

    fn clear_temporary_data(
        &mut self,
        curve: Curve,
        commit_link_key: bool,
    ) -> Result<(), CryptoError> {
        trace!("Enter clear_temporary_data commit={}", commit_link_key);
        if !self.suites.contains(curve) {
            return Err(CryptoError::NoValidSuite);
        }
        self.last_clear = Some(commit_link_key);
        self.pending = None;
        self.ephemeral = None;
        if let Some(mut link_key) = self.link_key.take() {
            if commit_link_key {
                self.committed_link_key = Some(link_key);
            }
            link_key.zeroize();
        }
        Ok(())
    }

    fn dsa_verify(
        &mut self,
        curve: Curve,
        digest: &BytesDigest,
        signer_certificate: &Certificate,
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        trace!("Enter dsa_verify");
        if signer_certificate.curve() != curve {
            return Err(CryptoError::InvalidSignature);
        }
        let expected = simulated_signature(signer_certificate, digest)?;
        if expected.as_slice() == signature {
            Ok(())
        } else {
            Err(CryptoError::InvalidSignature)
        }
    }

    fn poll_completion(&mut self) -> Option<Completion> {
        self.pending.take()
    }
}

fn compute_smac(
    mac_key: &[u8],
    prefix: u8,
    id_first: &Eui64,
    id_second: &Eui64,
    qe_first: &PublicKey,
    qe_second: &PublicKey,
) -> Result<Smac, CryptoError> {
    let mut mac = HmacSha256::new_from_slice(mac_key).map_err(|_| CryptoError::Failed)?;
    mac.update(&[prefix]);
    mac.update(id_first);
    mac.update(id_second);
    mac.update(qe_first.as_slice());
    mac.update(qe_second.as_slice());
    let tag = mac.finalize().into_bytes();

    let mut smac = Smac::default();
    smac.copy_from_slice(&tag[..SMAC_LEN]);
    Ok(smac)
}

fn simulated_signature(
    signer_certificate: &Certificate,
    digest: &BytesDigest,
) -> Result<BufferSignature, CryptoError> {
    let len = signer_certificate.curve().signature_len();
    let mut signature = BufferSignature::new();
    Hkdf::<Sha256>::new(Some(&digest[..]), signer_certificate.as_slice())
        .expand(b"cbke-sim-dsa", &mut signature.content[..len])
        .map_err(|_| CryptoError::Failed)?;
    signature.len = len;
    Ok(signature)
}
