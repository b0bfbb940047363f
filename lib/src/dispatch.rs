use cbke_shared::*;
use defmt_or_log::{debug, trace};

/// Single entry point to the crypto engine for the curve of the current session.
///
/// The rest of the protocol is curve-agnostic: sizes and field offsets come from the curve
/// parameters, and every engine call is checked against the set of curves that are both
/// configured and backed by the engine. If that set is empty, every call fails with
/// [`CryptoError::NoValidSuite`] instead of falling back to a default curve.
///
/// The dispatcher also enforces that at most one long-running operation is in flight.
#[derive(Debug)]
pub struct CurveDispatcher<Crypto: CryptoEngine> {
    crypto: Crypto,
    available: SuiteSet,
    selected: Option<Curve>,
    in_flight: Option<OperationHandle>,
}

impl<Crypto: CryptoEngine> CurveDispatcher<Crypto> {
    /// Creates a dispatcher for the curves in `configured` that the engine supports.
    pub fn new(crypto: Crypto, configured: SuiteSet) -> Self {
        let available = configured.intersection(crypto.supported_suites());
        trace!("Initializing CurveDispatcher available={}", available.bits());
        CurveDispatcher {
            crypto,
            available,
            selected: None,
            in_flight: None,
        }
    }

    pub fn crypto(&self) -> &Crypto {
        &self.crypto
    }

    pub fn crypto_mut(&mut self) -> &mut Crypto {
        &mut self.crypto
    }

    pub fn available_suites(&self) -> SuiteSet {
        self.available
    }

    /// Whether a key generation or SMAC calculation is still running.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    fn ensure_available(&self, curve: Curve) -> Result<(), CryptoError> {
        if self.available.contains(curve) {
            Ok(())
        } else {
            Err(CryptoError::NoValidSuite)
        }
    }

    /// Selects the strongest curve shared with the partner.
    pub fn negotiate(&mut self, partner_suites: SuiteSet) -> Result<Curve, CbkeError> {
        let curve = select_curve(self.available, partner_suites)?;
        debug!("Selected KE suite {}", curve.suite());
        self.selected = Some(curve);
        Ok(curve)
    }

    /// Selects `curve` as requested by the partner.
    pub fn select(&mut self, curve: Curve) -> Result<(), CbkeError> {
        self.negotiate(SuiteSet::from(curve)).map(|_| ())
    }

    pub fn deselect(&mut self) {
        self.selected = None;
    }

    pub fn selected_curve(&self) -> Result<Curve, CryptoError> {
        match self.selected {
            Some(curve) if self.available.contains(curve) => Ok(curve),
            _ => Err(CryptoError::NoValidSuite),
        }
    }

    /// The device's own certificate for `curve`.
    pub fn local_certificate(&mut self, curve: Curve) -> Result<Certificate, CryptoError> {
        trace!("Enter local_certificate");
        self.ensure_available(curve)?;
        match self.crypto.get_certificate(curve) {
            Ok(certificate) if certificate.curve() == curve => Ok(certificate),
            _ => Err(CryptoError::NoLocalResources),
        }
    }

    pub fn subject_offset(&self, curve: Curve) -> usize {
        curve.params().subject_offset
    }

    pub fn issuer_offset(&self, curve: Curve) -> usize {
        curve.params().issuer_offset
    }

    pub fn subject(&self, certificate: &Certificate) -> Eui64 {
        certificate.identifier_at(self.subject_offset(certificate.curve()))
    }

    pub fn issuer(&self, certificate: &Certificate) -> Eui64 {
        certificate.identifier_at(self.issuer_offset(certificate.curve()))
    }

    /// Starts ephemeral key generation; the public key arrives as [`Completion::KeysGenerated`].
    pub fn generate_ephemeral_keys(&mut self, curve: Curve) -> Result<OperationHandle, CryptoError> {
        trace!("Enter generate_ephemeral_keys");
        self.ensure_available(curve)?;
        if self.in_flight.is_some() {
            return Err(CryptoError::OperationInProgress);
        }
        let handle = self.crypto.generate_keys(curve)?;
        self.in_flight = Some(handle);
        Ok(handle)
    }

    /// Starts the SMAC calculation; the SMACs arrive as [`Completion::SmacsCalculated`].
    pub fn calculate_shared_secret(
        &mut self,
        curve: Curve,
        am_initiator: bool,
        partner_certificate: &Certificate,
        partner_public_key: &PublicKey,
    ) -> Result<OperationHandle, CryptoError> {
        trace!("Enter calculate_shared_secret");
        self.ensure_available(curve)?;
        if partner_certificate.curve() != curve || partner_public_key.curve() != curve {
            return Err(CryptoError::NoValidSuite);
        }
        if self.in_flight.is_some() {
            return Err(CryptoError::OperationInProgress);
        }
        let handle = self.crypto.calculate_smacs(
            curve,
            am_initiator,
            partner_certificate,
            partner_public_key,
        )?;
        self.in_flight = Some(handle);
        Ok(handle)
    }

    /// Commits or discards the derived link key and ends any in-flight operation.
    pub fn clear_temporary_crypto_state(
        &mut self,
        curve: Curve,
        commit_link_key: bool,
    ) -> Result<(), CryptoError> {
        trace!("Enter clear_temporary_crypto_state commit={}", commit_link_key);
        self.ensure_available(curve)?;
        // a completion that arrives after this point is stale
        self.in_flight = None;
        self.crypto.clear_temporary_data(curve, commit_link_key)
    }

    /// Verifies a signature made by the owner of `signer_certificate`.
    pub fn verify_digest(
        &mut self,
        curve: Curve,
        digest: &BytesDigest,
        signer_certificate: &Certificate,
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        trace!("Enter verify_digest");
        self.ensure_available(curve)?;
        if signer_certificate.curve() != curve || signature.len() != curve.signature_len() {
            return Err(CryptoError::InvalidSignature);
        }
        self.crypto
            .dsa_verify(curve, digest, signer_certificate, signature)
    }

    /// Accepts the completion of the in-flight operation, rejecting stale ones.
    pub fn complete(&mut self, completion: Completion) -> Result<Completion, CryptoError> {
        if self.in_flight == Some(completion.handle()) {
            self.in_flight = None;
            Ok(completion)
        } else {
            Err(CryptoError::StaleOperation)
        }
    }

    pub fn poll(&mut self) -> Option<Completion> {
        self.crypto.poll_completion()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cbke_crypto_sim::SimCrypto;
    use rand_chacha::ChaCha8Rng;
    use rand_chacha::rand_core::SeedableRng;

    const SUBJECT: Eui64 = [0x00, 0x0d, 0x6f, 0x00, 0x00, 0x19, 0x8b, 0x36];
    const ISSUER: Eui64 = [0x54, 0x45, 0x53, 0x54, 0x53, 0x45, 0x43, 0x41];

    fn dispatcher(configured: SuiteSet) -> CurveDispatcher<SimCrypto<ChaCha8Rng>> {
        let crypto = SimCrypto::new(ChaCha8Rng::seed_from_u64(7), SUBJECT, ISSUER);
        CurveDispatcher::new(crypto, configured)
    }

    #[test]
    fn test_no_valid_suite_when_both_curves_disabled() {
        let mut dispatcher = dispatcher(SuiteSet::EMPTY);
        assert_eq!(dispatcher.selected_curve(), Err(CryptoError::NoValidSuite));
        assert_eq!(
            dispatcher.negotiate(SuiteSet::ALL),
            Err(CbkeError::NoValidSuite)
        );
        for curve in Curve::ALL {
            assert_eq!(
                dispatcher.local_certificate(curve),
                Err(CryptoError::NoValidSuite)
            );
            assert_eq!(
                dispatcher.generate_ephemeral_keys(curve),
                Err(CryptoError::NoValidSuite)
            );
            assert_eq!(
                dispatcher.clear_temporary_crypto_state(curve, false),
                Err(CryptoError::NoValidSuite)
            );
        }
    }

    #[test]
    fn test_selected_curve() {
        let mut dispatcher = dispatcher(SuiteSet::from(Curve::Secp163k1));
        assert_eq!(dispatcher.selected_curve(), Err(CryptoError::NoValidSuite));
        assert_eq!(
            dispatcher.select(Curve::Secp283k1),
            Err(CbkeError::UnsupportedSuite)
        );
        assert_eq!(dispatcher.negotiate(SuiteSet::ALL), Ok(Curve::Secp163k1));
        assert_eq!(dispatcher.selected_curve(), Ok(Curve::Secp163k1));
        dispatcher.deselect();
        assert_eq!(dispatcher.selected_curve(), Err(CryptoError::NoValidSuite));
    }

    #[test]
    fn test_offsets() {
        let dispatcher = dispatcher(SuiteSet::ALL);
        assert_eq!(dispatcher.subject_offset(Curve::Secp163k1), 22);
        assert_eq!(dispatcher.issuer_offset(Curve::Secp163k1), 30);
        assert_eq!(dispatcher.subject_offset(Curve::Secp283k1), 11);
        assert_eq!(dispatcher.issuer_offset(Curve::Secp283k1), 10);
    }

    #[test]
    fn test_local_certificate_matches_curve() {
        let mut dispatcher = dispatcher(SuiteSet::ALL);
        for curve in Curve::ALL {
            let certificate = dispatcher.local_certificate(curve).unwrap();
            assert_eq!(certificate.curve(), curve);
            assert_eq!(certificate.as_slice().len(), curve.certificate_len());
            assert_eq!(dispatcher.issuer(&certificate), ISSUER);
        }
        let certificate = dispatcher.local_certificate(Curve::Secp163k1).unwrap();
        assert_eq!(dispatcher.subject(&certificate), SUBJECT);
    }

    #[test]
    fn test_local_certificate_missing() {
        let crypto = SimCrypto::new(ChaCha8Rng::seed_from_u64(1), SUBJECT, ISSUER)
            .with_suites(SuiteSet::from(Curve::Secp163k1));
        let mut dispatcher = CurveDispatcher::new(crypto, SuiteSet::ALL);
        // the engine has no 283k1 material, so the curve is not available at all
        assert_eq!(
            dispatcher.local_certificate(Curve::Secp283k1),
            Err(CryptoError::NoValidSuite)
        );

        let mut crypto = SimCrypto::new(ChaCha8Rng::seed_from_u64(1), SUBJECT, ISSUER);
        crypto.remove_certificate(Curve::Secp163k1);
        let mut dispatcher = CurveDispatcher::new(crypto, SuiteSet::ALL);
        assert_eq!(
            dispatcher.local_certificate(Curve::Secp163k1),
            Err(CryptoError::NoLocalResources)
        );
    }

    #[test]
    fn test_single_operation_in_flight() {
        let mut dispatcher = dispatcher(SuiteSet::ALL);
        let handle = dispatcher
            .generate_ephemeral_keys(Curve::Secp163k1)
            .unwrap();
        assert!(dispatcher.is_busy());
        assert_eq!(
            dispatcher.generate_ephemeral_keys(Curve::Secp163k1),
            Err(CryptoError::OperationInProgress)
        );

        let completion = dispatcher.poll().unwrap();
        assert_eq!(completion.handle(), handle);
        let completion = dispatcher.complete(completion).unwrap();
        assert!(!dispatcher.is_busy());
        match completion {
            Completion::KeysGenerated { result, .. } => {
                assert_eq!(result.unwrap().as_slice().len(), PUBLIC_KEY_LEN_163K1)
            }
            _ => panic!("unexpected completion"),
        }

        // delivering it twice is rejected
        let stale = Completion::KeysGenerated {
            handle,
            result: Err(CryptoError::Failed),
        };
        assert_eq!(dispatcher.complete(stale), Err(CryptoError::StaleOperation));
    }

    #[test]
    fn test_clear_makes_completion_stale() {
        let mut dispatcher = dispatcher(SuiteSet::ALL);
        dispatcher
            .generate_ephemeral_keys(Curve::Secp283k1)
            .unwrap();
        dispatcher
            .clear_temporary_crypto_state(Curve::Secp283k1, false)
            .unwrap();
        assert!(!dispatcher.is_busy());
        // repeated clears are harmless
        dispatcher
            .clear_temporary_crypto_state(Curve::Secp283k1, false)
            .unwrap();
        assert_eq!(dispatcher.crypto().last_clear(), Some(false));
    }

    #[test]
    fn test_shared_secret_rejects_mixed_curves() {
        let mut dispatcher = dispatcher(SuiteSet::ALL);
        let certificate = dispatcher.local_certificate(Curve::Secp163k1).unwrap();
        let public_key = PublicKey::from_slice(Curve::Secp283k1, &[3; 37]).unwrap();
        assert_eq!(
            dispatcher.calculate_shared_secret(Curve::Secp163k1, true, &certificate, &public_key),
            Err(CryptoError::NoValidSuite)
        );
        assert!(!dispatcher.is_busy());
    }

    #[test]
    fn test_verify_digest() {
        let mut dispatcher = dispatcher(SuiteSet::ALL);
        let digest: BytesDigest = [0xa5; DIGEST_LEN];
        for curve in Curve::ALL {
            let certificate = dispatcher.local_certificate(curve).unwrap();
            let signature = dispatcher.crypto_mut().sign_digest(curve, &digest).unwrap();
            assert_eq!(
                dispatcher.verify_digest(curve, &digest, &certificate, signature.as_slice()),
                Ok(())
            );

            let mut forged = signature;
            forged.content[0] ^= 0x01;
            assert_eq!(
                dispatcher.verify_digest(curve, &digest, &certificate, forged.as_slice()),
                Err(CryptoError::InvalidSignature)
            );
            assert_eq!(
                dispatcher.verify_digest(curve, &digest, &certificate, &signature.as_slice()[1..]),
                Err(CryptoError::InvalidSignature)
            );
        }
    }
}
