//! Crypto engine trait for the cbke-crypto back-ends

use super::*;
use defmt_or_log::trace;

/// Picks the curve for a session from the locally available and the partner's KE suites.
///
/// When both curves are shared, the stronger one (283k1) wins. Fails with `NoValidSuite` if the
/// local set is empty (a misconfiguration) and with `UnsupportedSuite` if there is no overlap.
pub fn select_curve(local_suites: SuiteSet, partner_suites: SuiteSet) -> Result<Curve, CbkeError> {
    trace!(
        "Enter select_curve local={} partner={}",
        local_suites.bits(),
        partner_suites.bits()
    );
    if local_suites.is_empty() {
        return Err(CbkeError::NoValidSuite);
    }
    local_suites
        .intersection(partner_suites)
        .preferred()
        .ok_or(CbkeError::UnsupportedSuite)
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum OperationKind {
    GenerateKeys,
    CalculateSmacs,
}

/// Token for a long-running crypto operation, returned when the operation is started and
/// carried again by its [`Completion`].
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct OperationHandle {
    pub kind: OperationKind,
    pub id: u16,
}

/// The result of a long-running crypto operation.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Completion {
    KeysGenerated {
        handle: OperationHandle,
        result: Result<PublicKey, CryptoError>,
    },
    SmacsCalculated {
        handle: OperationHandle,
        result: Result<SmacPair, CryptoError>,
    },
}

impl Completion {
    pub fn handle(&self) -> OperationHandle {
        match self {
            Completion::KeysGenerated { handle, .. } => *handle,
            Completion::SmacsCalculated { handle, .. } => *handle,
        }
    }
}

/// Interface between the cbke crate and the elliptic curve engine of the platform.
///
/// Sending the operations through a trait gives the library the flexibility to use the vendor
/// ECC library of a radio SoC, a hardware accelerator, or the simulated engine used for host
/// testing. The private half of the ephemeral key pair never leaves the implementation.
///
/// Key generation and SMAC calculation take up to a few seconds of dedicated CPU time, during
/// which the engine itself suspends the radio. They are therefore split: the call starts the
/// operation and returns an [`OperationHandle`]; the result is delivered later as a
/// [`Completion`], either pushed by the platform into the protocol engine or pulled through
/// [`CryptoEngine::poll_completion`]. At most one such operation may be in flight.
///
/// The trait operates on an exclusive reference, which matches engines that can only perform a
/// single operation at a time.
pub trait CryptoEngine: core::fmt::Debug {
    /// The KE suites for which the engine holds a certificate and key material.
    fn supported_suites(&self) -> SuiteSet;
    /// Returns the device's long-term certificate for `curve`.
    fn get_certificate(&mut self, curve: Curve) -> Result<Certificate, CryptoError>;
    /// Starts generating an ephemeral key pair on `curve`.
    fn generate_keys(&mut self, curve: Curve) -> Result<OperationHandle, CryptoError>;
    /// Starts deriving the shared secret, the link key and both SMACs from the stored ephemeral
    /// key and the partner's certificate and ephemeral public key.
    fn calculate_smacs(
        &mut self,
        curve: Curve,
        am_initiator: bool,
        partner_certificate: &Certificate,
        partner_public_key: &PublicKey,
    ) -> Result<OperationHandle, CryptoError>;
    /// Persists (`commit_link_key`) or discards the derived link key, and wipes the ephemeral
    /// private key. Calling it again without an exchange in between has no effect.
    fn clear_temporary_data(&mut self, curve: Curve, commit_link_key: bool)
        -> Result<(), CryptoError>;
    /// Verifies an ECDSA signature over `digest` made by the owner of `signer_certificate`.
    fn dsa_verify(
        &mut self,
        curve: Curve,
        digest: &BytesDigest,
        signer_certificate: &Certificate,
        signature: &[u8],
    ) -> Result<(), CryptoError>;
    /// Returns the completion of the in-flight operation, once it is available.
    fn poll_completion(&mut self) -> Option<Completion>;
}
