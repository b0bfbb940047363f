//! Common data structures used by [cbke] and its crypto back-ends
//!
//! This crate is separate from cbke so that crypto engine implementations (hardware
//! accelerators, vendor ECC libraries or the simulated engine) can implement [`CryptoEngine`]
//! without depending on the protocol crate. As its types are re-exported by cbke, it is
//! recommended to use them through the public re-export there wherever possible.
//!
//! [cbke]: https://docs.rs/cbke/
#![no_std]

use zeroize::Zeroize;

mod crypto;
pub use crypto::*;

mod buffer;
pub use buffer::*;

pub const EUI64_LEN: usize = 8;
pub const SMAC_LEN: usize = 16;
/// AES-MMO digest size, as signed and verified by the DSA entry points
pub const DIGEST_LEN: usize = 16;

pub const CERTIFICATE_LEN_163K1: usize = 48;
pub const PUBLIC_KEY_LEN_163K1: usize = 22;
pub const PRIVATE_KEY_LEN_163K1: usize = 21;
pub const SIGNATURE_LEN_163K1: usize = 42;
pub const SUBJECT_OFFSET_163K1: usize = 22;
pub const ISSUER_OFFSET_163K1: usize = 30;

pub const CERTIFICATE_LEN_283K1: usize = 74;
pub const PUBLIC_KEY_LEN_283K1: usize = 37;
pub const PRIVATE_KEY_LEN_283K1: usize = 36;
pub const SIGNATURE_LEN_283K1: usize = 72;
// NOTE: these two overlap; they are kept as configured for the 283k1 certificate profile
pub const SUBJECT_OFFSET_283K1: usize = 11;
pub const ISSUER_OFFSET_283K1: usize = 10;

pub const MAX_CERTIFICATE_LEN: usize = CERTIFICATE_LEN_283K1;
pub const MAX_PUBLIC_KEY_LEN: usize = PUBLIC_KEY_LEN_283K1;
pub const MAX_SIGNATURE_LEN: usize = SIGNATURE_LEN_283K1;

/// KE suite bit for ECMQV over sect163k1 (crypto suite 1)
pub const KE_SUITE_163K1: u16 = 0x0001;
/// KE suite bit for ECMQV over sect283k1 (crypto suite 2)
pub const KE_SUITE_283K1: u16 = 0x0002;

pub type Eui64 = [u8; EUI64_LEN];
pub type Smac = [u8; SMAC_LEN];
pub type BytesDigest = [u8; DIGEST_LEN];
pub type BufferSignature = CbkeBuffer<MAX_SIGNATURE_LEN>;

/// Sizes and field offsets that differ between the two certificate profiles.
#[derive(Debug, PartialEq, Eq)]
pub struct CurveParams {
    pub certificate_len: usize,
    pub public_key_len: usize,
    pub private_key_len: usize,
    pub signature_len: usize,
    pub subject_offset: usize,
    pub issuer_offset: usize,
    pub suite: u16,
}

pub const CURVE_PARAMS_163K1: CurveParams = CurveParams {
    certificate_len: CERTIFICATE_LEN_163K1,
    public_key_len: PUBLIC_KEY_LEN_163K1,
    private_key_len: PRIVATE_KEY_LEN_163K1,
    signature_len: SIGNATURE_LEN_163K1,
    subject_offset: SUBJECT_OFFSET_163K1,
    issuer_offset: ISSUER_OFFSET_163K1,
    suite: KE_SUITE_163K1,
};

pub const CURVE_PARAMS_283K1: CurveParams = CurveParams {
    certificate_len: CERTIFICATE_LEN_283K1,
    public_key_len: PUBLIC_KEY_LEN_283K1,
    private_key_len: PRIVATE_KEY_LEN_283K1,
    signature_len: SIGNATURE_LEN_283K1,
    subject_offset: SUBJECT_OFFSET_283K1,
    issuer_offset: ISSUER_OFFSET_283K1,
    suite: KE_SUITE_283K1,
};

/// The elliptic curve of a key establishment exchange.
///
/// A session that has not selected a curve yet is represented by the absence of a `Curve`
/// (see `CurveDispatcher::selected_curve` in the main crate).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum Curve {
    Secp163k1 = 0,
    Secp283k1 = 1,
}

impl Curve {
    /// All curves, in order of increasing strength.
    pub const ALL: [Curve; 2] = [Curve::Secp163k1, Curve::Secp283k1];

    pub const fn params(self) -> &'static CurveParams {
        match self {
            Curve::Secp163k1 => &CURVE_PARAMS_163K1,
            Curve::Secp283k1 => &CURVE_PARAMS_283K1,
        }
    }

    pub const fn certificate_len(self) -> usize {
        self.params().certificate_len
    }

    pub const fn public_key_len(self) -> usize {
        self.params().public_key_len
    }

    pub const fn signature_len(self) -> usize {
        self.params().signature_len
    }

    pub const fn suite(self) -> u16 {
        self.params().suite
    }

    /// Maps a single KE suite value (as carried in the initiate and terminate messages) to its
    /// curve. Values with zero or several bits set map to `None`.
    pub fn from_suite(suite: u16) -> Option<Self> {
        Curve::ALL.into_iter().find(|curve| curve.suite() == suite)
    }
}

/// A set of KE suites, as advertised in the key establishment suite attribute.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
pub struct SuiteSet(u16);

impl SuiteSet {
    pub const EMPTY: SuiteSet = SuiteSet(0);
    pub const ALL: SuiteSet = SuiteSet(KE_SUITE_163K1 | KE_SUITE_283K1);

    /// Builds a set from the raw attribute bitmask; unknown bits are dropped.
    pub const fn from_bits(bits: u16) -> Self {
        SuiteSet(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, curve: Curve) -> bool {
        self.0 & curve.suite() != 0
    }

    pub const fn with(self, curve: Curve) -> Self {
        SuiteSet(self.0 | curve.suite())
    }

    pub const fn intersection(self, other: SuiteSet) -> Self {
        SuiteSet(self.0 & other.0)
    }

    /// The strongest curve in the set.
    pub fn preferred(self) -> Option<Curve> {
        Curve::ALL.into_iter().rev().find(|curve| self.contains(*curve))
    }
}

impl From<Curve> for SuiteSet {
    fn from(curve: Curve) -> Self {
        SuiteSet(curve.suite())
    }
}

/// An implicit certificate of a given curve.
///
/// The length always equals the certificate length of its curve; this is checked at
/// construction, so a certificate of the wrong size can never be stored or sent.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Certificate {
    curve: Curve,
    bytes: CbkeBuffer<MAX_CERTIFICATE_LEN>,
}

impl Certificate {
    /// Try to construct a certificate from a slice.
    ///
    /// Returns None if the length does not match the curve's certificate length; nothing is
    /// truncated or padded.
    ///
    /// ```
    /// # use cbke_shared::*;
    /// assert!(Certificate::from_slice(Curve::Secp163k1, &[0; 48]).is_some());
    /// assert!(Certificate::from_slice(Curve::Secp283k1, &[0; 48]).is_none());
    /// ```
    pub fn from_slice(curve: Curve, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != curve.certificate_len() {
            return None;
        }
        Some(Certificate {
            curve,
            bytes: CbkeBuffer::new_from_slice(bytes).ok()?,
        })
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    /// The 8-byte identifier found at `offset`.
    pub fn identifier_at(&self, offset: usize) -> Eui64 {
        let mut id = Eui64::default();
        // the curve parameters keep every identifier inside the certificate
        if let Some(bytes) = self.bytes.get_slice(offset, EUI64_LEN) {
            id.copy_from_slice(bytes);
        }
        id
    }

    /// Device identifier of the certificate's owner.
    pub fn subject(&self) -> Eui64 {
        self.identifier_at(self.curve.params().subject_offset)
    }

    /// Identifier of the certificate authority that issued the certificate.
    pub fn issuer(&self) -> Eui64 {
        self.identifier_at(self.curve.params().issuer_offset)
    }
}

/// An ephemeral public key (compressed point) of a given curve.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct PublicKey {
    curve: Curve,
    bytes: CbkeBuffer<MAX_PUBLIC_KEY_LEN>,
}

impl PublicKey {
    /// Try to construct a public key from a slice; None if the length does not match the curve.
    pub fn from_slice(curve: Curve, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != curve.public_key_len() {
            return None;
        }
        Some(PublicKey {
            curve,
            bytes: CbkeBuffer::new_from_slice(bytes).ok()?,
        })
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_slice()
    }
}

/// The two SMACs produced by one shared secret calculation.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default, Zeroize)]
pub struct SmacPair {
    /// MACU, sent by the initiator in its confirm key request
    pub initiator: Smac,
    /// MACV, sent by the responder in its confirm key response
    pub responder: Smac,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[non_exhaustive]
pub enum StoreError {
    /// A certificate is already pending, or a public key arrived without one.
    OutOfSequence,
    /// Retrieval was attempted before both certificate and public key were stored.
    Incomplete,
    /// The material does not have the length required by its curve.
    SizeMismatch,
    /// The public key belongs to a different curve than the pending certificate.
    CurveMismatch,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[non_exhaustive]
pub enum CryptoError {
    /// Neither curve is available, or none is selected.
    NoValidSuite,
    /// The engine has no certificate for the curve, or lacks memory for the operation.
    NoLocalResources,
    /// Another long-running operation has not completed yet.
    OperationInProgress,
    /// A completion arrived for an operation that is not in flight.
    StaleOperation,
    InvalidSignature,
    /// The engine reported a failure of the requested operation.
    Failed,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[non_exhaustive]
pub enum CbkeError {
    /// A session is already in progress.
    Busy,
    /// There is no session that the event could belong to.
    NoSession,
    NoValidSuite,
    NoLocalResources,
    BadMessage,
    UnsupportedSuite,
    InvalidCertificate,
    /// The partner certificate was not issued by the local certificate's issuer.
    InvalidCertificateIssuer,
    BadKeyConfirm,
    OutOfSequence,
    Incomplete,
    Timeout,
}

impl CbkeError {
    /// The status carried by the terminate message that reports this error to the partner.
    ///
    /// Local limitations (a busy device, a failing crypto engine, a timeout) are all reported
    /// as [`TerminateStatus::NoResources`], and sequencing problems as
    /// [`TerminateStatus::BadMessage`]: the partner cannot act on a finer distinction.
    pub fn terminate_status(&self) -> TerminateStatus {
        use CbkeError::*;
        match self {
            Busy => TerminateStatus::NoResources,
            NoSession => TerminateStatus::BadMessage,
            NoValidSuite => TerminateStatus::UnsupportedSuite,
            NoLocalResources => TerminateStatus::NoResources,
            BadMessage => TerminateStatus::BadMessage,
            UnsupportedSuite => TerminateStatus::UnsupportedSuite,
            InvalidCertificate => TerminateStatus::InvalidCertificate,
            InvalidCertificateIssuer => TerminateStatus::UnknownIssuer,
            BadKeyConfirm => TerminateStatus::BadKeyConfirm,
            OutOfSequence => TerminateStatus::BadMessage,
            Incomplete => TerminateStatus::BadMessage,
            Timeout => TerminateStatus::NoResources,
        }
    }
}

impl From<StoreError> for CbkeError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::OutOfSequence => CbkeError::OutOfSequence,
            StoreError::Incomplete => CbkeError::Incomplete,
            StoreError::SizeMismatch | StoreError::CurveMismatch => CbkeError::BadMessage,
        }
    }
}

impl From<CryptoError> for CbkeError {
    fn from(error: CryptoError) -> Self {
        match error {
            CryptoError::NoValidSuite => CbkeError::NoValidSuite,
            CryptoError::StaleOperation => CbkeError::BadMessage,
            CryptoError::InvalidSignature => CbkeError::InvalidCertificate,
            CryptoError::NoLocalResources
            | CryptoError::OperationInProgress
            | CryptoError::Failed => CbkeError::NoLocalResources,
        }
    }
}

/// Status code of a Terminate Key Establishment message
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[repr(u8)]
pub enum TerminateStatus {
    UnknownIssuer = 0x01,
    BadKeyConfirm = 0x02,
    BadMessage = 0x03,
    NoResources = 0x04,
    UnsupportedSuite = 0x05,
    InvalidCertificate = 0x06,
}

impl TerminateStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        use TerminateStatus::*;
        match value {
            0x01 => Some(UnknownIssuer),
            0x02 => Some(BadKeyConfirm),
            0x03 => Some(BadMessage),
            0x04 => Some(NoResources),
            0x05 => Some(UnsupportedSuite),
            0x06 => Some(InvalidCertificate),
            _ => None,
        }
    }
}

impl From<TerminateStatus> for u8 {
    fn from(status: TerminateStatus) -> u8 {
        status as u8
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Curve::Secp163k1, 48, 22, 22, 30)]
    #[case(Curve::Secp283k1, 74, 37, 11, 10)]
    fn test_curve_params(
        #[case] curve: Curve,
        #[case] certificate_len: usize,
        #[case] public_key_len: usize,
        #[case] subject_offset: usize,
        #[case] issuer_offset: usize,
    ) {
        let params = curve.params();
        assert_eq!(params.certificate_len, certificate_len);
        assert_eq!(params.public_key_len, public_key_len);
        assert_eq!(params.subject_offset, subject_offset);
        assert_eq!(params.issuer_offset, issuer_offset);
        assert!(params.subject_offset + EUI64_LEN <= params.certificate_len);
        assert!(params.issuer_offset + EUI64_LEN <= params.certificate_len);
        assert!(params.certificate_len <= MAX_CERTIFICATE_LEN);
        assert!(params.public_key_len <= MAX_PUBLIC_KEY_LEN);
    }

    #[test]
    fn test_suite_set() {
        assert_eq!(SuiteSet::ALL.preferred(), Some(Curve::Secp283k1));
        assert_eq!(
            SuiteSet::from(Curve::Secp163k1).preferred(),
            Some(Curve::Secp163k1)
        );
        assert_eq!(SuiteSet::EMPTY.preferred(), None);
        assert_eq!(SuiteSet::from_bits(0xfff4), SuiteSet::EMPTY);
        assert!(SuiteSet::from_bits(0x0003).contains(Curve::Secp163k1));
        assert_eq!(
            SuiteSet::from_bits(0x0001).intersection(SuiteSet::from_bits(0x0002)),
            SuiteSet::EMPTY
        );
        assert_eq!(Curve::from_suite(0x0002), Some(Curve::Secp283k1));
        assert_eq!(Curve::from_suite(0x0003), None);
    }

    #[test]
    fn test_certificate_identifiers() {
        let mut bytes = [0u8; CERTIFICATE_LEN_163K1];
        bytes[22..30].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        bytes[30..38].copy_from_slice(&[9, 9, 9, 9, 9, 9, 9, 9]);
        let certificate = Certificate::from_slice(Curve::Secp163k1, &bytes).unwrap();
        assert_eq!(certificate.subject(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(certificate.issuer(), [9; 8]);
        assert_eq!(certificate.as_slice(), &bytes[..]);
    }

    #[test]
    fn test_public_key_length_is_checked() {
        assert!(PublicKey::from_slice(Curve::Secp163k1, &[2; 22]).is_some());
        assert!(PublicKey::from_slice(Curve::Secp163k1, &[2; 37]).is_none());
        assert!(PublicKey::from_slice(Curve::Secp283k1, &[2; 22]).is_none());
    }

    #[test]
    fn test_terminate_status_mapping() {
        assert_eq!(
            CbkeError::InvalidCertificateIssuer.terminate_status(),
            TerminateStatus::UnknownIssuer
        );
        assert_eq!(
            CbkeError::from(StoreError::OutOfSequence).terminate_status(),
            TerminateStatus::BadMessage
        );
        assert_eq!(
            CbkeError::from(CryptoError::Failed),
            CbkeError::NoLocalResources
        );
        for code in 1..=6u8 {
            let status = TerminateStatus::from_u8(code).unwrap();
            assert_eq!(u8::from(status), code);
        }
        assert_eq!(TerminateStatus::from_u8(0), None);
    }
}
