//! Temporary storage of partner material during one key establishment exchange
//!
//! The partner's certificate arrives first, its ephemeral public key second; both are handed
//! to the SMAC calculation together and released right after. Next to them, the store holds
//! the SMAC the partner is expected to report in its confirm key message.
use cbke_shared::*;

mod fixed;
pub use fixed::FixedStore;

#[cfg(feature = "alloc")]
mod chained;
#[cfg(feature = "alloc")]
pub use chained::ChainedStore;

/// Storage for the partner data of the current exchange.
///
/// A rejected call leaves the store unchanged. Released material is wiped, not just
/// forgotten.
pub trait PartnerStore: core::fmt::Debug {
    /// Stores the partner certificate (`is_certificate`) or, after it, the partner's ephemeral
    /// public key.
    fn store_partner_material(
        &mut self,
        curve: Curve,
        is_certificate: bool,
        bytes: &[u8],
    ) -> Result<(), StoreError>;

    /// Hands out certificate and public key together and releases them.
    fn retrieve_and_clear_partner_material(
        &mut self,
    ) -> Result<(Certificate, PublicKey), StoreError>;

    /// Keeps the SMAC expected from the partner, wiping any earlier one.
    fn store_smac(&mut self, smac: &Smac) -> Result<(), StoreError>;

    fn smac(&self) -> Option<&Smac>;

    /// Releases everything; calling it on an empty store is fine.
    fn clear_all(&mut self);

    fn has_pending_certificate(&self) -> bool;
}

/// Checks shared by the backends before anything is written.
pub(crate) fn check_material(
    pending: Option<(Curve, bool)>,
    curve: Curve,
    is_certificate: bool,
    bytes: &[u8],
) -> Result<(), StoreError> {
    match (is_certificate, pending) {
        (true, Some(_)) => Err(StoreError::OutOfSequence),
        (true, None) if bytes.len() != curve.certificate_len() => Err(StoreError::SizeMismatch),
        (true, None) => Ok(()),
        (false, None) | (false, Some((_, true))) => Err(StoreError::OutOfSequence),
        (false, Some((pending_curve, false))) if pending_curve != curve => {
            Err(StoreError::CurveMismatch)
        }
        (false, Some(_)) if bytes.len() != curve.public_key_len() => Err(StoreError::SizeMismatch),
        (false, Some(_)) => Ok(()),
    }
}
