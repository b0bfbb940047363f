use super::{check_material, PartnerStore};
use cbke_shared::*;
use defmt_or_log::trace;
use zeroize::Zeroize;

/// Partner store with fields sized for the larger curve. Never allocates.
#[derive(Default)]
pub struct FixedStore {
    /// Curve of the pending certificate, if any
    curve: Option<Curve>,
    certificate: CbkeBuffer<MAX_CERTIFICATE_LEN>,
    public_key: CbkeBuffer<MAX_PUBLIC_KEY_LEN>,
    smac: Option<Smac>,
}

impl FixedStore {
    pub const fn new() -> Self {
        FixedStore {
            curve: None,
            certificate: CbkeBuffer::new(),
            public_key: CbkeBuffer::new(),
            smac: None,
        }
    }

    fn release_partner_material(&mut self) {
        self.curve = None;
        self.certificate.zeroize();
        self.public_key.zeroize();
    }
}

impl core::fmt::Debug for FixedStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_struct("FixedStore")
            .field("curve", &self.curve)
            .field("certificate_len", &self.certificate.len())
            .field("public_key_len", &self.public_key.len())
            .field("has_smac", &self.smac.is_some())
            .finish()
    }
}

impl PartnerStore for FixedStore {
    fn store_partner_material(
        &mut self,
        curve: Curve,
        is_certificate: bool,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        trace!("Enter store_partner_material is_certificate={}", is_certificate);
        let pending = self
            .curve
            .map(|curve| (curve, !self.public_key.is_empty()));
        check_material(pending, curve, is_certificate, bytes)?;

        let target = if is_certificate {
            self.curve = Some(curve);
            self.certificate.fill_with_slice(bytes)
        } else {
            self.public_key.fill_with_slice(bytes)
        };
        // lengths were checked against the curve, which never exceeds the capacity
        target.map_err(|_| StoreError::SizeMismatch)
    }

    fn retrieve_and_clear_partner_material(
        &mut self,
    ) -> Result<(Certificate, PublicKey), StoreError> {
        trace!("Enter retrieve_and_clear_partner_material");
        let curve = self.curve.ok_or(StoreError::Incomplete)?;
        if self.public_key.is_empty() {
            return Err(StoreError::Incomplete);
        }
        let certificate = Certificate::from_slice(curve, self.certificate.as_slice())
            .ok_or(StoreError::SizeMismatch)?;
        let public_key = PublicKey::from_slice(curve, self.public_key.as_slice())
            .ok_or(StoreError::SizeMismatch)?;
        self.release_partner_material();
        Ok((certificate, public_key))
    }

    fn store_smac(&mut self, smac: &Smac) -> Result<(), StoreError> {
        self.smac.zeroize();
        self.smac = Some(*smac);
        Ok(())
    }

    fn smac(&self) -> Option<&Smac> {
        self.smac.as_ref()
    }

    fn clear_all(&mut self) {
        trace!("Enter clear_all");
        self.release_partner_material();
        self.smac.zeroize();
    }

    fn has_pending_certificate(&self) -> bool {
        self.curve.is_some()
    }
}

impl Drop for FixedStore {
    fn drop(&mut self) {
        self.clear_all();
    }
}
