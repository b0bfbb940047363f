use super::{check_material, PartnerStore};
use alloc::boxed::Box;
use cbke_shared::*;
use defmt_or_log::trace;
use zeroize::Zeroize;

/// Payload bytes held by one heap link.
pub(crate) const LINK_CAPACITY: usize = 32;

struct Link {
    bytes: [u8; LINK_CAPACITY],
    len: usize,
    next: Option<Box<Link>>,
}

impl Link {
    fn new(chunk: &[u8]) -> Self {
        let mut bytes = [0u8; LINK_CAPACITY];
        bytes[..chunk.len()].copy_from_slice(chunk);
        Link {
            bytes,
            len: chunk.len(),
            next: None,
        }
    }
}

/// A byte buffer made of heap links that are allocated as it grows.
///
/// Dropping the buffer wipes every link before its memory is released.
#[derive(Default)]
pub(crate) struct ChainedBuffer {
    head: Option<Box<Link>>,
    len: usize,
}

impl ChainedBuffer {
    pub(crate) fn from_slice(bytes: &[u8]) -> Self {
        let mut chain = ChainedBuffer::default();
        chain.extend_from_slice(bytes);
        chain
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn links(&self) -> impl Iterator<Item = &Link> {
        core::iter::successors(self.head.as_deref(), |link| link.next.as_deref())
    }

    pub(crate) fn link_count(&self) -> usize {
        self.links().count()
    }

    pub(crate) fn extend_from_slice(&mut self, mut bytes: &[u8]) {
        self.len += bytes.len();
        let mut cursor = &mut self.head;
        while let Some(link) = cursor {
            if link.next.is_none() {
                // top up the tail link first
                let take = (LINK_CAPACITY - link.len).min(bytes.len());
                link.bytes[link.len..link.len + take].copy_from_slice(&bytes[..take]);
                link.len += take;
                bytes = &bytes[take..];
            }
            cursor = &mut link.next;
        }
        for chunk in bytes.chunks(LINK_CAPACITY) {
            let link = cursor.insert(Box::new(Link::new(chunk)));
            cursor = &mut link.next;
        }
    }

    /// Copies `out.len()` bytes starting at `start`; None if the chain is too short.
    pub(crate) fn read(&self, start: usize, out: &mut [u8]) -> Option<()> {
        if start.checked_add(out.len())? > self.len {
            return None;
        }
        let bytes = self
            .links()
            .flat_map(|link| link.bytes[..link.len].iter().copied())
            .skip(start);
        for (target, byte) in out.iter_mut().zip(bytes) {
            *target = byte;
        }
        Some(())
    }

    /// The first `N` bytes, if they all live in the head link.
    fn head_array<const N: usize>(&self) -> Option<&[u8; N]> {
        let head = self.head.as_deref()?;
        head.bytes.get(..N)?.try_into().ok()
    }
}

impl Drop for ChainedBuffer {
    fn drop(&mut self) {
        // iterative, so that long chains cannot overflow the stack
        let mut next = self.head.take();
        while let Some(mut link) = next {
            link.bytes.zeroize();
            link.len = 0;
            next = link.next.take();
        }
        self.len = 0;
    }
}

struct PendingChain {
    curve: Curve,
    /// Certificate, followed by the public key once it arrived
    chain: ChainedBuffer,
}

impl PendingChain {
    fn has_public_key(&self) -> bool {
        self.chain.len() > self.curve.certificate_len()
    }
}

/// Partner store that allocates its slots on demand and releases them as soon as the
/// material has been consumed.
#[derive(Default)]
pub struct ChainedStore {
    partner: Option<PendingChain>,
    smac: Option<ChainedBuffer>,
}

impl ChainedStore {
    pub const fn new() -> Self {
        ChainedStore {
            partner: None,
            smac: None,
        }
    }
}

impl core::fmt::Debug for ChainedStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_struct("ChainedStore")
            .field("curve", &self.partner.as_ref().map(|pending| pending.curve))
            .field(
                "links",
                &self.partner.as_ref().map(|pending| pending.chain.link_count()),
            )
            .field("has_smac", &self.smac.is_some())
            .finish()
    }
}

impl PartnerStore for ChainedStore {
    fn store_partner_material(
        &mut self,
        curve: Curve,
        is_certificate: bool,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        trace!("Enter store_partner_material is_certificate={}", is_certificate);
        let pending = self
            .partner
            .as_ref()
            .map(|pending| (pending.curve, pending.has_public_key()));
        check_material(pending, curve, is_certificate, bytes)?;

        match &mut self.partner {
            Some(pending) => pending.chain.extend_from_slice(bytes),
            None => {
                self.partner = Some(PendingChain {
                    curve,
                    chain: ChainedBuffer::from_slice(bytes),
                })
            }
        }
        Ok(())
    }

    fn retrieve_and_clear_partner_material(
        &mut self,
    ) -> Result<(Certificate, PublicKey), StoreError> {
        trace!("Enter retrieve_and_clear_partner_material");
        let pending = match &self.partner {
            Some(pending) if pending.has_public_key() => pending,
            _ => return Err(StoreError::Incomplete),
        };
        let curve = pending.curve;
        let certificate_len = curve.certificate_len();

        let mut certificate = [0u8; MAX_CERTIFICATE_LEN];
        let mut public_key = [0u8; MAX_PUBLIC_KEY_LEN];
        let certificate_bytes = &mut certificate[..certificate_len];
        let public_key_bytes = &mut public_key[..curve.public_key_len()];
        pending
            .chain
            .read(0, certificate_bytes)
            .ok_or(StoreError::Incomplete)?;
        pending
            .chain
            .read(certificate_len, public_key_bytes)
            .ok_or(StoreError::Incomplete)?;

        let result = Certificate::from_slice(curve, certificate_bytes)
            .zip(PublicKey::from_slice(curve, public_key_bytes))
            .ok_or(StoreError::SizeMismatch);
        certificate.zeroize();
        public_key.zeroize();
        if result.is_ok() {
            // dropping the chain wipes it
            self.partner = None;
        }
        result
    }

    fn store_smac(&mut self, smac: &Smac) -> Result<(), StoreError> {
        // the previous chain is wiped when it is dropped here
        self.smac = Some(ChainedBuffer::from_slice(smac));
        Ok(())
    }

    fn smac(&self) -> Option<&Smac> {
        self.smac.as_ref()?.head_array()
    }

    fn clear_all(&mut self) {
        trace!("Enter clear_all");
        self.partner = None;
        self.smac = None;
    }

    fn has_pending_certificate(&self) -> bool {
        self.partner.is_some()
    }
}
