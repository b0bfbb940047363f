//! Implementation of [Zigbee Smart Energy Certificate-Based Key Establishment (CBKE)]
//!
//! CBKE lets two devices that share a certificate authority derive a link key from their
//! implicit certificates and fresh ephemeral keys (ECMQV), and confirm it to each other with
//! SMACs. This crate holds the protocol side: curve selection, the exchange state machine,
//! the partner data kept during an exchange and the command payloads. The elliptic curve
//! work is delegated to an implementation of [`CryptoEngine`], see the `cbke-crypto` crate.
//!
//! Both sides are driven by [`CbkeEngine`]: the application calls [`CbkeEngine::initiate`] on
//! the initiator, hands every received key establishment command to
//! [`CbkeEngine::on_message`], and sends out whatever message each [`Step`] carries. Long
//! running crypto operations complete through [`CbkeEngine::on_crypto_complete`] (or
//! [`CbkeEngine::poll_crypto`]).
//!
//! [Zigbee Smart Energy Certificate-Based Key Establishment (CBKE)]: https://zigbeealliance.org/solution/smart-energy/
#![cfg_attr(not(test), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub use cbke_shared::*;

mod dispatch;
mod engine;
pub mod fault;
pub mod message;
pub mod store;

pub use dispatch::CurveDispatcher;
pub use engine::*;
pub use fault::{FaultInjectionHook, PassThrough};
pub use message::{KeMessage, MessageType};
pub use store::{FixedStore, PartnerStore};

#[cfg(feature = "alloc")]
pub use store::ChainedStore;

#[cfg(test)]
mod test {
    use super::*;
    use cbke_crypto::default_crypto;
    use hexlit::hex;

    const ADDRESS_I: ShortAddress = 0x0000;
    const ADDRESS_R: ShortAddress = 0x1f3e;
    const EUI64_I: Eui64 = hex!("000d6f000097a2b0");
    const EUI64_R: Eui64 = hex!("000d6f0000c4e1f2");
    const CA_ISSUER: Eui64 = hex!("5445535453454341");

    #[test]
    fn test_new_engines() {
        let initiator = CbkeEngine::new(
            default_crypto(EUI64_I, CA_ISSUER),
            FixedStore::new(),
            CbkeConfig::default(),
        );
        assert!(!initiator.is_busy());
        assert_eq!(initiator.config().terminate_wait_time, 10);
    }

    #[test]
    fn test_handshake() {
        let mut initiator = CbkeEngine::new(
            default_crypto(EUI64_I, CA_ISSUER),
            FixedStore::new(),
            CbkeConfig::default(),
        );
        let mut responder = CbkeEngine::new(
            default_crypto(EUI64_R, CA_ISSUER),
            FixedStore::new(),
            CbkeConfig::default(),
        );

        let step = initiator.initiate(ADDRESS_R, SuiteSet::ALL).unwrap();
        let initiate_request = step.message.unwrap();
        assert_eq!(initiate_request.partner, ADDRESS_R);

        let step = responder.on_message(
            ADDRESS_I,
            initiate_request.message_type,
            initiate_request.payload.as_slice(),
        );
        assert_eq!(step.status, StepStatus::InProgress);
        let initiate_response = step.message.unwrap();

        let step = initiator.on_message(
            ADDRESS_R,
            initiate_response.message_type,
            initiate_response.payload.as_slice(),
        );
        assert_eq!(step.status, StepStatus::AwaitingCrypto);
        let step = initiator.poll_crypto();
        let ephemeral_data_request = step.message.unwrap();

        let step = responder.on_message(
            ADDRESS_I,
            ephemeral_data_request.message_type,
            ephemeral_data_request.payload.as_slice(),
        );
        assert_eq!(step.status, StepStatus::AwaitingCrypto);
        // key generation, then the SMAC calculation
        assert_eq!(responder.poll_crypto().status, StepStatus::AwaitingCrypto);
        let ephemeral_data_response = responder.poll_crypto().message.unwrap();

        let step = initiator.on_message(
            ADDRESS_R,
            ephemeral_data_response.message_type,
            ephemeral_data_response.payload.as_slice(),
        );
        assert_eq!(step.status, StepStatus::AwaitingCrypto);
        let confirm_key_request = initiator.poll_crypto().message.unwrap();

        let step = responder.on_message(
            ADDRESS_I,
            confirm_key_request.message_type,
            confirm_key_request.payload.as_slice(),
        );
        assert_eq!(
            step.status,
            StepStatus::Finished(Outcome::Success { partner: ADDRESS_I })
        );
        let confirm_key_response = step.message.unwrap();

        let step = initiator.on_message(
            ADDRESS_R,
            confirm_key_response.message_type,
            confirm_key_response.payload.as_slice(),
        );
        assert_eq!(
            step.status,
            StepStatus::Finished(Outcome::Success { partner: ADDRESS_R })
        );

        // check that the link key is equal at initiator and responder side
        assert!(initiator.crypto().committed_link_key().is_some());
        assert_eq!(
            initiator.crypto().committed_link_key(),
            responder.crypto().committed_link_key()
        );
    }
}
