//! Hook for corrupting or delaying outgoing messages in interoperability tests
use crate::engine::KeyEstablishmentSession;
use crate::message::{BufferPayload, MessageType};
use defmt_or_log::debug;

/// Filter applied to every message the engine sends while a session is active.
///
/// The hook may rewrite `payload` in place; the returned value is a delay in milliseconds that
/// the transport should wait before sending.
pub trait FaultInjectionHook: core::fmt::Debug {
    fn filter(
        &mut self,
        session: &KeyEstablishmentSession,
        message_type: MessageType,
        payload: &mut BufferPayload,
    ) -> u32;
}

/// Sends every message unchanged and without delay.
#[derive(Debug, Default, Copy, Clone)]
pub struct PassThrough;

impl FaultInjectionHook for PassThrough {
    fn filter(
        &mut self,
        _session: &KeyEstablishmentSession,
        _message_type: MessageType,
        _payload: &mut BufferPayload,
    ) -> u32 {
        0
    }
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Fault {
    /// Drop this many trailing bytes
    Truncate(usize),
    /// Append this many zero bytes, as far as the buffer allows
    Extend(usize),
    FlipByte { index: usize, mask: u8 },
    /// Delay in milliseconds
    Delay(u32),
}

/// Applies one fault to every message of the target type.
#[derive(Debug, Copy, Clone)]
pub struct FaultInjector {
    target: MessageType,
    fault: Fault,
    injected: usize,
}

impl FaultInjector {
    pub const fn new(target: MessageType, fault: Fault) -> Self {
        FaultInjector {
            target,
            fault,
            injected: 0,
        }
    }

    /// Number of messages the fault was applied to.
    pub fn injected(&self) -> usize {
        self.injected
    }
}

impl FaultInjectionHook for FaultInjector {
    fn filter(
        &mut self,
        _session: &KeyEstablishmentSession,
        message_type: MessageType,
        payload: &mut BufferPayload,
    ) -> u32 {
        if message_type != self.target {
            return 0;
        }
        debug!("Injecting fault into command {}", message_type.command_id());
        self.injected += 1;
        match self.fault {
            Fault::Truncate(count) => {
                payload.truncate(payload.len().saturating_sub(count));
                0
            }
            Fault::Extend(count) => {
                for _ in 0..count {
                    if payload.push(0).is_err() {
                        break;
                    }
                }
                0
            }
            Fault::FlipByte { index, mask } => {
                if let Some(byte) = payload.as_mut_slice().get_mut(index) {
                    *byte ^= mask;
                }
                0
            }
            Fault::Delay(delay_ms) => delay_ms,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::Role;
    use cbke_shared::Curve;
    use hexlit::hex;

    fn session() -> KeyEstablishmentSession {
        KeyEstablishmentSession::new(Role::Initiator, Curve::Secp163k1, 0x4f2a)
    }

    fn payload() -> BufferPayload {
        BufferPayload::new_from_slice(&hex!("00112233445566778899aabbccddeeff")).unwrap()
    }

    #[test]
    fn test_pass_through() {
        let mut buffer = payload();
        assert_eq!(
            PassThrough.filter(&session(), MessageType::ConfirmKeyRequest, &mut buffer),
            0
        );
        assert_eq!(buffer, payload());
    }

    #[test]
    fn test_only_target_is_touched() {
        let mut injector =
            FaultInjector::new(MessageType::ConfirmKeyResponse, Fault::Truncate(1));
        let mut buffer = payload();
        injector.filter(&session(), MessageType::ConfirmKeyRequest, &mut buffer);
        assert_eq!(buffer, payload());
        assert_eq!(injector.injected(), 0);

        injector.filter(&session(), MessageType::ConfirmKeyResponse, &mut buffer);
        assert_eq!(buffer.len(), 15);
        assert_eq!(injector.injected(), 1);
    }

    #[test]
    fn test_faults() {
        let session = session();
        let message_type = MessageType::EphemeralDataRequest;

        let mut buffer = payload();
        FaultInjector::new(message_type, Fault::Extend(2)).filter(&session, message_type, &mut buffer);
        assert_eq!(buffer.len(), 18);
        assert_eq!(buffer.get_slice(15, 3), Some(&hex!("ff0000")[..]));

        let mut buffer = payload();
        FaultInjector::new(message_type, Fault::FlipByte { index: 1, mask: 0x80 })
            .filter(&session, message_type, &mut buffer);
        assert_eq!(buffer.get(1), Some(0x91));

        // out of range flips are ignored
        let mut buffer = payload();
        FaultInjector::new(message_type, Fault::FlipByte { index: 16, mask: 0xff })
            .filter(&session, message_type, &mut buffer);
        assert_eq!(buffer, payload());

        let mut buffer = payload();
        assert_eq!(
            FaultInjector::new(message_type, Fault::Delay(1500))
                .filter(&session, message_type, &mut buffer),
            1500
        );
        assert_eq!(buffer, payload());

        let mut buffer = payload();
        FaultInjector::new(message_type, Fault::Truncate(40)).filter(&session, message_type, &mut buffer);
        assert!(buffer.is_empty());
    }
}
