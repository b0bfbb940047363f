//! Payloads of the key establishment cluster commands
//!
//! Only the command payloads are handled here; the ZCL header carrying the command id and
//! direction is added and removed by the transport.
use cbke_shared::*;
use defmt_or_log::trace;

/// Suite (2 bytes, little endian), ephemeral data generate time, confirm key generate time
pub const INITIATE_HEADER_LEN: usize = 4;
/// Status, wait time, suite (2 bytes, little endian)
pub const TERMINATE_PAYLOAD_LEN: usize = 4;
pub const MAX_PAYLOAD_LEN: usize = INITIATE_HEADER_LEN + MAX_CERTIFICATE_LEN;

pub type BufferPayload = CbkeBuffer<MAX_PAYLOAD_LEN>;

/// Direction of a cluster command; the initiator is the client of the cluster.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum MessageType {
    InitiateRequest,
    InitiateResponse,
    EphemeralDataRequest,
    EphemeralDataResponse,
    ConfirmKeyRequest,
    ConfirmKeyResponse,
    /// Terminate sent by the initiator
    ClientTerminate,
    /// Terminate sent by the responder
    ServerTerminate,
}

impl MessageType {
    pub const fn command_id(self) -> u8 {
        use MessageType::*;
        match self {
            InitiateRequest | InitiateResponse => 0x00,
            EphemeralDataRequest | EphemeralDataResponse => 0x01,
            ConfirmKeyRequest | ConfirmKeyResponse => 0x02,
            ClientTerminate | ServerTerminate => 0x03,
        }
    }

    pub const fn direction(self) -> Direction {
        use MessageType::*;
        match self {
            InitiateRequest | EphemeralDataRequest | ConfirmKeyRequest | ClientTerminate => {
                Direction::ClientToServer
            }
            _ => Direction::ServerToClient,
        }
    }

    pub fn from_command(direction: Direction, command_id: u8) -> Option<Self> {
        use MessageType::*;
        match (direction, command_id) {
            (Direction::ClientToServer, 0x00) => Some(InitiateRequest),
            (Direction::ClientToServer, 0x01) => Some(EphemeralDataRequest),
            (Direction::ClientToServer, 0x02) => Some(ConfirmKeyRequest),
            (Direction::ClientToServer, 0x03) => Some(ClientTerminate),
            (Direction::ServerToClient, 0x00) => Some(InitiateResponse),
            (Direction::ServerToClient, 0x01) => Some(EphemeralDataResponse),
            (Direction::ServerToClient, 0x02) => Some(ConfirmKeyResponse),
            (Direction::ServerToClient, 0x03) => Some(ServerTerminate),
            _ => None,
        }
    }

    /// The terminate command sent in `direction`.
    pub const fn terminate(direction: Direction) -> Self {
        match direction {
            Direction::ClientToServer => MessageType::ClientTerminate,
            Direction::ServerToClient => MessageType::ServerTerminate,
        }
    }

    pub const fn is_terminate(self) -> bool {
        matches!(self, MessageType::ClientTerminate | MessageType::ServerTerminate)
    }
}

/// A decoded key establishment payload.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum KeMessage {
    Initiate {
        suite: u16,
        /// Seconds the sender needs to produce its ephemeral data
        ephemeral_data_generate_time: u8,
        /// Seconds the sender needs to produce its confirm key message
        confirm_key_generate_time: u8,
        certificate: Certificate,
    },
    EphemeralData(PublicKey),
    ConfirmKey(Smac),
    Terminate {
        /// Raw status; unknown codes are kept as received
        status: u8,
        /// Seconds the receiver should wait before initiating again
        wait_time: u8,
        suite: u16,
    },
}

impl KeMessage {
    /// Parses the payload of a message of type `message_type`.
    ///
    /// Ephemeral data and confirm key payloads can only be sized with the curve of a running
    /// session (`session_curve`); initiate payloads carry their own suite, which must match the
    /// session's if there is one.
    pub fn decode(
        message_type: MessageType,
        session_curve: Option<Curve>,
        payload: &[u8],
    ) -> Result<Self, CbkeError> {
        trace!("Enter decode");
        use MessageType::*;
        match message_type {
            InitiateRequest | InitiateResponse => {
                if payload.len() < INITIATE_HEADER_LEN {
                    return Err(CbkeError::BadMessage);
                }
                let suite = u16::from_le_bytes([payload[0], payload[1]]);
                let curve = Curve::from_suite(suite).ok_or(CbkeError::UnsupportedSuite)?;
                if session_curve.is_some_and(|session_curve| session_curve != curve) {
                    return Err(CbkeError::BadMessage);
                }
                let certificate =
                    Certificate::from_slice(curve, &payload[INITIATE_HEADER_LEN..])
                        .ok_or(CbkeError::BadMessage)?;
                Ok(KeMessage::Initiate {
                    suite,
                    ephemeral_data_generate_time: payload[2],
                    confirm_key_generate_time: payload[3],
                    certificate,
                })
            }
            EphemeralDataRequest | EphemeralDataResponse => {
                let curve = session_curve.ok_or(CbkeError::BadMessage)?;
                PublicKey::from_slice(curve, payload)
                    .map(KeMessage::EphemeralData)
                    .ok_or(CbkeError::BadMessage)
            }
            ConfirmKeyRequest | ConfirmKeyResponse => payload
                .try_into()
                .map(KeMessage::ConfirmKey)
                .map_err(|_| CbkeError::BadMessage),
            ClientTerminate | ServerTerminate => match payload {
                [status, wait_time, suite_lo, suite_hi] => Ok(KeMessage::Terminate {
                    status: *status,
                    wait_time: *wait_time,
                    suite: u16::from_le_bytes([*suite_lo, *suite_hi]),
                }),
                _ => Err(CbkeError::BadMessage),
            },
        }
    }

    pub fn encode(&self) -> BufferPayload {
        let mut payload = BufferPayload::new();
        match self {
            KeMessage::Initiate {
                suite,
                ephemeral_data_generate_time,
                confirm_key_generate_time,
                certificate,
            } => {
                let certificate = certificate.as_slice();
                payload.content[..2].copy_from_slice(&suite.to_le_bytes());
                payload.content[2] = *ephemeral_data_generate_time;
                payload.content[3] = *confirm_key_generate_time;
                payload.content[INITIATE_HEADER_LEN..INITIATE_HEADER_LEN + certificate.len()]
                    .copy_from_slice(certificate);
                payload.len = INITIATE_HEADER_LEN + certificate.len();
            }
            KeMessage::EphemeralData(public_key) => {
                let public_key = public_key.as_slice();
                payload.content[..public_key.len()].copy_from_slice(public_key);
                payload.len = public_key.len();
            }
            KeMessage::ConfirmKey(smac) => {
                payload.content[..SMAC_LEN].copy_from_slice(smac);
                payload.len = SMAC_LEN;
            }
            KeMessage::Terminate {
                status,
                wait_time,
                suite,
            } => {
                payload.content[0] = *status;
                payload.content[1] = *wait_time;
                payload.content[2..4].copy_from_slice(&suite.to_le_bytes());
                payload.len = TERMINATE_PAYLOAD_LEN;
            }
        }
        payload
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hexlit::hex;

    const TERMINATE_NO_RESOURCES: &[u8] = &hex!("040a0100");

    #[test]
    fn test_command_ids() {
        for message_type in [
            MessageType::InitiateRequest,
            MessageType::InitiateResponse,
            MessageType::EphemeralDataRequest,
            MessageType::EphemeralDataResponse,
            MessageType::ConfirmKeyRequest,
            MessageType::ConfirmKeyResponse,
            MessageType::ClientTerminate,
            MessageType::ServerTerminate,
        ] {
            assert_eq!(
                MessageType::from_command(message_type.direction(), message_type.command_id()),
                Some(message_type)
            );
        }
        assert_eq!(MessageType::from_command(Direction::ClientToServer, 0x04), None);
        assert_eq!(
            MessageType::terminate(Direction::ServerToClient),
            MessageType::ServerTerminate
        );
        assert!(MessageType::terminate(Direction::ClientToServer).is_terminate());
        assert!(!MessageType::ConfirmKeyResponse.is_terminate());
    }

    #[test]
    fn test_decode_terminate() {
        assert_eq!(
            KeMessage::decode(MessageType::ServerTerminate, None, TERMINATE_NO_RESOURCES),
            Ok(KeMessage::Terminate {
                status: TerminateStatus::NoResources.into(),
                wait_time: 10,
                suite: KE_SUITE_163K1,
            })
        );
        assert_eq!(
            KeMessage::decode(MessageType::ClientTerminate, None, &TERMINATE_NO_RESOURCES[..3]),
            Err(CbkeError::BadMessage)
        );
    }

    #[test]
    fn test_encode_terminate() {
        let message = KeMessage::Terminate {
            status: TerminateStatus::NoResources.into(),
            wait_time: 10,
            suite: KE_SUITE_163K1,
        };
        assert_eq!(message.encode().as_slice(), TERMINATE_NO_RESOURCES);
    }

    #[test]
    fn test_initiate_layout() {
        let certificate_bytes = [0xc3u8; CERTIFICATE_LEN_283K1];
        let certificate = Certificate::from_slice(Curve::Secp283k1, &certificate_bytes).unwrap();
        let message = KeMessage::Initiate {
            suite: KE_SUITE_283K1,
            ephemeral_data_generate_time: 16,
            confirm_key_generate_time: 20,
            certificate,
        };
        let payload = message.encode();
        assert_eq!(payload.len(), MAX_PAYLOAD_LEN);
        assert_eq!(payload.get_slice(0, 4), Some(&hex!("02001014")[..]));
        assert_eq!(
            KeMessage::decode(MessageType::InitiateRequest, None, payload.as_slice()),
            Ok(message)
        );
    }

    #[test]
    fn test_decode_initiate_errors() {
        let mut payload = [0u8; INITIATE_HEADER_LEN + CERTIFICATE_LEN_163K1];
        payload[..4].copy_from_slice(&hex!("01001010"));

        // the suite announces 163k1, the session runs 283k1
        assert_eq!(
            KeMessage::decode(
                MessageType::InitiateResponse,
                Some(Curve::Secp283k1),
                &payload
            ),
            Err(CbkeError::BadMessage)
        );
        // certificate one byte short
        assert_eq!(
            KeMessage::decode(MessageType::InitiateRequest, None, &payload[..51]),
            Err(CbkeError::BadMessage)
        );
        payload[..2].copy_from_slice(&hex!("0400"));
        assert_eq!(
            KeMessage::decode(MessageType::InitiateRequest, None, &payload),
            Err(CbkeError::UnsupportedSuite)
        );
        assert_eq!(
            KeMessage::decode(MessageType::InitiateRequest, None, &payload[..3]),
            Err(CbkeError::BadMessage)
        );
    }

    #[test]
    fn test_decode_sized_by_session_curve() {
        let key = [0x02u8; PUBLIC_KEY_LEN_163K1];
        assert_eq!(
            KeMessage::decode(MessageType::EphemeralDataRequest, None, &key),
            Err(CbkeError::BadMessage)
        );
        assert_eq!(
            KeMessage::decode(
                MessageType::EphemeralDataRequest,
                Some(Curve::Secp283k1),
                &key
            ),
            Err(CbkeError::BadMessage)
        );
        assert!(KeMessage::decode(
            MessageType::EphemeralDataResponse,
            Some(Curve::Secp163k1),
            &key
        )
        .is_ok());

        let smac = hex!("00112233445566778899aabbccddeeff");
        assert_eq!(
            KeMessage::decode(MessageType::ConfirmKeyResponse, None, &smac),
            Ok(KeMessage::ConfirmKey(smac))
        );
        assert_eq!(
            KeMessage::decode(MessageType::ConfirmKeyRequest, None, &smac[1..]),
            Err(CbkeError::BadMessage)
        );
    }
}
