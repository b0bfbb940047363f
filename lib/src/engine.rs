use crate::dispatch::CurveDispatcher;
use crate::fault::{FaultInjectionHook, PassThrough};
use crate::message::{BufferPayload, Direction, KeMessage, MessageType};
use crate::store::PartnerStore;
use cbke_shared::*;
use defmt_or_log::{debug, info, trace, warn};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Network address of the partner device
pub type ShortAddress = u16;

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Direction of the messages this role sends.
    pub const fn direction(self) -> Direction {
        match self {
            Role::Initiator => Direction::ClientToServer,
            Role::Responder => Direction::ServerToClient,
        }
    }

    /// Direction of the messages this role receives.
    pub const fn partner_direction(self) -> Direction {
        match self {
            Role::Initiator => Direction::ServerToClient,
            Role::Responder => Direction::ClientToServer,
        }
    }
}

/// Progress of a key establishment exchange.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub enum KeyEstablishEvent {
    #[default]
    Idle,
    CheckSupportedCurves,
    BeginKeyEstablishment,
    GenerateKeys,
    SendEphemeralDataMessage,
    GenerateSharedSecret,
    SendConfirmKeyMessage,
    ReceivedConfirmKey,
}

/// State of the exchange with one partner; it exists from the accepted initiation until the
/// exchange ends either way.
pub struct KeyEstablishmentSession {
    pub role: Role,
    pub event: KeyEstablishEvent,
    pub curve: Curve,
    pub partner: ShortAddress,
    /// As announced by the partner, in seconds
    pub partner_ephemeral_data_generate_time: u8,
    /// As announced by the partner, in seconds
    pub partner_confirm_key_generate_time: u8,
    local_issuer: Eui64,
    own_public_key: Option<PublicKey>,
    /// SMAC the responder sends in its confirm key response
    own_smac: Option<Smac>,
}

impl KeyEstablishmentSession {
    pub fn new(role: Role, curve: Curve, partner: ShortAddress) -> Self {
        KeyEstablishmentSession {
            role,
            event: KeyEstablishEvent::Idle,
            curve,
            partner,
            partner_ephemeral_data_generate_time: 0,
            partner_confirm_key_generate_time: 0,
            local_issuer: Eui64::default(),
            own_public_key: None,
            own_smac: None,
        }
    }

    /// The message type the partner has to send next, if any.
    fn expected_message(&self) -> Option<MessageType> {
        use KeyEstablishEvent::*;
        match (self.role, self.event) {
            (Role::Initiator, BeginKeyEstablishment) => Some(MessageType::InitiateResponse),
            (Role::Initiator, SendEphemeralDataMessage) => Some(MessageType::EphemeralDataResponse),
            (Role::Initiator, SendConfirmKeyMessage) => Some(MessageType::ConfirmKeyResponse),
            (Role::Responder, BeginKeyEstablishment) => Some(MessageType::EphemeralDataRequest),
            (Role::Responder, SendEphemeralDataMessage) => Some(MessageType::ConfirmKeyRequest),
            _ => None,
        }
    }
}

impl core::fmt::Debug for KeyEstablishmentSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_struct("KeyEstablishmentSession")
            .field("role", &self.role)
            .field("event", &self.event)
            .field("curve", &self.curve)
            .field("partner", &self.partner)
            .finish()
    }
}

impl Drop for KeyEstablishmentSession {
    fn drop(&mut self) {
        self.own_smac.zeroize();
    }
}

/// Run-time settings of the engine.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct CbkeConfig {
    /// KE suites the device is willing to use
    pub suites: SuiteSet,
    /// Announced to the partner, in seconds
    pub ephemeral_data_generate_time: u8,
    /// Announced to the partner, in seconds
    pub confirm_key_generate_time: u8,
    /// Sent in terminate messages, in seconds
    pub terminate_wait_time: u8,
}

impl Default for CbkeConfig {
    fn default() -> Self {
        CbkeConfig {
            suites: SuiteSet::ALL,
            ephemeral_data_generate_time: 16,
            confirm_key_generate_time: 16,
            terminate_wait_time: 10,
        }
    }
}

/// A message for the transport to send.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct OutgoingMessage {
    /// Destination
    pub partner: ShortAddress,
    pub message_type: MessageType,
    pub payload: BufferPayload,
    /// Requested by the fault injection hook
    pub delay_ms: u32,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum FailureReason {
    Local(CbkeError),
    /// The partner sent a terminate message; unknown status codes are `None`.
    PartnerTerminated(Option<TerminateStatus>),
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Outcome {
    Success {
        partner: ShortAddress,
    },
    Failed {
        partner: ShortAddress,
        reason: FailureReason,
    },
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum StepStatus {
    /// Waiting for the partner's next message
    InProgress,
    /// A crypto operation is running; its completion drives the next step
    AwaitingCrypto,
    /// The input did not belong to the session (stray, stale or from an unknown partner)
    Ignored,
    /// An initiation was refused without disturbing the current state
    Rejected(CbkeError),
    Finished(Outcome),
}

/// What an entry point of the engine produced.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Step {
    pub message: Option<OutgoingMessage>,
    pub status: StepStatus,
}

impl Step {
    fn in_progress(message: OutgoingMessage) -> Self {
        Step {
            message: Some(message),
            status: StepStatus::InProgress,
        }
    }

    fn awaiting_crypto() -> Self {
        Step {
            message: None,
            status: StepStatus::AwaitingCrypto,
        }
    }

    fn ignored() -> Self {
        Step {
            message: None,
            status: StepStatus::Ignored,
        }
    }
}

/// The key establishment state machine of one device.
///
/// The engine is driven by the transport ([`CbkeEngine::on_message`], [`CbkeEngine::on_timeout`])
/// and by the crypto engine ([`CbkeEngine::on_crypto_complete`], or [`CbkeEngine::poll_crypto`]
/// for engines that are polled). Each call returns at most one message to send. Only one
/// exchange runs at a time; when it ends, all partner material and temporary key material is
/// wiped before the outcome is reported.
#[derive(Debug)]
pub struct CbkeEngine<Crypto: CryptoEngine, Store: PartnerStore, Hook: FaultInjectionHook = PassThrough>
{
    dispatcher: CurveDispatcher<Crypto>,
    store: Store,
    hook: Hook,
    config: CbkeConfig,
    session: Option<KeyEstablishmentSession>,
}

impl<Crypto: CryptoEngine, Store: PartnerStore> CbkeEngine<Crypto, Store, PassThrough> {
    pub fn new(crypto: Crypto, store: Store, config: CbkeConfig) -> Self {
        Self::with_hook(crypto, store, config, PassThrough)
    }
}

impl<Crypto: CryptoEngine, Store: PartnerStore, Hook: FaultInjectionHook>
    CbkeEngine<Crypto, Store, Hook>
{
    pub fn with_hook(crypto: Crypto, store: Store, config: CbkeConfig, hook: Hook) -> Self {
        trace!("Initializing CbkeEngine");
        CbkeEngine {
            dispatcher: CurveDispatcher::new(crypto, config.suites),
            store,
            hook,
            config,
            session: None,
        }
    }

    pub fn session(&self) -> Option<&KeyEstablishmentSession> {
        self.session.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.session.is_some()
    }

    pub fn config(&self) -> &CbkeConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn crypto(&self) -> &Crypto {
        self.dispatcher.crypto()
    }

    pub fn crypto_mut(&mut self) -> &mut Crypto {
        self.dispatcher.crypto_mut()
    }

    pub fn hook(&self) -> &Hook {
        &self.hook
    }

    /// Starts an exchange as initiator with `partner`, which advertised `partner_suites`.
    ///
    /// Fails without contacting the partner if another exchange is running (`Busy`), if no
    /// curve is shared (`UnsupportedSuite`, or `NoValidSuite` when no curve is available at
    /// all) or if the local certificate cannot be read (`NoLocalResources`).
    pub fn initiate(
        &mut self,
        partner: ShortAddress,
        partner_suites: SuiteSet,
    ) -> Result<Step, CbkeError> {
        trace!("Enter initiate");
        if self.session.is_some() {
            return Err(CbkeError::Busy);
        }

        let curve = self.dispatcher.negotiate(partner_suites)?;
        let mut session = KeyEstablishmentSession::new(Role::Initiator, curve, partner);
        session.event = KeyEstablishEvent::BeginKeyEstablishment;
        self.store.clear_all();
        let certificate = match self.dispatcher.local_certificate(curve) {
            Ok(certificate) => certificate,
            Err(error) => {
                self.dispatcher.deselect();
                return Err(error.into());
            }
        };
        session.local_issuer = self.dispatcher.issuer(&certificate);

        let message = self.initiate_message(curve, certificate);
        let message = self.emit(&session, MessageType::InitiateRequest, &message);
        self.session = Some(session);
        Ok(Step::in_progress(message))
    }

    /// Handles a message received from `partner`.
    pub fn on_message(
        &mut self,
        partner: ShortAddress,
        message_type: MessageType,
        payload: &[u8],
    ) -> Step {
        trace!("Enter on_message");
        let Some(session) = &self.session else {
            if message_type == MessageType::InitiateRequest {
                return self.accept_initiate(partner, payload);
            }
            debug!("Ignoring command {} without a session", message_type.command_id());
            return Step::ignored();
        };

        if session.partner != partner {
            if message_type == MessageType::InitiateRequest {
                return self.reject(partner, CbkeError::Busy);
            }
            debug!("Ignoring command from {}", partner);
            return Step::ignored();
        }

        // a terminate in our own direction is unexpected and falls through to BadMessage
        if message_type.is_terminate()
            && message_type.direction() == session.role.partner_direction()
        {
            let status = match KeMessage::decode(message_type, Some(session.curve), payload) {
                Ok(KeMessage::Terminate { status, .. }) => TerminateStatus::from_u8(status),
                _ => None,
            };
            return self.fail(FailureReason::PartnerTerminated(status));
        }

        match self.handle_message(message_type, payload) {
            Ok(step) => step,
            Err(error) => self.fail(FailureReason::Local(error)),
        }
    }

    /// Delivers the result of a key generation or SMAC calculation.
    pub fn on_crypto_complete(&mut self, completion: Completion) -> Step {
        trace!("Enter on_crypto_complete");
        if self.session.is_none() {
            return Step::ignored();
        }
        let completion = match self.dispatcher.complete(completion) {
            Ok(completion) => completion,
            Err(_) => {
                debug!("Ignoring stale crypto completion");
                return Step::ignored();
            }
        };
        match self.handle_completion(completion) {
            Ok(step) => step,
            Err(error) => self.fail(FailureReason::Local(error)),
        }
    }

    /// Asks the crypto engine for a completion and handles it if there is one.
    pub fn poll_crypto(&mut self) -> Step {
        match self.dispatcher.poll() {
            Some(completion) => self.on_crypto_complete(completion),
            None if self.dispatcher.is_busy() => Step::awaiting_crypto(),
            None => Step::ignored(),
        }
    }

    /// The partner did not answer in time. The exchange is abandoned without notifying it.
    pub fn on_timeout(&mut self) -> Step {
        trace!("Enter on_timeout");
        self.fail(FailureReason::Local(CbkeError::Timeout))
    }

    fn initiate_message(&self, curve: Curve, certificate: Certificate) -> KeMessage {
        KeMessage::Initiate {
            suite: curve.suite(),
            ephemeral_data_generate_time: self.config.ephemeral_data_generate_time,
            confirm_key_generate_time: self.config.confirm_key_generate_time,
            certificate,
        }
    }

    fn emit(
        &mut self,
        session: &KeyEstablishmentSession,
        message_type: MessageType,
        message: &KeMessage,
    ) -> OutgoingMessage {
        let mut payload = message.encode();
        let delay_ms = self.hook.filter(session, message_type, &mut payload);
        OutgoingMessage {
            partner: session.partner,
            message_type,
            payload,
            delay_ms,
        }
    }

    /// Responder side of an initiate request while idle.
    fn accept_initiate(&mut self, partner: ShortAddress, payload: &[u8]) -> Step {
        trace!("Enter accept_initiate");
        let (curve, ephemeral_data_generate_time, confirm_key_generate_time, certificate) =
            match KeMessage::decode(MessageType::InitiateRequest, None, payload) {
                Ok(KeMessage::Initiate {
                    suite,
                    ephemeral_data_generate_time,
                    confirm_key_generate_time,
                    certificate,
                }) => match Curve::from_suite(suite) {
                    Some(curve) => (
                        curve,
                        ephemeral_data_generate_time,
                        confirm_key_generate_time,
                        certificate,
                    ),
                    None => return self.reject(partner, CbkeError::UnsupportedSuite),
                },
                Ok(_) => return self.reject(partner, CbkeError::BadMessage),
                Err(error) => return self.reject(partner, error),
            };

        if let Err(error) = self.dispatcher.select(curve) {
            return self.reject(partner, error);
        }
        let mut session = KeyEstablishmentSession::new(Role::Responder, curve, partner);
        session.partner_ephemeral_data_generate_time = ephemeral_data_generate_time;
        session.partner_confirm_key_generate_time = confirm_key_generate_time;
        session.event = KeyEstablishEvent::BeginKeyEstablishment;
        self.session = Some(session);

        match self.begin_as_responder(curve, certificate) {
            Ok(step) => step,
            Err(error) => self.fail(FailureReason::Local(error)),
        }
    }

    fn begin_as_responder(
        &mut self,
        curve: Curve,
        partner_certificate: Certificate,
    ) -> Result<Step, CbkeError> {
        self.store.clear_all();
        let certificate = self.dispatcher.local_certificate(curve)?;
        let local_issuer = self.dispatcher.issuer(&certificate);
        if self.dispatcher.issuer(&partner_certificate) != local_issuer {
            return Err(CbkeError::InvalidCertificateIssuer);
        }
        self.store
            .store_partner_material(curve, true, partner_certificate.as_slice())?;

        let message = self.initiate_message(curve, certificate);
        let mut session = self.session.take().ok_or(CbkeError::NoSession)?;
        session.local_issuer = local_issuer;
        let message = self.emit(&session, MessageType::InitiateResponse, &message);
        self.session = Some(session);
        Ok(Step::in_progress(message))
    }

    fn handle_message(
        &mut self,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<Step, CbkeError> {
        use KeyEstablishEvent::*;
        let session = self.session.as_mut().ok_or(CbkeError::NoSession)?;
        if session.expected_message() != Some(message_type) {
            warn!("Unexpected command {}", message_type.command_id());
            return Err(CbkeError::BadMessage);
        }
        let curve = session.curve;

        match KeMessage::decode(message_type, Some(curve), payload)? {
            KeMessage::Initiate {
                ephemeral_data_generate_time,
                confirm_key_generate_time,
                certificate,
                ..
            } => {
                if self.dispatcher.issuer(&certificate) != session.local_issuer {
                    return Err(CbkeError::InvalidCertificateIssuer);
                }
                session.partner_ephemeral_data_generate_time = ephemeral_data_generate_time;
                session.partner_confirm_key_generate_time = confirm_key_generate_time;
                self.store
                    .store_partner_material(curve, true, certificate.as_slice())?;
                session.event = GenerateKeys;
                self.dispatcher.generate_ephemeral_keys(curve)?;
                Ok(Step::awaiting_crypto())
            }
            KeMessage::EphemeralData(public_key) => {
                self.store
                    .store_partner_material(curve, false, public_key.as_slice())?;
                match session.role {
                    Role::Responder => {
                        session.event = GenerateKeys;
                        self.dispatcher.generate_ephemeral_keys(curve)?;
                    }
                    Role::Initiator => {
                        session.event = GenerateSharedSecret;
                        let (certificate, public_key) =
                            self.store.retrieve_and_clear_partner_material()?;
                        self.dispatcher
                            .calculate_shared_secret(curve, true, &certificate, &public_key)?;
                    }
                }
                Ok(Step::awaiting_crypto())
            }
            KeMessage::ConfirmKey(smac) => {
                session.event = ReceivedConfirmKey;
                let expected = self.store.smac().ok_or(CbkeError::Incomplete)?;
                if !bool::from(expected[..].ct_eq(&smac[..])) {
                    return Err(CbkeError::BadKeyConfirm);
                }
                self.succeed()
            }
            KeMessage::Terminate { .. } => Err(CbkeError::BadMessage),
        }
    }

    fn handle_completion(&mut self, completion: Completion) -> Result<Step, CbkeError> {
        use KeyEstablishEvent::*;
        let mut session = self.session.take().ok_or(CbkeError::NoSession)?;
        let curve = session.curve;

        let result = match (session.role, session.event, completion) {
            (Role::Initiator, GenerateKeys, Completion::KeysGenerated { result, .. }) => {
                result.map_err(CbkeError::from).map(|public_key| {
                    session.event = SendEphemeralDataMessage;
                    let message = self.emit(
                        &session,
                        MessageType::EphemeralDataRequest,
                        &KeMessage::EphemeralData(public_key),
                    );
                    Step::in_progress(message)
                })
            }
            (Role::Responder, GenerateKeys, Completion::KeysGenerated { result, .. }) => result
                .map_err(CbkeError::from)
                .and_then(|public_key| {
                    session.own_public_key = Some(public_key);
                    session.event = GenerateSharedSecret;
                    let (certificate, public_key) =
                        self.store.retrieve_and_clear_partner_material()?;
                    self.dispatcher
                        .calculate_shared_secret(curve, false, &certificate, &public_key)?;
                    Ok(Step::awaiting_crypto())
                }),
            (Role::Initiator, GenerateSharedSecret, Completion::SmacsCalculated { result, .. }) => {
                result.map_err(CbkeError::from).and_then(|mut smacs| {
                    let stored = self.store.store_smac(&smacs.responder);
                    let own_smac = smacs.initiator;
                    smacs.zeroize();
                    stored?;
                    session.event = SendConfirmKeyMessage;
                    let message = self.emit(
                        &session,
                        MessageType::ConfirmKeyRequest,
                        &KeMessage::ConfirmKey(own_smac),
                    );
                    Ok(Step::in_progress(message))
                })
            }
            (Role::Responder, GenerateSharedSecret, Completion::SmacsCalculated { result, .. }) => {
                result.map_err(CbkeError::from).and_then(|mut smacs| {
                    let stored = self.store.store_smac(&smacs.initiator);
                    session.own_smac = Some(smacs.responder);
                    smacs.zeroize();
                    stored?;
                    let public_key = session.own_public_key.take().ok_or(CbkeError::Incomplete)?;
                    session.event = SendEphemeralDataMessage;
                    let message = self.emit(
                        &session,
                        MessageType::EphemeralDataResponse,
                        &KeMessage::EphemeralData(public_key),
                    );
                    Ok(Step::in_progress(message))
                })
            }
            _ => Err(CbkeError::BadMessage),
        };

        self.session = Some(session);
        result
    }

    /// The partner proved knowledge of the link key: keep it and end the session.
    fn succeed(&mut self) -> Result<Step, CbkeError> {
        let mut session = self.session.take().ok_or(CbkeError::NoSession)?;
        let own_smac = session.own_smac;
        let message = match session.role {
            Role::Responder => match own_smac {
                Some(smac) => {
                    session.event = KeyEstablishEvent::SendConfirmKeyMessage;
                    Some(self.emit(
                        &session,
                        MessageType::ConfirmKeyResponse,
                        &KeMessage::ConfirmKey(smac),
                    ))
                }
                None => {
                    self.session = Some(session);
                    return Err(CbkeError::Incomplete);
                }
            },
            Role::Initiator => None,
        };

        if let Err(error) = self.dispatcher.clear_temporary_crypto_state(session.curve, true) {
            self.session = Some(session);
            return Err(error.into());
        }
        self.store.clear_all();
        self.dispatcher.deselect();
        info!("Key establishment with {} succeeded", session.partner);

        Ok(Step {
            message,
            status: StepStatus::Finished(Outcome::Success {
                partner: session.partner,
            }),
        })
    }

    /// Ends the session after a failure. Everything is wiped before the partner is told.
    fn fail(&mut self, reason: FailureReason) -> Step {
        let Some(session) = self.session.take() else {
            return Step::ignored();
        };
        if let FailureReason::Local(error) = reason {
            warn!(
                "Key establishment with {} failed, status {}",
                session.partner,
                u8::from(error.terminate_status())
            );
        } else {
            warn!("Key establishment terminated by {}", session.partner);
        }

        self.store.clear_all();
        if self
            .dispatcher
            .clear_temporary_crypto_state(session.curve, false)
            .is_err()
        {
            warn!("Could not clear temporary crypto state");
        }
        self.dispatcher.deselect();

        let message = match reason {
            FailureReason::Local(error) if error != CbkeError::Timeout => {
                let terminate = KeMessage::Terminate {
                    status: error.terminate_status().into(),
                    wait_time: self.config.terminate_wait_time,
                    suite: session.curve.suite(),
                };
                Some(self.emit(
                    &session,
                    MessageType::terminate(session.role.direction()),
                    &terminate,
                ))
            }
            _ => None,
        };

        Step {
            message,
            status: StepStatus::Finished(Outcome::Failed {
                partner: session.partner,
                reason,
            }),
        }
    }

    /// Refuses an initiation from `partner` without touching any running session.
    fn reject(&mut self, partner: ShortAddress, error: CbkeError) -> Step {
        warn!(
            "Rejecting key establishment from {}, status {}",
            partner,
            u8::from(error.terminate_status())
        );
        let terminate = KeMessage::Terminate {
            status: error.terminate_status().into(),
            wait_time: self.config.terminate_wait_time,
            suite: self.dispatcher.available_suites().bits(),
        };
        Step {
            message: Some(OutgoingMessage {
                partner,
                message_type: MessageType::ServerTerminate,
                payload: terminate.encode(),
                delay_ms: 0,
            }),
            status: StepStatus::Rejected(error),
        }
    }
}
