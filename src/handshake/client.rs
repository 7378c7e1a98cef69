use std::fmt;
use std::sync::Arc;

use super::{expect_body, send_finished, verify_finished};
use super::{HandshakeContext, RecordKeys};
use crate::crypto::{master_secret, premaster_secret, EphemeralKeyExchange, KeyExchangeAlgorithm};
use crate::message::{AlertDescription, Body, ClientHello, ClientKeyExchange, Extensions};
use crate::message::{Handshake, MessageType, Random, ServerHello, SessionId};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitServerHello,
    AwaitServerHelloDone,
    AwaitChangeCipherSpec,
    AwaitFinished,
    Done,
}

/// Client side of a full handshake.
pub(super) struct ClientHandshaker {
    state: State,
    hello: ClientHello,
    server_random: Random,
    server_public: Option<[u8; 32]>,
    keys: Option<RecordKeys>,
}

impl ClientHandshaker {
    pub(super) fn new(ctx: &HandshakeContext, server_name: Option<String>) -> Self {
        let hello = client_hello(ctx, SessionId::empty(), server_name);
        Self::with_hello(hello)
    }

    /// Continue a handshake whose CLIENT_HELLO was already sent, e.g. when
    /// the server declined to resume.
    pub(super) fn with_hello(hello: ClientHello) -> Self {
        ClientHandshaker {
            state: State::AwaitServerHello,
            hello,
            server_random: Random::default(),
            server_public: None,
            keys: None,
        }
    }

    pub(super) fn start(&mut self, ctx: &mut HandshakeContext) -> Result<(), Error> {
        send_client_hello(ctx, &self.hello, 1)
    }

    pub(super) fn handle(&mut self, ctx: &mut HandshakeContext, message: Handshake) -> Result<(), Error> {
        match (self.state, message.msg_type) {
            (State::AwaitServerHello, MessageType::HelloVerifyRequest) => {
                hello_verify_request(ctx, &mut self.hello, &message)
            }
            (State::AwaitServerHello, MessageType::ServerHello) => self.server_hello(ctx, message),
            (State::AwaitServerHelloDone, MessageType::ServerKeyExchange) => {
                self.server_key_exchange(ctx, message)
            }
            (State::AwaitServerHelloDone, MessageType::ServerHelloDone) => {
                self.server_hello_done(ctx, message)
            }
            (State::AwaitFinished, MessageType::Finished) => {
                verify_finished(ctx, &message)?;
                ctx.transcript_add(&message);
                let session_id = ctx.session_mut()?.session_id();
                self.state = State::Done;
                ctx.established(session_id, false);
                ctx.complete();
                Ok(())
            }
            // Renegotiation is not supported, the request is ignored.
            (_, MessageType::HelloRequest) => Ok(()),
            (state, msg_type) => Err(Error::UnexpectedMessage(format!(
                "{:?} while in {:?}",
                msg_type, state
            ))),
        }
    }

    fn server_hello(&mut self, ctx: &mut HandshakeContext, message: Handshake) -> Result<(), Error> {
        ctx.response_started();
        let Body::ServerHello(server_hello) = expect_body(&message, message.parse_body(None)?)? else {
            return Err(Error::UnexpectedMessage("Expected SERVER_HELLO".into()));
        };
        check_server_hello(&self.hello, &server_hello)?;
        ctx.transcript_add(&message);

        let session = ctx.session_mut()?;
        session.set_session_id(server_hello.session_id);
        session.set_cipher_suite(server_hello.cipher_suite);
        session.set_server_name(self.hello.extensions.server_name.clone());
        apply_connection_ids(session, &self.hello, &server_hello);

        self.server_random = server_hello.random;
        self.state = State::AwaitServerHelloDone;
        Ok(())
    }

    fn server_key_exchange(&mut self, ctx: &mut HandshakeContext, message: Handshake) -> Result<(), Error> {
        let kx = ctx.session_mut()?.cipher_suite().key_exchange();
        let Body::ServerKeyExchange(ske) = expect_body(&message, message.parse_body(kx)?)? else {
            return Err(Error::UnexpectedMessage("Expected SERVER_KEY_EXCHANGE".into()));
        };
        if !ske.identity_hint.is_empty() {
            trace!("PSK identity hint {}", String::from_utf8_lossy(&ske.identity_hint));
        }
        self.server_public = ske.ecdh_public;
        ctx.transcript_add(&message);
        Ok(())
    }

    fn server_hello_done(&mut self, ctx: &mut HandshakeContext, message: Handshake) -> Result<(), Error> {
        ctx.transcript_add(&message);

        let config = Arc::clone(&ctx.config);
        let peer = ctx.peer;
        let session = ctx.session_mut()?;

        let (identity, psk) = config
            .psk_store()
            .identity(peer, session.server_name())
            .ok_or_else(|| Error::handshake(AlertDescription::HandshakeFailure, "No PSK identity for peer"))?;

        let (other_secret, ecdh_public) = match session.cipher_suite().key_exchange() {
            Some(KeyExchangeAlgorithm::EcdhePsk) => {
                let server_public = self.server_public.ok_or_else(|| {
                    Error::handshake(
                        AlertDescription::UnexpectedMessage,
                        "SERVER_KEY_EXCHANGE missing",
                    )
                })?;
                let kx = EphemeralKeyExchange::new();
                let public = kx.public_key();
                (Some(kx.complete(&server_public)), Some(public))
            }
            _ => (None, None),
        };

        let premaster = premaster_secret(&psk, other_secret.as_ref().map(|s| s.as_slice()));
        let master = master_secret(&premaster, &self.hello.random, &self.server_random)?;
        session.set_master_secret(master);
        session.set_identity(identity.clone());
        let keys = RecordKeys::derive(session, &self.hello.random, &self.server_random, true)?;

        ctx.begin_flight(5);
        let cke = ClientKeyExchange {
            identity,
            ecdh_public,
        };
        ctx.add_message(0, Body::ClientKeyExchange(cke), None, true)?;
        send_finished(ctx, Arc::clone(&keys.write))?;

        self.keys = Some(keys);
        self.state = State::AwaitChangeCipherSpec;
        if ctx.take_pending_ccs() {
            self.change_cipher_spec(ctx)?;
        }
        Ok(())
    }

    pub(super) fn change_cipher_spec(&mut self, ctx: &mut HandshakeContext) -> Result<(), Error> {
        match self.state {
            State::AwaitServerHello | State::AwaitServerHelloDone => {
                ctx.set_pending_ccs();
                Ok(())
            }
            State::AwaitChangeCipherSpec => {
                let Some(keys) = &self.keys else {
                    return Err(Error::CryptoError("Keys missing".into()));
                };
                ctx.session_mut()?.activate_read(Arc::clone(&keys.read))?;
                ctx.response_started();
                self.state = State::AwaitFinished;
                Ok(())
            }
            State::AwaitFinished | State::Done => Ok(()),
        }
    }
}

impl fmt::Debug for ClientHandshaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandshaker")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// CLIENT_HELLO offering our suites, server name and connection id.
pub(super) fn client_hello(
    ctx: &HandshakeContext,
    session_id: SessionId,
    server_name: Option<String>,
) -> ClientHello {
    let extensions = Extensions {
        server_name,
        connection_id: ctx.own_cid,
    };
    ClientHello::new(Random::new(), session_id, ctx.config.cipher_suites(), extensions)
}

/// Send `hello` as a new flight. A hello resent with a cookie keeps
/// message_seq 0 and starts the transcript over.
pub(super) fn send_client_hello(
    ctx: &mut HandshakeContext,
    hello: &ClientHello,
    flight: u8,
) -> Result<(), Error> {
    ctx.transcript_reset();
    ctx.begin_flight(flight);
    ctx.add_message(0, Body::ClientHello(hello.clone()), Some(0), true)?;
    ctx.set_message_seqs(1, 0);
    Ok(())
}

/// Resend the CLIENT_HELLO with the server's cookie.
pub(super) fn hello_verify_request(
    ctx: &mut HandshakeContext,
    hello: &mut ClientHello,
    message: &Handshake,
) -> Result<(), Error> {
    let Body::HelloVerifyRequest(request) = expect_body(message, message.parse_body(None)?)? else {
        return Err(Error::UnexpectedMessage("Expected HELLO_VERIFY_REQUEST".into()));
    };
    if request.cookie.is_empty() {
        return Err(Error::handshake(
            AlertDescription::IllegalParameter,
            "Empty cookie",
        ));
    }
    debug!("Received cookie from {}", ctx.peer);
    hello.cookie = request.cookie;
    send_client_hello(ctx, hello, 3)
}

pub(super) fn check_server_hello(hello: &ClientHello, server_hello: &ServerHello) -> Result<(), Error> {
    let suite = server_hello.cipher_suite;
    if !suite.is_supported() || !hello.cipher_suites.contains(&suite) {
        return Err(Error::handshake(
            AlertDescription::IllegalParameter,
            format!("Server chose {:?}, which was not offered", suite),
        ));
    }
    Ok(())
}

/// Use connection ids if we offered one and the server sent its own.
pub(super) fn apply_connection_ids(
    session: &mut crate::session::DtlsSession,
    hello: &ClientHello,
    server_hello: &ServerHello,
) {
    match (hello.extensions.connection_id, server_hello.extensions.connection_id) {
        (Some(own), Some(peer)) => session.set_cids(Some(own), Some(peer)),
        _ => session.set_cids(None, None),
    }
}
