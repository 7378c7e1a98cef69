use std::fmt;
use std::sync::Arc;

use super::{expect_body, negotiate_suite, send_finished, verify_finished};
use super::{HandshakeContext, RecordKeys};
use crate::crypto::{master_secret, premaster_secret, EphemeralKeyExchange, KeyExchangeAlgorithm};
use crate::message::{AlertDescription, Body, ClientHello, Extensions, Handshake, MessageType};
use crate::message::{Random, ServerHello, ServerKeyExchange, SessionId};
use crate::rng::SeededRng;
use crate::Error;

const SESSION_ID_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitClientKeyExchange,
    AwaitChangeCipherSpec,
    AwaitFinished,
    Established,
}

/// Server side of a full PSK or ECDHE_PSK handshake.
pub(super) struct ServerHandshaker {
    state: State,
    client_random: Random,
    server_random: Random,
    kx: Option<EphemeralKeyExchange>,
    keys: Option<RecordKeys>,
}

impl ServerHandshaker {
    /// Answer a verified CLIENT_HELLO with SERVER_HELLO, optionally
    /// SERVER_KEY_EXCHANGE, and SERVER_HELLO_DONE.
    pub(super) fn start(
        ctx: &mut HandshakeContext,
        hello: &ClientHello,
        message: &Handshake,
        rng: &SeededRng,
    ) -> Result<Self, Error> {
        let suite = negotiate_suite(ctx.config.cipher_suites(), &hello.cipher_suites)
            .ok_or_else(|| Error::handshake(AlertDescription::HandshakeFailure, "No common cipher suite"))?;

        ctx.set_message_seqs(message.message_seq, message.message_seq.wrapping_add(1));
        ctx.transcript_add(message);

        let session_id = if ctx.config.use_server_session_id() {
            SessionId::random(SESSION_ID_LEN, rng)
        } else {
            SessionId::empty()
        };
        let server_random = Random::new();

        // Connection ids are only used if both sides support them.
        let peer_cid = hello.extensions.connection_id;
        let own_cid = peer_cid.and(ctx.own_cid);

        let session = ctx.session_mut()?;
        session.set_session_id(session_id);
        session.set_cipher_suite(suite);
        session.set_server_name(hello.extensions.server_name.clone());
        session.set_cids(own_cid, peer_cid.filter(|_| own_cid.is_some()));

        let extensions = Extensions {
            server_name: None,
            connection_id: own_cid,
        };

        ctx.begin_flight(4);
        let server_hello = ServerHello::new(server_random, session_id, suite, extensions);
        ctx.add_message(0, Body::ServerHello(server_hello), None, true)?;

        let kx = match suite.key_exchange() {
            Some(KeyExchangeAlgorithm::EcdhePsk) => {
                let kx = EphemeralKeyExchange::new();
                let ske = ServerKeyExchange {
                    identity_hint: Vec::new(),
                    ecdh_public: Some(kx.public_key()),
                };
                ctx.add_message(0, Body::ServerKeyExchange(ske), None, true)?;
                Some(kx)
            }
            _ => None,
        };

        ctx.add_message(0, Body::ServerHelloDone, None, true)?;

        debug!(
            "Full handshake with {} using {:?}, session {}",
            ctx.peer, suite, session_id
        );

        Ok(ServerHandshaker {
            state: State::AwaitClientKeyExchange,
            client_random: hello.random,
            server_random,
            kx,
            keys: None,
        })
    }

    pub(super) fn handle(&mut self, ctx: &mut HandshakeContext, message: Handshake) -> Result<(), Error> {
        match (self.state, message.msg_type) {
            (State::AwaitClientKeyExchange, MessageType::ClientKeyExchange) => {
                self.client_key_exchange(ctx, message)
            }
            (State::AwaitFinished, MessageType::Finished) => self.finished(ctx, message),
            (state, msg_type) => Err(Error::UnexpectedMessage(format!(
                "{:?} while in {:?}",
                msg_type, state
            ))),
        }
    }

    fn client_key_exchange(&mut self, ctx: &mut HandshakeContext, message: Handshake) -> Result<(), Error> {
        ctx.response_started();

        let config = Arc::clone(&ctx.config);
        let session = ctx.session_mut()?;
        let kx_algorithm = session.cipher_suite().key_exchange();
        let Body::ClientKeyExchange(cke) = expect_body(&message, message.parse_body(kx_algorithm)?)? else {
            return Err(Error::UnexpectedMessage("Expected CLIENT_KEY_EXCHANGE".into()));
        };

        let psk = config
            .psk_store()
            .key(&cke.identity, session.server_name())
            .ok_or_else(|| {
                Error::handshake(
                    AlertDescription::UnknownPskIdentity,
                    format!("Unknown PSK identity {}", String::from_utf8_lossy(&cke.identity)),
                )
            })?;

        let other_secret = match (self.kx.take(), cke.ecdh_public) {
            (Some(kx), Some(public)) => Some(kx.complete(&public)),
            (None, None) => None,
            _ => {
                return Err(Error::handshake(
                    AlertDescription::IllegalParameter,
                    "Key exchange does not match cipher suite",
                ))
            }
        };
        let premaster = premaster_secret(&psk, other_secret.as_ref().map(|s| s.as_slice()));
        let master = master_secret(&premaster, &self.client_random, &self.server_random)?;

        session.set_master_secret(master);
        session.set_identity(cke.identity);
        self.keys = Some(RecordKeys::derive(
            session,
            &self.client_random,
            &self.server_random,
            false,
        )?);
        ctx.transcript_add(&message);

        self.state = State::AwaitChangeCipherSpec;
        if ctx.take_pending_ccs() {
            self.change_cipher_spec(ctx)?;
        }
        Ok(())
    }

    pub(super) fn change_cipher_spec(&mut self, ctx: &mut HandshakeContext) -> Result<(), Error> {
        match self.state {
            State::AwaitClientKeyExchange => {
                // Overtook the CLIENT_KEY_EXCHANGE.
                ctx.set_pending_ccs();
                Ok(())
            }
            State::AwaitChangeCipherSpec => {
                let Some(keys) = &self.keys else {
                    return Err(Error::CryptoError("Keys missing".into()));
                };
                ctx.session_mut()?.activate_read(keys.read.clone())?;
                self.state = State::AwaitFinished;
                Ok(())
            }
            // Part of a resent flight.
            State::AwaitFinished | State::Established => Ok(()),
        }
    }

    fn finished(&mut self, ctx: &mut HandshakeContext, message: Handshake) -> Result<(), Error> {
        verify_finished(ctx, &message)?;
        ctx.transcript_add(&message);

        let Some(keys) = self.keys.take() else {
            return Err(Error::CryptoError("Keys missing".into()));
        };

        ctx.begin_flight(6);
        send_finished(ctx, keys.write)?;
        ctx.final_flight();

        let session_id = ctx.session_mut()?.session_id();
        self.state = State::Established;
        ctx.established(session_id, false);
        Ok(())
    }
}

impl fmt::Debug for ServerHandshaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandshaker")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
