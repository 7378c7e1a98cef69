//! Handshake state machines.
//!
//! One [`Handshaker`] drives one handshake. The four roles share the
//! [`HandshakeContext`] holding message sequencing, reassembly, the transcript
//! and the flight being sent. Roles only decide what to do with a complete
//! message.

mod client;
mod context;
mod resuming_client;
mod resuming_server;
mod server;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::crypto::{finished_verify_data, CipherSuite, KeyBlock, RecordCipher};
use crate::message::{AlertDescription, Body, ClientHello, ConnectionId, Finished, Handshake};
use crate::message::Random;
use crate::rng::SeededRng;
use crate::session::{DtlsSession, SessionTicket};
use crate::types::ContentType;
use crate::util::ct_eq;
use crate::{Config, Error};

pub(crate) use context::{HandshakeContext, Outgoing};

use client::ClientHandshaker;
use resuming_client::ResumingClientHandshaker;
use resuming_server::ResumingServerHandshaker;
use server::ServerHandshaker;

enum Role {
    Client(ClientHandshaker),
    Server(ServerHandshaker),
    ResumingClient(ResumingClientHandshaker),
    ResumingServer(ResumingServerHandshaker),
}

pub(crate) struct Handshaker {
    ctx: HandshakeContext,
    role: Role,
}

impl Handshaker {
    /// Full handshake started by this side.
    pub(crate) fn client(
        config: Arc<Config>,
        peer: SocketAddr,
        own_cid: Option<ConnectionId>,
        server_name: Option<String>,
    ) -> Self {
        let ctx = HandshakeContext::new(config, peer, true, DtlsSession::new(0), own_cid);
        let role = Role::Client(ClientHandshaker::new(&ctx, server_name));
        Handshaker { ctx, role }
    }

    /// Abbreviated handshake started by this side.
    pub(crate) fn resuming_client(
        config: Arc<Config>,
        peer: SocketAddr,
        own_cid: Option<ConnectionId>,
        ticket: &SessionTicket,
    ) -> Self {
        let session = DtlsSession::resume(ticket, 0);
        let ctx = HandshakeContext::new(config, peer, true, session, own_cid);
        let role = Role::ResumingClient(ResumingClientHandshaker::new(&ctx, ticket));
        Handshaker { ctx, role }
    }

    /// Full handshake answering a verified CLIENT_HELLO.
    ///
    /// `record_seq` is the record sequence number the hello arrived with.
    pub(crate) fn server(
        config: Arc<Config>,
        peer: SocketAddr,
        own_cid: Option<ConnectionId>,
        hello: &ClientHello,
        message: &Handshake,
        record_seq: u64,
        rng: &SeededRng,
    ) -> Result<Self, Error> {
        let session = DtlsSession::new(record_seq);
        let mut ctx = HandshakeContext::new(config, peer, false, session, own_cid);
        let server = ServerHandshaker::start(&mut ctx, hello, message, rng)?;
        Ok(Handshaker {
            ctx,
            role: Role::Server(server),
        })
    }

    /// Abbreviated handshake answering a CLIENT_HELLO that resumes `ticket`.
    pub(crate) fn resuming_server(
        config: Arc<Config>,
        peer: SocketAddr,
        own_cid: Option<ConnectionId>,
        hello: &ClientHello,
        message: &Handshake,
        record_seq: u64,
        ticket: &SessionTicket,
    ) -> Result<Self, Error> {
        let session = DtlsSession::resume(ticket, record_seq);
        let mut ctx = HandshakeContext::new(config, peer, false, session, own_cid);
        let server = ResumingServerHandshaker::start(&mut ctx, hello, message)?;
        Ok(Handshaker {
            ctx,
            role: Role::ResumingServer(server),
        })
    }

    pub(crate) fn ctx(&self) -> &HandshakeContext {
        &self.ctx
    }

    pub(crate) fn ctx_mut(&mut self) -> &mut HandshakeContext {
        &mut self.ctx
    }

    /// Build the first flight. Only clients start handshakes.
    pub(crate) fn start(&mut self) -> Result<(), Error> {
        match &mut self.role {
            Role::Client(c) => c.start(&mut self.ctx),
            Role::ResumingClient(c) => c.start(&mut self.ctx),
            Role::Server(_) | Role::ResumingServer(_) => Err(Error::UnexpectedMessage(
                "Server handshakes are started by a CLIENT_HELLO".into(),
            )),
        }
    }

    /// Process the plaintext of one record addressed to this handshake.
    pub(crate) fn process(&mut self, content_type: ContentType, data: &[u8]) -> Result<(), Error> {
        match content_type {
            ContentType::Handshake => {
                let messages = self.ctx.receive_handshake(data)?;
                if self.ctx.take_duplicate() {
                    debug!("Peer repeated its flight, resending ours");
                    self.ctx.request_resend();
                }
                for message in messages {
                    trace!("Handshake message {:?} seq {}", message.msg_type, message.message_seq);
                    self.handle(message)?;
                }
                Ok(())
            }
            ContentType::ChangeCipherSpec => {
                context::check_change_cipher_spec(data)?;
                match &mut self.role {
                    Role::Client(c) => c.change_cipher_spec(&mut self.ctx),
                    Role::Server(s) => s.change_cipher_spec(&mut self.ctx),
                    Role::ResumingClient(c) => c.change_cipher_spec(&mut self.ctx),
                    Role::ResumingServer(s) => s.change_cipher_spec(&mut self.ctx),
                }
            }
            other => Err(Error::UnexpectedMessage(format!(
                "{:?} record in handshake",
                other
            ))),
        }
    }

    fn handle(&mut self, message: Handshake) -> Result<(), Error> {
        match &mut self.role {
            Role::Client(c) => c.handle(&mut self.ctx, message),
            Role::Server(s) => s.handle(&mut self.ctx, message),
            Role::ResumingServer(s) => s.handle(&mut self.ctx, message),
            Role::ResumingClient(c) => {
                let Some(mut fallback) = c.handle(&mut self.ctx, &message)? else {
                    return Ok(());
                };
                debug!("Server did not resume, continuing with a full handshake");
                fallback.handle(&mut self.ctx, message)?;
                self.role = Role::Client(fallback);
                Ok(())
            }
        }
    }

    /// Application data arrived in the new epoch, the peer has our last flight.
    pub(crate) fn on_application_data(&mut self) {
        if self.ctx.is_established() {
            self.ctx.complete();
        }
    }
}

impl fmt::Debug for Handshaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            Role::Client(_) => "client",
            Role::Server(_) => "server",
            Role::ResumingClient(_) => "resuming client",
            Role::ResumingServer(_) => "resuming server",
        };
        f.debug_struct("Handshaker")
            .field("role", &role)
            .field("ctx", &self.ctx)
            .finish()
    }
}

/// Record protection agreed by a handshake, not yet activated.
struct RecordKeys {
    read: Arc<dyn RecordCipher>,
    write: Arc<dyn RecordCipher>,
}

impl RecordKeys {
    fn derive(
        session: &DtlsSession,
        client_random: &Random,
        server_random: &Random,
        is_client: bool,
    ) -> Result<RecordKeys, Error> {
        let master = session
            .master_secret()
            .ok_or_else(|| Error::CryptoError("Master secret missing".into()))?;
        let (read, write) = KeyBlock::derive(master, client_random, server_random)?.ciphers(is_client)?;
        Ok(RecordKeys { read, write })
    }
}

/// First of our suites the peer offered.
fn negotiate_suite(ours: &[CipherSuite], offered: &[CipherSuite]) -> Option<CipherSuite> {
    ours.iter().copied().find(|s| offered.contains(s))
}

fn expect_body(message: &Handshake, body: Body) -> Result<Body, Error> {
    if body.msg_type() != message.msg_type {
        return Err(Error::UnexpectedMessage(format!("{:?}", message.msg_type)));
    }
    Ok(body)
}

/// Check the peer's FINISHED against the transcript so far.
fn verify_finished(ctx: &HandshakeContext, message: &Handshake) -> Result<(), Error> {
    let Body::Finished(finished) = expect_body(message, message.parse_body(None)?)? else {
        return Err(Error::UnexpectedMessage("Expected FINISHED".into()));
    };
    let master = ctx
        .session()
        .and_then(|s| s.master_secret())
        .ok_or_else(|| Error::CryptoError("Master secret missing".into()))?;
    let expected = finished_verify_data(master, !ctx.is_client, ctx.transcript())?;
    if !ct_eq(&expected, &finished.verify_data) {
        return Err(Error::handshake(
            AlertDescription::DecryptError,
            "FINISHED verification failed",
        ));
    }
    Ok(())
}

/// Append CHANGE_CIPHER_SPEC and our FINISHED to the current flight,
/// switching the write side to the new keys in between.
fn send_finished(ctx: &mut HandshakeContext, write: Arc<dyn RecordCipher>) -> Result<(), Error> {
    let master = ctx
        .session()
        .and_then(|s| s.master_secret())
        .ok_or_else(|| Error::CryptoError("Master secret missing".into()))?;
    let verify_data = finished_verify_data(master, ctx.is_client, ctx.transcript())?;

    ctx.add_change_cipher_spec()?;
    let session = ctx.session_mut()?;
    session.activate_write(write)?;
    let epoch = session.write_epoch();
    ctx.add_message(epoch, Body::Finished(Finished::new(verify_data)), None, true)?;
    Ok(())
}
