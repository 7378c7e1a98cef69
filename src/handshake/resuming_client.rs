use std::fmt;

use super::client::{apply_connection_ids, check_server_hello, client_hello};
use super::client::{hello_verify_request, send_client_hello, ClientHandshaker};
use super::{expect_body, send_finished, verify_finished, HandshakeContext, RecordKeys};
use crate::message::{AlertDescription, Body, ClientHello, Handshake, MessageType};
use crate::session::SessionTicket;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitServerHello,
    AwaitChangeCipherSpec,
    AwaitFinished,
    /// Our FINISHED is sent. Waiting for proof the server got it.
    Established,
}

/// Client side of an abbreviated handshake.
///
/// If the server answers with another session id, the handshake continues
/// as a full one.
pub(super) struct ResumingClientHandshaker {
    state: State,
    hello: ClientHello,
    keys: Option<RecordKeys>,
}

impl ResumingClientHandshaker {
    pub(super) fn new(ctx: &HandshakeContext, ticket: &SessionTicket) -> Self {
        let hello = client_hello(ctx, ticket.session_id, ticket.server_name.clone());
        ResumingClientHandshaker {
            state: State::AwaitServerHello,
            hello,
            keys: None,
        }
    }

    pub(super) fn start(&mut self, ctx: &mut HandshakeContext) -> Result<(), Error> {
        debug!("Resuming session {} with {}", self.hello.session_id, ctx.peer);
        send_client_hello(ctx, &self.hello, 1)
    }

    /// Returns a full handshaker to hand `message` to when the server
    /// declined the resumption.
    pub(super) fn handle(
        &mut self,
        ctx: &mut HandshakeContext,
        message: &Handshake,
    ) -> Result<Option<ClientHandshaker>, Error> {
        match (self.state, message.msg_type) {
            (State::AwaitServerHello, MessageType::HelloVerifyRequest) => {
                hello_verify_request(ctx, &mut self.hello, message)?;
            }
            (State::AwaitServerHello, MessageType::ServerHello) => {
                let Body::ServerHello(server_hello) =
                    expect_body(message, message.parse_body(None)?)?
                else {
                    return Err(Error::UnexpectedMessage("Expected SERVER_HELLO".into()));
                };
                if server_hello.session_id != self.hello.session_id {
                    return Ok(Some(ClientHandshaker::with_hello(self.hello.clone())));
                }

                ctx.response_started();
                check_server_hello(&self.hello, &server_hello)?;
                let session = ctx.session_mut()?;
                if server_hello.cipher_suite != session.cipher_suite() {
                    return Err(Error::handshake(
                        AlertDescription::IllegalParameter,
                        "Resumed session with another cipher suite",
                    ));
                }
                apply_connection_ids(session, &self.hello, &server_hello);
                self.keys = Some(RecordKeys::derive(
                    session,
                    &self.hello.random,
                    &server_hello.random,
                    true,
                )?);
                ctx.transcript_add(message);

                self.state = State::AwaitChangeCipherSpec;
                if ctx.take_pending_ccs() {
                    self.change_cipher_spec(ctx)?;
                }
            }
            (State::AwaitFinished, MessageType::Finished) => {
                verify_finished(ctx, message)?;
                ctx.transcript_add(message);

                let Some(keys) = self.keys.take() else {
                    return Err(Error::CryptoError("Keys missing".into()));
                };
                ctx.begin_flight(5);
                send_finished(ctx, keys.write)?;
                ctx.final_flight();

                let session_id = ctx.session_mut()?.session_id();
                self.state = State::Established;
                ctx.established(session_id, true);
            }
            (_, MessageType::HelloRequest) => {}
            (state, msg_type) => {
                return Err(Error::UnexpectedMessage(format!(
                    "{:?} while in {:?}",
                    msg_type, state
                )))
            }
        }
        Ok(None)
    }

    pub(super) fn change_cipher_spec(&mut self, ctx: &mut HandshakeContext) -> Result<(), Error> {
        match self.state {
            State::AwaitServerHello => {
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
            State::AwaitFinished | State::Established => Ok(()),
        }
    }
}

impl fmt::Debug for ResumingClientHandshaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumingClientHandshaker")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
