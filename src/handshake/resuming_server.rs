use std::fmt;

use super::{send_finished, verify_finished, HandshakeContext, RecordKeys};
use crate::message::{Body, ClientHello, Extensions, Handshake, MessageType, Random, ServerHello};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitChangeCipherSpec,
    AwaitFinished,
    Done,
}

/// Server side of an abbreviated handshake.
///
/// The session was found by the CLIENT_HELLO's session id. The server
/// sends its FINISHED first, so its flight is retransmitted until the
/// client's FINISHED arrives.
pub(super) struct ResumingServerHandshaker {
    state: State,
    keys: RecordKeys,
}

impl ResumingServerHandshaker {
    pub(super) fn start(
        ctx: &mut HandshakeContext,
        hello: &ClientHello,
        message: &Handshake,
    ) -> Result<Self, Error> {
        ctx.set_message_seqs(message.message_seq, message.message_seq.wrapping_add(1));
        ctx.transcript_add(message);

        let server_random = Random::new();
        let peer_cid = hello.extensions.connection_id;
        let own_cid = peer_cid.and(ctx.own_cid);

        let session = ctx.session_mut()?;
        session.set_cids(own_cid, peer_cid.filter(|_| own_cid.is_some()));
        let session_id = session.session_id();
        let suite = session.cipher_suite();
        let keys = RecordKeys::derive(session, &hello.random, &server_random, false)?;

        debug!("Resuming session {} with {}", session_id, ctx.peer);

        ctx.begin_flight(4);
        let extensions = Extensions {
            server_name: None,
            connection_id: own_cid,
        };
        let server_hello = ServerHello::new(server_random, session_id, suite, extensions);
        ctx.add_message(0, Body::ServerHello(server_hello), None, true)?;
        send_finished(ctx, keys.write.clone())?;

        Ok(ResumingServerHandshaker {
            state: State::AwaitChangeCipherSpec,
            keys,
        })
    }

    pub(super) fn handle(&mut self, ctx: &mut HandshakeContext, message: Handshake) -> Result<(), Error> {
        match (self.state, message.msg_type) {
            (State::AwaitFinished, MessageType::Finished) => {
                verify_finished(ctx, &message)?;
                ctx.transcript_add(&message);
                let session_id = ctx.session_mut()?.session_id();
                self.state = State::Done;
                ctx.established(session_id, true);
                ctx.complete();
                Ok(())
            }
            (state, msg_type) => Err(Error::UnexpectedMessage(format!(
                "{:?} while in {:?}",
                msg_type, state
            ))),
        }
    }

    pub(super) fn change_cipher_spec(&mut self, ctx: &mut HandshakeContext) -> Result<(), Error> {
        if self.state != State::AwaitChangeCipherSpec {
            return Ok(());
        }
        ctx.session_mut()?.activate_read(self.keys.read.clone())?;
        ctx.response_started();
        self.state = State::AwaitFinished;
        Ok(())
    }
}

impl fmt::Debug for ResumingServerHandshaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumingServerHandshaker")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
