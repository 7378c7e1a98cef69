//! Receiving: datagrams to records to connections.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use super::Inner;
use crate::api::RawData;
use crate::buffer::Buf;
use crate::connection::{Connection, ConnectionState};
use crate::handshake::Handshaker;
use crate::message::{Alert, AlertDescription, AlertLevel, Body, ClientHello, Handshake};
use crate::message::{HandshakeFragment, HelloVerifyRequest, MessageType};
use crate::record::Record;
use crate::session::SessionTicket;
use crate::socket::{is_timeout, DatagramSocket};
use crate::types::{ContentType, Sequence};
use crate::Error;

/// Which session a record is decrypted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// The session the ongoing handshake negotiates.
    Pending,
    Established,
}

enum Decrypted {
    Plaintext {
        content_type: ContentType,
        data: Vec<u8>,
        route: Route,
    },
    /// Belongs to an epoch that is not active yet.
    Defer,
    Drop,
}

impl Inner {
    pub(super) fn receive_loop(self: Arc<Self>, socket: Arc<dyn DatagramSocket>) {
        let mut buf = vec![0u8; self.config.receive_buffer_size()];
        while self.is_running() {
            match socket.recv_from(&mut buf) {
                Ok((len, peer)) => self.receive_datagram(&buf[..len], peer),
                Err(e) if is_timeout(&e) => {}
                Err(e) => {
                    if self.is_running() {
                        warn!("Receive failed: {}", e);
                        std::thread::sleep(super::RECEIVE_TIMEOUT);
                    }
                }
            }
        }
        trace!("Receiver stopped");
    }

    pub(super) fn receive_datagram(self: &Arc<Self>, datagram: &[u8], peer: SocketAddr) {
        let cid_len = self.config.connection_id_length().filter(|l| *l > 0);
        let records = Record::parse_datagram(datagram, peer, cid_len, Instant::now());
        if records.is_empty() {
            trace!("Discarding datagram of {} bytes from {}", datagram.len(), peer);
        }
        for record in records {
            self.receive_record(record);
        }
    }

    fn receive_record(self: &Arc<Self>, record: Record) {
        if record.is_client_hello() {
            let connection = self.store.get(record.peer);
            // A repeated hello of a handshake in progress goes to that handshake.
            if let Some(connection) = connection {
                let random = record.client_hello_random();
                if random.is_some() && connection.started_by() == random {
                    self.execute_record(&connection, record);
                    return;
                }
            }
            let Some(runtime) = self.runtime() else {
                return;
            };
            let inner = Arc::clone(self);
            if let Err(e) = runtime
                .pool
                .execute(Box::new(move || inner.process_client_hello(record)))
            {
                debug!("CLIENT_HELLO dropped: {}", e);
            }
            return;
        }

        let connection = match &record.cid {
            Some(cid) => self.store.get_by_cid(cid),
            None => self.store.get(record.peer),
        };
        let Some(connection) = connection else {
            trace!(
                "Discarding {:?} record from {}, no connection",
                record.content_type,
                record.peer
            );
            return;
        };
        self.execute_record(&connection, record);
    }

    fn execute_record(self: &Arc<Self>, connection: &Arc<Connection>, record: Record) {
        let inner = Arc::clone(self);
        let target = Arc::clone(connection);
        let result = self.execute_on(&connection, Box::new(move || {
            if !inner.is_running() {
                return;
            }
            let mut state = target.lock();
            if state.closed {
                return;
            }
            inner.handle_record(&target, &mut state, record);
        }));
        if let Err(e) = result {
            trace!("Record from {} dropped: {}", connection.peer(), e);
        }
    }

    /// Answer a CLIENT_HELLO that starts a new handshake.
    ///
    /// No state is kept for the peer unless it returned a valid cookie or
    /// resumes a known session while few resumptions are unverified.
    fn process_client_hello(self: &Arc<Self>, record: Record) {
        if !self.is_running() {
            return;
        }
        let peer = record.peer;
        let Some((hello, message)) = parse_client_hello(&record) else {
            debug!("Discarding fragmented or invalid CLIENT_HELLO from {}", peer);
            return;
        };
        let record_seq = record.sequence.sequence_number;
        let cookie_valid = self.cookies.verify(peer, &hello);

        if hello.has_session_id() {
            match self.store.find_ticket(&hello.session_id) {
                Some(ticket) if is_resumable(&ticket, &hello) => {
                    if cookie_valid {
                        return self.accept(peer, hello, message, record_seq, Some(ticket), false);
                    }
                    if self.try_acquire_unverified() {
                        return self.accept(peer, hello, message, record_seq, Some(ticket), true);
                    }
                    debug!("Too many unverified resumptions, verifying {}", peer);
                }
                Some(_) => debug!(
                    "Session {} cannot be resumed by {}, full handshake",
                    hello.session_id, peer
                ),
                None => trace!("Unknown session {} from {}", hello.session_id, peer),
            }
        }

        if cookie_valid {
            self.accept(peer, hello, message, record_seq, None, false);
        } else {
            self.send_hello_verify_request(peer, &hello, &message, record_seq);
        }
    }

    fn send_hello_verify_request(
        &self,
        peer: SocketAddr,
        hello: &ClientHello,
        message: &Handshake,
        record_seq: u64,
    ) {
        let cookie = self.cookies.generate(peer, hello);
        let request = HelloVerifyRequest::new(cookie);
        let handshake = Body::HelloVerifyRequest(request).into_handshake(message.message_seq);

        let mut fragment = Buf::new();
        handshake.serialize(&mut fragment);
        let mut datagram = Buf::new();
        // Mirrors the hello's record sequence number, RFC 6347 4.2.1.
        let sequence = Sequence {
            epoch: 0,
            sequence_number: record_seq,
        };
        Record::encode(ContentType::Handshake, sequence, None, &fragment, &mut datagram);
        debug!("Sending HELLO_VERIFY_REQUEST to {}", peer);
        let _ = self.send_datagram(&datagram, peer);
    }

    /// Create the connection and handshaker for a verified hello.
    fn accept(
        self: &Arc<Self>,
        peer: SocketAddr,
        hello: ClientHello,
        message: Handshake,
        record_seq: u64,
        ticket: Option<SessionTicket>,
        unverified: bool,
    ) {
        let Some(runtime) = self.runtime() else {
            return;
        };
        let release = |inner: &Inner| {
            if unverified {
                inner.pending_unverified.fetch_sub(1, Ordering::AcqRel);
            }
        };

        let connection = Connection::new(peer, &runtime.pool);
        self.store.assign_cid(&connection);
        let own_cid = self.own_cid(&connection);
        let config = Arc::clone(&self.config);
        let handshaker = match &ticket {
            Some(ticket) => Handshaker::resuming_server(
                config, peer, own_cid, &hello, &message, record_seq, ticket,
            ),
            None => Handshaker::server(config, peer, own_cid, &hello, &message, record_seq, &self.rng),
        };
        let handshaker = match handshaker {
            Ok(h) => h,
            Err(e) => {
                debug!("Refusing handshake with {}: {}", peer, e);
                self.send_plain_alert(peer, &e, record_seq);
                release(self);
                return;
            }
        };

        let previous = self.store.get(peer);
        {
            // Not visible to any other thread yet.
            let mut state = connection.lock();
            state.handshaker = Some(handshaker);
            state.pending_unverified = unverified;
            state.replaces = previous;
        }
        connection.set_started_by(Some(hello.random));
        connection.set_handshaking(true);

        match self.store.put(&connection) {
            Ok(Some(evicted)) => self.discard(evicted, Error::Evicted),
            Ok(None) => {}
            Err(e) => {
                warn!("No room for a connection with {}: {}", peer, e);
                release(self);
                return;
            }
        }

        let inner = Arc::clone(self);
        let target = Arc::clone(&connection);
        let result = self.execute_on(&connection, Box::new(move || {
            let mut state = target.lock();
            inner.after_handshake_step(&target, &mut state);
        }));
        if let Err(e) = result {
            debug!("Handshake with {} not started: {}", peer, e);
        }
    }

    /// Fatal alert in reply to a hello that started nothing.
    fn send_plain_alert(&self, peer: SocketAddr, error: &Error, record_seq: u64) {
        let (level, description) = error.alert();
        let mut payload = Buf::new();
        Alert::new(level, description).serialize(&mut payload);
        let mut datagram = Buf::new();
        let sequence = Sequence {
            epoch: 0,
            sequence_number: record_seq,
        };
        Record::encode(ContentType::Alert, sequence, None, &payload, &mut datagram);
        let _ = self.send_datagram(&datagram, peer);
    }

    /// Process one record inside the connection's serial executor.
    pub(super) fn handle_record(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
        record: Record,
    ) {
        let (content_type, data, route) = match self.decrypt(state, &record) {
            Decrypted::Plaintext {
                content_type,
                data,
                route,
            } => (content_type, data, route),
            Decrypted::Defer => {
                let deferred = state
                    .handshaker
                    .as_mut()
                    .map(|h| h.ctx_mut().defer_record(record))
                    .unwrap_or(false);
                if !deferred {
                    trace!("Discarding record of a future epoch");
                }
                return;
            }
            Decrypted::Drop => return,
        };
        connection.touch();

        match content_type {
            ContentType::ApplicationData => {
                self.application_data(connection, state, &record, data)
            }
            ContentType::Alert => self.alert(connection, state, &data, route),
            ContentType::Handshake | ContentType::ChangeCipherSpec => {
                self.handshake_record(connection, state, &record, content_type, &data, route)
            }
            other => trace!("Discarding {:?} record", other),
        }
    }

    fn decrypt(&self, state: &mut ConnectionState, record: &Record) -> Decrypted {
        let epoch = record.sequence.epoch;
        let pending = state
            .handshaker
            .as_ref()
            .and_then(|h| h.ctx().session())
            .map(|s| s.read_epoch());
        let established = state.session.as_ref().map(|s| s.read_epoch());
        let next_pending = pending.and_then(|e| e.checked_add(1));

        let route = if epoch == 0 {
            match pending {
                Some(_) => Route::Pending,
                // Only a handshake in its final flight still reads plaintext,
                // to notice the peer repeating its last flight.
                None if state.handshaker.is_some()
                    && established.is_some()
                    && record.content_type == ContentType::Handshake =>
                {
                    Route::Established
                }
                None => {
                    trace!(
                        "Discarding plaintext {:?} record from {}",
                        record.content_type,
                        record.peer
                    );
                    return Decrypted::Drop;
                }
            }
        } else if pending == Some(epoch) {
            Route::Pending
        } else if established == Some(epoch) {
            Route::Established
        } else if next_pending == Some(epoch) {
            return Decrypted::Defer;
        } else {
            trace!("Discarding record of epoch {}", epoch);
            return Decrypted::Drop;
        };

        let filter = self.config.replay_filter();
        let session = match route {
            Route::Pending => state
                .handshaker
                .as_mut()
                .and_then(|h| h.ctx_mut().session_mut().ok()),
            Route::Established => state.session.as_mut(),
        };
        let Some(session) = session else {
            return Decrypted::Drop;
        };

        if !session.is_acceptable(record.sequence, filter) {
            trace!("Discarding duplicate record {:?}", record.sequence);
            return Decrypted::Drop;
        }

        match session.decrypt(record) {
            Ok((content_type, data)) => {
                // Data protected by a session that is not established yet
                // waits until it is, and stays unmarked until then.
                if route == Route::Pending && epoch > 0 && content_type == ContentType::ApplicationData {
                    return Decrypted::Defer;
                }
                session.mark_read(record.sequence);
                Decrypted::Plaintext {
                    content_type,
                    data,
                    route,
                }
            }
            Err(_) if route == Route::Established && next_pending == Some(epoch) => Decrypted::Defer,
            Err(e) => {
                trace!("Discarding record {:?}: {}", record.sequence, e);
                Decrypted::Drop
            }
        }
    }

    fn handshake_record(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
        record: &Record,
        content_type: ContentType,
        data: &[u8],
        route: Route,
    ) {
        if content_type == ContentType::Handshake {
            let first = data.first().map(|b| MessageType::from_u8(*b));
            // Hellos protected by an established session ask to renegotiate.
            let renegotiation = route == Route::Established
                && record.sequence.epoch > 0
                && matches!(first, Some(MessageType::ClientHello | MessageType::HelloRequest));
            let unexpected_request =
                first == Some(MessageType::HelloRequest) && state.handshaker.is_none();
            if renegotiation || unexpected_request {
                debug!("Refusing renegotiation with {}", connection.peer());
                let alert = Alert::new(AlertLevel::Warning, AlertDescription::NoRenegotiation);
                self.send_alert(connection, state, alert);
                return;
            }
        }

        let Some(handshaker) = state.handshaker.as_mut() else {
            trace!(
                "Discarding {:?} from {}, no handshake",
                content_type,
                connection.peer()
            );
            return;
        };
        match handshaker.process(content_type, data) {
            Ok(()) => self.after_handshake_step(connection, state),
            Err(e) => {
                debug!("Handshake with {} failed: {}", connection.peer(), e);
                self.handshake_failed(connection, state, e);
            }
        }
    }

    fn application_data(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
        record: &Record,
        data: Vec<u8>,
    ) {
        if record.sequence.epoch == 0 {
            trace!("Discarding plaintext application data from {}", record.peer);
            return;
        }

        self.acknowledge_final_flight(connection, state);
        if state.closed {
            return;
        }

        let newest = state
            .newest_read
            .map(|n| record.sequence > n)
            .unwrap_or(true);
        if newest {
            state.newest_read = Some(record.sequence);
            if record.cid.is_some() && record.peer != connection.peer() {
                self.store.update_address(connection, record.peer);
            }
        }

        let Some(context) = state.endpoint_context(connection.peer()) else {
            return;
        };
        let channel = self.channel.read().clone();
        match channel {
            Some(channel) => channel.receive_data(RawData {
                bytes: data,
                peer: connection.peer(),
                context,
                callback: None,
            }),
            None => trace!("No receiver for application data from {}", record.peer),
        }
    }

    fn alert(&self, connection: &Arc<Connection>, state: &mut ConnectionState, data: &[u8], route: Route) {
        let Ok((_, alert)) = Alert::parse(data) else {
            debug!("Discarding malformed alert from {}", connection.peer());
            return;
        };
        debug!("Received {:?} from {}", alert, connection.peer());

        let handler = self.alert_handler.read().clone();
        if let Some(handler) = handler {
            handler.on_alert(connection.peer(), alert);
        }

        // An alert outside the established session ends at most the handshake.
        if route == Route::Pending && state.session.is_some() {
            if alert.is_fatal() || alert.description == AlertDescription::CloseNotify {
                self.abort_handshake(connection, state, Error::AlertReceived(alert.description));
            }
            return;
        }

        if alert.description == AlertDescription::CloseNotify {
            self.send_alert(connection, state, Alert::close_notify());
            self.terminate(connection, state, Error::Closed);
        } else if alert.is_fatal() {
            let pending = state.handshaker.as_ref().and_then(|h| h.ctx().session());
            for session in pending.into_iter().chain(state.session.as_ref()) {
                self.store.remove_ticket(&session.session_id());
            }
            self.terminate(connection, state, Error::AlertReceived(alert.description));
        }
    }
}

/// The hello of a record, if it is complete in this one record.
fn parse_client_hello(record: &Record) -> Option<(ClientHello, Handshake)> {
    let mut fragments = HandshakeFragment::parse_all(&record.fragment).ok()?;
    if fragments.len() != 1 {
        return None;
    }
    let fragment = fragments.pop()?;
    if fragment.header.is_fragment() {
        return None;
    }
    let message = Handshake::new(
        fragment.header.msg_type,
        fragment.header.message_seq,
        fragment.data,
    );
    match message.parse_body(None) {
        Ok(Body::ClientHello(hello)) => Some((hello, message)),
        _ => None,
    }
}

/// Whether `hello` may resume the session of `ticket`.
fn is_resumable(ticket: &SessionTicket, hello: &ClientHello) -> bool {
    ticket.server_name == hello.extensions.server_name
        && hello.cipher_suites.contains(&ticket.cipher_suite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherSuite;
    use crate::message::{Extensions, Random, SessionId};

    fn hello(server_name: Option<&str>) -> ClientHello {
        ClientHello::new(
            Random::new(),
            SessionId::empty(),
            &[CipherSuite::PskAes128GcmSha256],
            Extensions {
                server_name: server_name.map(str::to_string),
                connection_id: None,
            },
        )
    }

    fn ticket(server_name: Option<&str>, suite: CipherSuite) -> SessionTicket {
        SessionTicket {
            session_id: SessionId::try_new(&[1; 32]).unwrap(),
            cipher_suite: suite,
            master_secret: crate::crypto::MasterSecret::new(vec![0; 48]),
            identity: b"client".to_vec(),
            server_name: server_name.map(str::to_string),
            created: Instant::now(),
        }
    }

    #[test]
    fn resumable_needs_same_server_name_and_offered_suite() {
        let suite = CipherSuite::PskAes128GcmSha256;
        assert!(is_resumable(&ticket(None, suite), &hello(None)));
        assert!(is_resumable(&ticket(Some("a"), suite), &hello(Some("a"))));
        assert!(!is_resumable(&ticket(Some("a"), suite), &hello(Some("b"))));
        assert!(!is_resumable(&ticket(None, suite), &hello(Some("b"))));
        assert!(!is_resumable(
            &ticket(None, CipherSuite::EcdhePskAes128GcmSha256),
            &hello(None)
        ));
    }

    fn record_of(message: &Handshake, max: usize) -> Vec<Record> {
        let peer: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let mut datagram = Buf::new();
        for (i, fragment) in message.fragments(max).into_iter().enumerate() {
            let sequence = Sequence {
                epoch: 0,
                sequence_number: i as u64,
            };
            Record::encode(ContentType::Handshake, sequence, None, &fragment, &mut datagram);
        }
        Record::parse_datagram(&datagram, peer, None, Instant::now())
    }

    #[test]
    fn client_hello_must_be_unfragmented() {
        let message = Body::ClientHello(hello(Some("coap.local"))).into_handshake(0);

        let whole = record_of(&message, 1000);
        assert_eq!(whole.len(), 1);
        let (parsed, _) = parse_client_hello(&whole[0]).unwrap();
        assert_eq!(parsed.extensions.server_name.as_deref(), Some("coap.local"));

        let split = record_of(&message, 40);
        assert!(split.len() > 1);
        assert!(parse_client_hello(&split[0]).is_none());
    }
}
