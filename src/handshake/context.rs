use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::api::RawData;
use crate::buffer::Buf;
use crate::event::HandshakeEvent;
use crate::flight::DtlsFlight;
use crate::message::{AlertDescription, Body, ConnectionId, Handshake, HandshakeFragment};
use crate::message::{MessageType, SessionId, CHANGE_CIPHER_SPEC};
use crate::record::Record;
use crate::session::DtlsSession;
use crate::timer::ExponentialBackoff;
use crate::types::ContentType;
use crate::{Config, Error};

/// Largest handshake message accepted for reassembly.
const MAX_MESSAGE_LEN: u32 = 32_768;

/// How far ahead of the expected message_seq fragments are buffered.
const MAX_FUTURE_MESSAGES: u16 = 16;

/// What the connector has to put on the wire after a handshaker ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outgoing {
    Nothing,
    /// A new flight was built.
    Flight,
    /// The current flight is to be resent as is.
    Resend,
}

struct Reassembly {
    msg_type: MessageType,
    length: u32,
    body: Vec<u8>,
    /// Sorted, non overlapping byte ranges received so far.
    ranges: Vec<(u32, u32)>,
}

impl Reassembly {
    fn new(msg_type: MessageType, length: u32) -> Self {
        Reassembly {
            msg_type,
            length,
            body: vec![0; length as usize],
            ranges: Vec::new(),
        }
    }

    fn insert(&mut self, fragment: &HandshakeFragment) -> Result<(), Error> {
        let h = &fragment.header;
        if h.msg_type != self.msg_type || h.length != self.length {
            return Err(Error::handshake(
                AlertDescription::DecodeError,
                "Fragments of one message disagree",
            ));
        }
        let start = h.fragment_offset;
        let end = start + h.fragment_length;
        self.body[start as usize..end as usize].copy_from_slice(&fragment.data);

        self.ranges.push((start, end));
        self.ranges.sort_unstable();
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.length == 0 || self.ranges.first() == Some(&(0, self.length))
    }
}

/// State shared by all handshaker roles.
pub(crate) struct HandshakeContext {
    pub(crate) config: Arc<Config>,
    pub(crate) peer: SocketAddr,
    pub(crate) is_client: bool,
    /// The session being negotiated. Moved out once it is established.
    session: Option<DtlsSession>,
    /// Connection id this side receives records with. Empty to signal
    /// support without wanting one.
    pub(crate) own_cid: Option<ConnectionId>,
    next_send_seq: u16,
    next_receive_seq: u16,
    inbound: BTreeMap<u16, Reassembly>,
    transcript: Buf,
    pending_ccs: bool,
    duplicate: bool,
    flight: Option<DtlsFlight>,
    outgoing: Outgoing,
    events: Vec<HandshakeEvent>,
    established: bool,
    completed: bool,
    /// Records of the next read epoch that arrived before it was activated.
    pub(crate) deferred_records: Vec<Record>,
    /// Application messages waiting for the session.
    pub(crate) deferred_messages: VecDeque<RawData>,
}

impl HandshakeContext {
    pub(crate) fn new(
        config: Arc<Config>,
        peer: SocketAddr,
        is_client: bool,
        session: DtlsSession,
        own_cid: Option<ConnectionId>,
    ) -> Self {
        HandshakeContext {
            config,
            peer,
            is_client,
            session: Some(session),
            own_cid,
            next_send_seq: 0,
            next_receive_seq: 0,
            inbound: BTreeMap::new(),
            transcript: Buf::new(),
            pending_ccs: false,
            duplicate: false,
            flight: None,
            outgoing: Outgoing::Nothing,
            events: Vec::new(),
            established: false,
            completed: false,
            deferred_records: Vec::new(),
            deferred_messages: VecDeque::new(),
        }
    }

    pub(crate) fn session(&self) -> Option<&DtlsSession> {
        self.session.as_ref()
    }

    pub(crate) fn session_mut(&mut self) -> Result<&mut DtlsSession, Error> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::UnexpectedMessage("Session already established".into()))
    }

    pub(crate) fn take_session(&mut self) -> Option<DtlsSession> {
        self.session.take()
    }

    /// Start sequencing at the message_seq of the peer's CLIENT_HELLO.
    pub(crate) fn set_message_seqs(&mut self, send: u16, receive: u16) {
        self.next_send_seq = send;
        self.next_receive_seq = receive;
        self.inbound.clear();
    }

    pub(crate) fn next_send_seq(&self) -> u16 {
        self.next_send_seq
    }

    /// Feed one handshake record. Returns the messages that became complete,
    /// in message_seq order.
    pub(crate) fn receive_handshake(&mut self, data: &[u8]) -> Result<Vec<Handshake>, Error> {
        for fragment in HandshakeFragment::parse_all(data)? {
            let seq = fragment.header.message_seq;

            if seq < self.next_receive_seq {
                // Only the last message of the peer's previous flight asks
                // for our reply again.
                if seq == self.next_receive_seq - 1 && fragment.header.fragment_offset == 0 {
                    self.duplicate = true;
                }
                trace!("Duplicate handshake message {}", seq);
                continue;
            }
            if seq - self.next_receive_seq > MAX_FUTURE_MESSAGES {
                debug!("Handshake message {} too far ahead, dropped", seq);
                continue;
            }
            if fragment.header.length > MAX_MESSAGE_LEN {
                return Err(Error::handshake(
                    AlertDescription::DecodeError,
                    "Handshake message too large",
                ));
            }

            let entry = self
                .inbound
                .entry(seq)
                .or_insert_with(|| Reassembly::new(fragment.header.msg_type, fragment.header.length));
            entry.insert(&fragment)?;
        }

        let mut complete = Vec::new();
        while let Some(entry) = self.inbound.get(&self.next_receive_seq) {
            if !entry.is_complete() {
                break;
            }
            let seq = self.next_receive_seq;
            if let Some(entry) = self.inbound.remove(&seq) {
                complete.push(Handshake::new(entry.msg_type, seq, entry.body));
            }
            self.next_receive_seq = self.next_receive_seq.wrapping_add(1);
        }
        Ok(complete)
    }

    /// Whether the last message of the peer's previous flight was repeated.
    pub(crate) fn take_duplicate(&mut self) -> bool {
        std::mem::take(&mut self.duplicate)
    }

    pub(crate) fn set_pending_ccs(&mut self) {
        self.pending_ccs = true;
    }

    pub(crate) fn take_pending_ccs(&mut self) -> bool {
        std::mem::take(&mut self.pending_ccs)
    }

    pub(crate) fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    pub(crate) fn transcript_add(&mut self, handshake: &Handshake) {
        handshake.serialize(&mut self.transcript);
    }

    pub(crate) fn transcript_reset(&mut self) {
        self.transcript.clear();
    }

    pub(crate) fn begin_flight(&mut self, number: u8) {
        let backoff = ExponentialBackoff::new(
            self.config.retransmission_timeout(),
            self.config.max_retransmission_timeout(),
            self.config.max_retransmissions(),
        );
        self.flight = Some(DtlsFlight::new(number, backoff));
        self.outgoing = Outgoing::Flight;
    }

    /// Append a handshake message to the flight being built.
    ///
    /// `message_seq` of `None` takes the next one.
    pub(crate) fn add_message(
        &mut self,
        epoch: u16,
        body: Body,
        message_seq: Option<u16>,
        transcript: bool,
    ) -> Result<Handshake, Error> {
        let seq = match message_seq {
            Some(seq) => seq,
            None => {
                let seq = self.next_send_seq;
                self.next_send_seq = self.next_send_seq.wrapping_add(1);
                seq
            }
        };
        let handshake = body.into_handshake(seq);
        if transcript {
            self.transcript_add(&handshake);
        }

        let max_datagram_size = self.config.max_datagram_size();
        let (Some(session), Some(flight)) = (self.session.as_ref(), self.flight.as_mut()) else {
            return Err(Error::UnexpectedMessage("No flight to add to".into()));
        };
        flight.add_handshake(epoch, &handshake, session, max_datagram_size);
        Ok(handshake)
    }

    pub(crate) fn add_change_cipher_spec(&mut self) -> Result<(), Error> {
        let Some(flight) = self.flight.as_mut() else {
            return Err(Error::UnexpectedMessage("No flight to add to".into()));
        };
        flight.add_record(ContentType::ChangeCipherSpec, 0, vec![CHANGE_CIPHER_SPEC]);
        Ok(())
    }

    /// The last flight of a handshake is only resent when the peer repeats
    /// its own flight.
    pub(crate) fn final_flight(&mut self) {
        if let Some(flight) = self.flight.as_mut() {
            flight.stop_retransmission();
        }
    }

    /// Protect the current flight with the session being negotiated or, once
    /// that moved out, with `established`.
    pub(crate) fn flight_datagrams(
        &mut self,
        established: Option<&mut DtlsSession>,
    ) -> Result<Vec<Buf>, Error> {
        let Some(flight) = self.flight.as_ref() else {
            return Ok(Vec::new());
        };
        let session = match (self.session.as_mut(), established) {
            (Some(session), _) | (None, Some(session)) => session,
            (None, None) => return Err(Error::UnexpectedMessage("No session for flight".into())),
        };
        flight.datagrams(session, self.config.max_datagram_size())
    }

    pub(crate) fn flight(&self) -> Option<&DtlsFlight> {
        self.flight.as_ref()
    }

    pub(crate) fn flight_mut(&mut self) -> Option<&mut DtlsFlight> {
        self.flight.as_mut()
    }

    /// The peer started answering our flight.
    pub(crate) fn response_started(&mut self) {
        if let Some(flight) = self.flight.as_mut() {
            flight.set_response_started();
        }
    }

    pub(crate) fn stop_retransmission(&mut self) {
        if let Some(flight) = self.flight.as_mut() {
            flight.stop_retransmission();
        }
    }

    pub(crate) fn request_resend(&mut self) {
        if self.flight.is_some() && self.outgoing == Outgoing::Nothing {
            self.outgoing = Outgoing::Resend;
        }
    }

    pub(crate) fn take_outgoing(&mut self) -> Outgoing {
        std::mem::replace(&mut self.outgoing, Outgoing::Nothing)
    }

    pub(crate) fn established(&mut self, session_id: SessionId, resumed: bool) {
        debug!(
            "Handshake with {} established (resumed: {})",
            self.peer, resumed
        );
        self.established = true;
        self.events
            .push(HandshakeEvent::Established { session_id, resumed });
    }

    pub(crate) fn is_established(&self) -> bool {
        self.established
    }

    pub(crate) fn complete(&mut self) {
        if self.completed {
            return;
        }
        debug!("Handshake with {} completed", self.peer);
        self.completed = true;
        self.stop_retransmission();
        self.events.push(HandshakeEvent::Completed);
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn take_events(&mut self) -> Vec<HandshakeEvent> {
        std::mem::take(&mut self.events)
    }

    /// Defer a record of a not yet active epoch. Returns false if full.
    pub(crate) fn defer_record(&mut self, record: Record) -> bool {
        if self.deferred_records.len() >= self.config.max_deferred_records() {
            return false;
        }
        self.deferred_records.push(record);
        true
    }

    /// Defer an application message until the session is established.
    /// Hands the message back if there is no room.
    pub(crate) fn defer_message(&mut self, message: RawData) -> Result<(), RawData> {
        if self.deferred_messages.len() >= self.config.max_deferred_messages() {
            return Err(message);
        }
        self.deferred_messages.push_back(message);
        Ok(())
    }
}

pub(crate) fn check_change_cipher_spec(data: &[u8]) -> Result<(), Error> {
    if data != [CHANGE_CIPHER_SPEC] {
        return Err(Error::handshake(
            AlertDescription::DecodeError,
            "Malformed change_cipher_spec",
        ));
    }
    Ok(())
}

impl fmt::Debug for HandshakeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeContext")
            .field("peer", &self.peer)
            .field("is_client", &self.is_client)
            .field("session", &self.session)
            .field("next_send_seq", &self.next_send_seq)
            .field("next_receive_seq", &self.next_receive_seq)
            .field("flight", &self.flight)
            .field("established", &self.established)
            .field("deferred_records", &self.deferred_records.len())
            .field("deferred_messages", &self.deferred_messages.len())
            .finish()
    }
}
