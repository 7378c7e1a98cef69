//! Flights: handshake messages sent and retransmitted as one unit.

use std::fmt;

use crate::buffer::Buf;
use crate::message::{Handshake, HANDSHAKE_HEADER_LEN};
use crate::session::DtlsSession;
use crate::timer::ExponentialBackoff;
use crate::types::ContentType;
use crate::Error;

/// Plaintext of one record in a flight.
///
/// Kept unprotected so that resends get fresh record sequence numbers.
struct FlightRecord {
    content_type: ContentType,
    epoch: u16,
    fragment: Vec<u8>,
}

pub struct DtlsFlight {
    number: u8,
    records: Vec<FlightRecord>,
    backoff: ExponentialBackoff,
    retransmission_needed: bool,
    response_started: bool,
}

impl DtlsFlight {
    pub fn new(number: u8, backoff: ExponentialBackoff) -> Self {
        debug!("Begin flight {}", number);
        DtlsFlight {
            number,
            records: Vec::new(),
            backoff,
            retransmission_needed: true,
            response_started: false,
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn add_record(&mut self, content_type: ContentType, epoch: u16, fragment: Vec<u8>) {
        self.records.push(FlightRecord {
            content_type,
            epoch,
            fragment,
        });
    }

    /// Add a handshake message, fragmented so every record fits a datagram.
    pub fn add_handshake(
        &mut self,
        epoch: u16,
        handshake: &Handshake,
        session: &DtlsSession,
        max_datagram_size: usize,
    ) {
        let max_body = max_datagram_size
            .saturating_sub(session.record_overhead(epoch) + HANDSHAKE_HEADER_LEN)
            .min(session.max_fragment_length() - HANDSHAKE_HEADER_LEN);
        for fragment in handshake.fragments(max_body) {
            self.add_record(ContentType::Handshake, epoch, fragment.into_vec());
        }
    }

    /// Protect the records with `session` and pack them into datagrams.
    pub fn datagrams(
        &self,
        session: &mut DtlsSession,
        max_datagram_size: usize,
    ) -> Result<Vec<Buf>, Error> {
        let mut datagrams: Vec<Buf> = Vec::new();
        let mut record = Buf::new();

        for entry in &self.records {
            record.clear();
            session.encode(entry.content_type, entry.epoch, &entry.fragment, &mut record)?;

            match datagrams.last_mut() {
                Some(last) if last.len() + record.len() <= max_datagram_size => {
                    last.extend_from_slice(&record);
                }
                _ => {
                    let mut datagram = Buf::with_capacity(max_datagram_size);
                    datagram.extend_from_slice(&record);
                    datagrams.push(datagram);
                }
            }
        }

        Ok(datagrams)
    }

    pub fn is_retransmission_needed(&self) -> bool {
        self.retransmission_needed
    }

    /// The round trip this flight started is over, stop resending it.
    pub fn stop_retransmission(&mut self) {
        self.retransmission_needed = false;
    }

    /// Some of the peer's response arrived.
    pub fn is_response_started(&self) -> bool {
        self.response_started
    }

    pub fn set_response_started(&mut self) {
        self.response_started = true;
    }

    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.backoff
    }

    pub fn backoff_mut(&mut self) -> &mut ExponentialBackoff {
        &mut self.backoff
    }
}

impl fmt::Debug for DtlsFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsFlight")
            .field("number", &self.number)
            .field("records", &self.records.len())
            .field("rto", &self.backoff.rto())
            .field("retransmissions", &self.backoff.retransmissions())
            .field("retransmission_needed", &self.retransmission_needed)
            .field("response_started", &self.response_started)
            .finish()
    }
}
