//! Negotiated state of one DTLS session.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buf;
use crate::crypto::{Aad, CipherSuite, MasterSecret, RecordCipher, AEAD_OVERHEAD};
use crate::message::{ConnectionId, SessionId};
use crate::record::{Record, RECORD_HEADER_LEN};
use crate::types::{ContentType, Sequence, MAX_PLAINTEXT_FRAGMENT_LENGTH, MAX_SEQUENCE_NUMBER};
use crate::window::{ReplayFilter, ReplayWindow};
use crate::Error;

/// What is kept of a session to resume it later with an abbreviated handshake.
#[derive(Clone)]
pub struct SessionTicket {
    pub session_id: SessionId,
    pub cipher_suite: CipherSuite,
    pub master_secret: MasterSecret,
    /// PSK identity the client authenticated with.
    pub identity: Vec<u8>,
    pub server_name: Option<String>,
    pub created: Instant,
}

impl fmt::Debug for SessionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTicket")
            .field("session_id", &self.session_id)
            .field("cipher_suite", &self.cipher_suite)
            .field("identity", &String::from_utf8_lossy(&self.identity))
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

struct ReadState {
    epoch: u16,
    cipher: Option<Arc<dyn RecordCipher>>,
    window: ReplayWindow,
}

struct WriteState {
    epoch: u16,
    cipher: Option<Arc<dyn RecordCipher>>,
    next_sequence: u64,
}

/// Cryptographic state of a session: one read and one write epoch plus the
/// plaintext epoch 0 used during the handshake.
pub struct DtlsSession {
    session_id: SessionId,
    cipher_suite: CipherSuite,
    master_secret: Option<MasterSecret>,
    identity: Vec<u8>,
    server_name: Option<String>,
    /// Id the peer puts in records sent to us.
    read_cid: Option<ConnectionId>,
    /// Id we put in records sent to the peer.
    write_cid: Option<ConnectionId>,
    max_fragment_length: usize,
    epoch0_window: ReplayWindow,
    epoch0_next_sequence: u64,
    read: ReadState,
    write: WriteState,
}

impl DtlsSession {
    /// Empty session at epoch 0. `initial_sequence` is the first record
    /// sequence number to write, as a server mirrors the CLIENT_HELLO's.
    pub fn new(initial_sequence: u64) -> Self {
        DtlsSession {
            session_id: SessionId::empty(),
            cipher_suite: CipherSuite::Null,
            master_secret: None,
            identity: Vec::new(),
            server_name: None,
            read_cid: None,
            write_cid: None,
            max_fragment_length: MAX_PLAINTEXT_FRAGMENT_LENGTH,
            epoch0_window: ReplayWindow::new(),
            epoch0_next_sequence: initial_sequence,
            read: ReadState {
                epoch: 0,
                cipher: None,
                window: ReplayWindow::new(),
            },
            write: WriteState {
                epoch: 0,
                cipher: None,
                next_sequence: 0,
            },
        }
    }

    /// Session at epoch 0 carrying the parameters of a ticket.
    pub fn resume(ticket: &SessionTicket, initial_sequence: u64) -> Self {
        let mut session = Self::new(initial_sequence);
        session.session_id = ticket.session_id;
        session.cipher_suite = ticket.cipher_suite;
        session.master_secret = Some(ticket.master_secret.clone());
        session.identity = ticket.identity.clone();
        session.server_name = ticket.server_name.clone();
        session
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn set_session_id(&mut self, session_id: SessionId) {
        self.session_id = session_id;
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    pub fn set_cipher_suite(&mut self, suite: CipherSuite) {
        self.cipher_suite = suite;
    }

    pub fn master_secret(&self) -> Option<&[u8]> {
        self.master_secret.as_ref().map(|m| &m[..])
    }

    pub fn set_master_secret(&mut self, master: MasterSecret) {
        self.master_secret = Some(master);
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    pub fn set_identity(&mut self, identity: Vec<u8>) {
        self.identity = identity;
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn set_server_name(&mut self, name: Option<String>) {
        self.server_name = name;
    }

    pub fn read_cid(&self) -> Option<&ConnectionId> {
        self.read_cid.as_ref()
    }

    pub fn write_cid(&self) -> Option<&ConnectionId> {
        self.write_cid.as_ref()
    }

    /// Set the negotiated connection ids. Empty ids count as absent.
    pub fn set_cids(&mut self, read: Option<ConnectionId>, write: Option<ConnectionId>) {
        self.read_cid = read.filter(|c| !c.is_empty());
        self.write_cid = write.filter(|c| !c.is_empty());
    }

    pub fn max_fragment_length(&self) -> usize {
        self.max_fragment_length
    }

    pub fn read_epoch(&self) -> u16 {
        self.read.epoch
    }

    pub fn write_epoch(&self) -> u16 {
        self.write.epoch
    }

    /// Move reading to the next epoch, protected by `cipher`.
    pub fn activate_read(&mut self, cipher: Arc<dyn RecordCipher>) -> Result<(), Error> {
        let epoch = Sequence::next_epoch(self.read.epoch)?;
        debug!("Read epoch {} activated", epoch);
        self.read = ReadState {
            epoch,
            cipher: Some(cipher),
            window: ReplayWindow::new(),
        };
        Ok(())
    }

    /// Move writing to the next epoch, protected by `cipher`.
    pub fn activate_write(&mut self, cipher: Arc<dyn RecordCipher>) -> Result<(), Error> {
        let epoch = Sequence::next_epoch(self.write.epoch)?;
        debug!("Write epoch {} activated", epoch);
        self.write = WriteState {
            epoch,
            cipher: Some(cipher),
            next_sequence: 0,
        };
        Ok(())
    }

    /// Ticket to resume this session, once keys were agreed.
    pub fn ticket(&self) -> Option<SessionTicket> {
        if self.session_id.is_empty() {
            return None;
        }
        Some(SessionTicket {
            session_id: self.session_id,
            cipher_suite: self.cipher_suite,
            master_secret: self.master_secret.clone()?,
            identity: self.identity.clone(),
            server_name: self.server_name.clone(),
            created: Instant::now(),
        })
    }

    fn window(&self, epoch: u16) -> Option<&ReplayWindow> {
        if epoch == 0 {
            Some(&self.epoch0_window)
        } else if epoch == self.read.epoch {
            Some(&self.read.window)
        } else {
            None
        }
    }

    /// Cheap duplicate check before decryption. Never modifies the window.
    pub fn is_acceptable(&self, sequence: Sequence, filter: ReplayFilter) -> bool {
        self.window(sequence.epoch)
            .map(|w| w.is_acceptable(sequence.sequence_number, filter))
            .unwrap_or(false)
    }

    /// Mark a decrypted record as received.
    ///
    /// Returns true if it is the newest record of its epoch.
    pub fn mark_read(&mut self, sequence: Sequence) -> bool {
        let window = if sequence.epoch == 0 {
            &mut self.epoch0_window
        } else if sequence.epoch == self.read.epoch {
            &mut self.read.window
        } else {
            return false;
        };
        window.mark_read(sequence.sequence_number)
    }

    /// Remove record protection.
    ///
    /// Returns the real content type and the plaintext. Every failure to
    /// authenticate is reported as the same [`Error::DecryptError`].
    pub fn decrypt(&self, record: &Record) -> Result<(ContentType, Vec<u8>), Error> {
        let epoch = record.sequence.epoch;

        if epoch == 0 {
            if record.content_type == ContentType::Tls12Cid {
                return Err(Error::DecryptError);
            }
            return Ok((record.content_type, record.fragment.clone()));
        }

        if epoch != self.read.epoch {
            return Err(Error::DecryptError);
        }
        let Some(cipher) = &self.read.cipher else {
            return Err(Error::DecryptError);
        };

        let plaintext_len = record
            .fragment
            .len()
            .checked_sub(AEAD_OVERHEAD)
            .ok_or(Error::DecryptError)? as u16;

        match (&record.cid, &self.read_cid) {
            (Some(cid), Some(own)) if cid == own => {
                let aad = Aad::new_cid(record.sequence, cid, plaintext_len);
                let inner = cipher.decrypt(&aad, &record.fragment)?;
                split_inner_plaintext(inner)
            }
            (Some(_), _) => Err(Error::DecryptError),
            (None, _) => {
                let aad = Aad::new(record.content_type, record.sequence, plaintext_len);
                let plaintext = cipher.decrypt(&aad, &record.fragment)?;
                Ok((record.content_type, plaintext))
            }
        }
    }

    /// Protect and frame one record into `output`.
    ///
    /// `epoch` is either 0 or the current write epoch. Records are assigned
    /// the next sequence number of that epoch.
    pub fn encode(
        &mut self,
        content_type: ContentType,
        epoch: u16,
        plaintext: &[u8],
        output: &mut Buf,
    ) -> Result<(), Error> {
        if plaintext.len() > self.max_fragment_length {
            return Err(Error::MessageTooLarge(plaintext.len()));
        }

        if epoch == 0 {
            let sequence = Sequence {
                epoch: 0,
                sequence_number: self.epoch0_next_sequence,
            };
            if sequence.sequence_number > MAX_SEQUENCE_NUMBER {
                return Err(Error::SequenceExhausted(0));
            }
            self.epoch0_next_sequence += 1;
            Record::encode(content_type, sequence, None, plaintext, output);
            return Ok(());
        }

        if epoch != self.write.epoch {
            return Err(Error::UnexpectedMessage(format!(
                "No write state for epoch {}",
                epoch
            )));
        }
        let Some(cipher) = &self.write.cipher else {
            return Err(Error::CryptoError("Write keys missing".into()));
        };
        let sequence = Sequence {
            epoch,
            sequence_number: self.write.next_sequence,
        };
        if sequence.sequence_number > MAX_SEQUENCE_NUMBER {
            return Err(Error::SequenceExhausted(epoch));
        }

        match &self.write_cid {
            Some(cid) => {
                // DTLSInnerPlaintext: content || real type || zero-length padding.
                let mut inner = Vec::with_capacity(plaintext.len() + 1);
                inner.extend_from_slice(plaintext);
                inner.push(content_type.as_u8());
                let aad = Aad::new_cid(sequence, cid, inner.len() as u16);
                let fragment = cipher.encrypt(sequence, &aad, &inner)?;
                Record::encode(ContentType::Tls12Cid, sequence, Some(cid), &fragment, output);
            }
            None => {
                let aad = Aad::new(content_type, sequence, plaintext.len() as u16);
                let fragment = cipher.encrypt(sequence, &aad, plaintext)?;
                Record::encode(content_type, sequence, None, &fragment, output);
            }
        }
        self.write.next_sequence += 1;

        Ok(())
    }

    /// Bytes a record adds around its plaintext when written at `epoch`.
    pub fn record_overhead(&self, epoch: u16) -> usize {
        if epoch == 0 {
            return RECORD_HEADER_LEN;
        }
        match &self.write_cid {
            Some(cid) => RECORD_HEADER_LEN + cid.len() + 1 + AEAD_OVERHEAD,
            None => RECORD_HEADER_LEN + AEAD_OVERHEAD,
        }
    }
}

fn split_inner_plaintext(mut inner: Vec<u8>) -> Result<(ContentType, Vec<u8>), Error> {
    while let Some(last) = inner.pop() {
        if last != 0 {
            return Ok((ContentType::from_u8(last), inner));
        }
    }
    Err(Error::DecryptError)
}

impl fmt::Debug for DtlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsSession")
            .field("session_id", &self.session_id)
            .field("cipher_suite", &self.cipher_suite)
            .field("read_epoch", &self.read.epoch)
            .field("write_epoch", &self.write.epoch)
            .field("read_cid", &self.read_cid)
            .field("write_cid", &self.write_cid)
            .finish_non_exhaustive()
    }
}
