//! Driving handshakes: flights, retransmission and completion.

use std::sync::Arc;

use super::Inner;
use crate::api::RawData;
use crate::connection::{Connection, ConnectionState};
use crate::event::HandshakeEvent;
use crate::handshake::Outgoing;
use crate::message::Alert;
use crate::record::Record;
use crate::Error;

impl Inner {
    /// Send what the handshaker produced, and act on its events.
    ///
    /// Records deferred for an epoch that became readable are processed
    /// afterwards.
    pub(super) fn after_handshake_step(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
    ) {
        let Some(handshaker) = state.handshaker.as_mut() else {
            return;
        };
        let outgoing = handshaker.ctx_mut().take_outgoing();
        let events = handshaker.ctx_mut().take_events();

        match outgoing {
            Outgoing::Nothing => {}
            Outgoing::Flight => {
                self.send_flight(connection, state);
                self.schedule_retransmission(connection, state);
            }
            Outgoing::Resend => {
                debug!("Resending flight to {}", connection.peer());
                self.send_flight(connection, state);
            }
        }

        let mut replay = Vec::new();
        for event in events {
            match &event {
                HandshakeEvent::Established { resumed, .. } => {
                    replay.extend(self.established(connection, state, *resumed));
                }
                HandshakeEvent::Completed => self.completed(connection, state),
                HandshakeEvent::Failed(_) => {}
            }
            self.notify(connection.peer(), &event);
        }

        replay.extend(take_ready_records(state));
        for record in replay {
            if state.closed {
                break;
            }
            self.handle_record(connection, state, record);
        }
    }

    /// Protect and send the current flight.
    fn send_flight(&self, connection: &Connection, state: &mut ConnectionState) {
        let ConnectionState {
            handshaker,
            session,
            ..
        } = state;
        let Some(handshaker) = handshaker.as_mut() else {
            return;
        };
        match handshaker.ctx_mut().flight_datagrams(session.as_mut()) {
            Ok(datagrams) => {
                for datagram in datagrams {
                    let _ = self.send_datagram(&datagram, connection.peer());
                }
            }
            Err(Error::SequenceExhausted(epoch)) => {
                warn!(
                    "Sequence numbers of epoch {} exhausted with {}",
                    epoch,
                    connection.peer()
                );
                connection.set_resumption_required(true);
            }
            Err(e) => debug!("Flight to {} not sent: {}", connection.peer(), e),
        }
    }

    fn schedule_retransmission(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
    ) {
        if let Some((_, timer)) = state.retransmit.take() {
            timer.cancel();
        }
        let Some(flight) = state.handshaker.as_ref().and_then(|h| h.ctx().flight()) else {
            return;
        };
        if !flight.is_retransmission_needed() {
            return;
        }
        let number = flight.number();
        let delay = flight.backoff().rto();
        trace!("Flight {} to {} times out in {:?}", number, connection.peer(), delay);

        let timer = self.schedule(connection, delay, move |inner, connection| {
            let mut state = connection.lock();
            inner.retransmit(connection, &mut state, number);
        });
        if let Some(timer) = timer {
            state.retransmit = Some((number, timer));
        }
    }

    /// The timeout of flight `number` expired.
    fn retransmit(self: &Arc<Self>, connection: &Arc<Connection>, state: &mut ConnectionState, number: u8) {
        if state.closed || !self.is_running() {
            return;
        }
        if !matches!(&state.retransmit, Some((n, _)) if *n == number) {
            return;
        }
        state.retransmit = None;
        let early_stop = self.config.early_stop_retransmission();
        let Some(flight) = state
            .handshaker
            .as_mut()
            .and_then(|h| h.ctx_mut().flight_mut())
        else {
            return;
        };
        if flight.number() != number || !flight.is_retransmission_needed() {
            return;
        }

        if !flight.backoff().can_retry() {
            debug!(
                "Flight {} to {} unanswered after {} retransmissions",
                number,
                connection.peer(),
                flight.backoff().retransmissions()
            );
            self.abort_handshake(connection, state, Error::Timeout);
            return;
        }

        // The peer is answering, wait for the rest of its flight.
        let resend = !(early_stop && flight.is_response_started());
        if resend {
            flight.backoff_mut().attempt();
        } else {
            flight.backoff_mut().exhaust();
        }

        if resend {
            debug!("Retransmitting flight {} to {}", number, connection.peer());
            self.send_flight(connection, state);
        }
        self.schedule_retransmission(connection, state);
    }

    /// Move the new session into place. Returns the deferred records.
    fn established(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
        resumed: bool,
    ) -> Vec<Record> {
        let Some(handshaker) = state.handshaker.as_mut() else {
            return Vec::new();
        };
        let Some(session) = handshaker.ctx_mut().take_session() else {
            return Vec::new();
        };
        let completed = handshaker.ctx().is_completed();
        let messages: Vec<RawData> = handshaker.ctx_mut().deferred_messages.drain(..).collect();
        let records: Vec<Record> = handshaker.ctx_mut().deferred_records.drain(..).collect();

        debug!(
            "Session {} with {} established{}",
            session.session_id(),
            connection.peer(),
            if resumed { " (resumed)" } else { "" }
        );
        if let Some(ticket) = session.ticket() {
            self.store.put_ticket(connection, ticket);
        }
        state.session = Some(session);
        state.newest_read = None;
        if let Some((_, timer)) = state.retransmit.take() {
            timer.cancel();
        }
        connection.touch();
        connection.set_resumption_required(false);
        connection.set_handshaking(false);
        self.release_unverified(state);

        if let Some(previous) = state.replaces.take() {
            if !Arc::ptr_eq(&previous, connection) {
                debug!("Replacing previous connection with {}", connection.peer());
                self.replaced(previous);
            }
        }

        if !completed {
            self.schedule_completion(connection, state);
        }

        for message in messages {
            self.send_application_data(connection, state, message);
        }
        records
    }

    /// Our final flight needs no more resends.
    fn completed(&self, connection: &Arc<Connection>, state: &mut ConnectionState) {
        trace!("Handshake with {} completed", connection.peer());
        state.cancel_timers();
        let leftover = state.take_deferred_messages();
        state.handshaker = None;
        connection.set_handshaking(false);
        connection.set_started_by(None);
        for message in leftover {
            message.failed(&Error::NoSession);
        }
    }

    /// Without word from the peer, the final flight counts as received
    /// after the time a peer would need to exhaust its retransmissions.
    fn schedule_completion(self: &Arc<Self>, connection: &Arc<Connection>, state: &mut ConnectionState) {
        if let Some(timer) = state.completion.take() {
            timer.cancel();
        }
        let retries = self.config.max_retransmissions().saturating_add(1);
        let delay = self.config.retransmission_timeout().saturating_mul(retries);

        state.completion = self.schedule(connection, delay, |inner, connection| {
            let mut state = connection.lock();
            if state.completion.take().is_none() || state.closed {
                return;
            }
            if let Some(handshaker) = state.handshaker.as_mut() {
                handshaker.ctx_mut().complete();
            }
            inner.after_handshake_step(connection, &mut state);
        });
    }

    /// The application data of the peer shows it has our final flight.
    pub(super) fn acknowledge_final_flight(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
    ) {
        let Some(handshaker) = state.handshaker.as_mut() else {
            return;
        };
        if !handshaker.ctx().is_established() {
            return;
        }
        handshaker.on_application_data();
        self.after_handshake_step(connection, state);
    }

    /// The connection a new handshake took over from is done.
    fn replaced(self: &Arc<Self>, previous: Arc<Connection>) {
        let inner = Arc::clone(self);
        let target = Arc::clone(&previous);
        let task = Box::new(move || {
            let mut state = target.lock();
            inner.terminate(&target, &mut state, Error::Closed);
        });
        if self.execute_on(&previous, task).is_err() {
            self.store.remove(&previous);
        }
    }

    /// A handshake error aborts the handshake with a fatal alert.
    pub(super) fn handshake_failed(
        &self,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
        error: Error,
    ) {
        let (level, description) = error.alert();
        self.send_alert(connection, state, Alert::new(level, description));
        self.abort_handshake(connection, state, error);
    }
}

/// Deferred records whose epoch became readable.
fn take_ready_records(state: &mut ConnectionState) -> Vec<Record> {
    let established = state.session.as_ref().map(|s| s.read_epoch());
    let Some(handshaker) = state.handshaker.as_mut() else {
        return Vec::new();
    };
    let pending = handshaker.ctx().session().map(|s| s.read_epoch());
    let readable = |epoch: u16| match pending {
        Some(p) => p == epoch,
        None => established == Some(epoch),
    };
    let deferred = std::mem::take(&mut handshaker.ctx_mut().deferred_records);
    let (ready, waiting): (Vec<Record>, Vec<Record>) = deferred
        .into_iter()
        .partition(|r| readable(r.sequence.epoch));
    handshaker.ctx_mut().deferred_records = waiting;
    ready
}
