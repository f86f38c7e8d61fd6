//! Command queue and dispatcher.
//!
//! The HP 8751A answers strictly one request at a time, so the dispatcher keeps an
//! ordered queue of commands and writes only its head. The head becomes *outstanding*
//! when it is handed to the transport; a response deadline starts at that moment.
//!
//! The dispatcher is sans-IO: it never touches a socket or a timer. Callers feed it
//! caller intent ([`Dispatcher::enqueue`]), transport bytes ([`Dispatcher::on_bytes`])
//! and timer expiry ([`Dispatcher::on_timer`]); each call returns the
//! [`DispatchEvent`]s the owner must act on, in order. This keeps every step
//! deterministic and testable without a runtime.
//!
//! ```text
//! enqueue ──> [ C3 | C2 | C1* ] ──Transmit(C1)──> bridge
//!                          ▲
//!   on_bytes ─> framer ────┘ Completed(C1) ─> pop, Transmit(C2)
//!   on_timer ─────────────── Failed(C1, Timeout) ─> pop, Transmit(C2)
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{AppResult, VnaError};
use crate::protocol::command::{Channel, Command, CommandKind};
use crate::protocol::decoder::{decode, Response};
use crate::protocol::framer::ResponseFramer;

/// Response window of every command, measured from its write.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifier assigned to each enqueued command.
pub type CommandId = u64;

/// Action requested from the owner of the dispatcher.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// Write `command` to the transport now; its response window has started.
    Transmit {
        /// Queue identifier
        id: CommandId,
        /// Command to write
        command: Command,
    },
    /// The outstanding command received its response.
    Completed {
        /// Queue identifier
        id: CommandId,
        /// Kind of the resolved command
        kind: CommandKind,
        /// Channel tag of the resolved command
        channel: Channel,
        /// Decoded payload, or a decode error
        response: AppResult<Response>,
    },
    /// The outstanding command was dropped without a usable response.
    Failed {
        /// Queue identifier
        id: CommandId,
        /// Kind of the dropped command
        kind: CommandKind,
        /// Channel tag of the dropped command
        channel: Channel,
        /// Timeout, framing error or disconnect
        error: VnaError,
    },
}

#[derive(Debug)]
struct Queued {
    id: CommandId,
    command: Command,
}

/// FIFO queue with at most one outstanding command.
#[derive(Debug)]
pub struct Dispatcher {
    queue: VecDeque<Queued>,
    /// Deadline of the outstanding command; `Some` iff the head has been written.
    deadline: Option<Instant>,
    framer: ResponseFramer,
    response_timeout: Duration,
    next_id: CommandId,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONSE_TIMEOUT)
    }
}

impl Dispatcher {
    /// Create a dispatcher with a fixed response window.
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            deadline: None,
            framer: ResponseFramer::new(),
            response_timeout,
            next_id: 1,
        }
    }

    /// Response window measured from the write of each command.
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Deadline of the outstanding command.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The command currently awaiting its response.
    pub fn outstanding(&self) -> Option<(CommandId, &Command)> {
        self.deadline?;
        self.queue.front().map(|q| (q.id, &q.command))
    }

    /// Number of commands queued, including the outstanding one.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued or outstanding.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Append `command` to the tail; it is written immediately if the link is free.
    pub fn enqueue(&mut self, command: Command, now: Instant) -> (CommandId, Vec<DispatchEvent>) {
        let id = self.next_id;
        self.next_id += 1;
        debug!(id, kind = %command.kind, queued = self.queue.len(), "Enqueue command");
        self.queue.push_back(Queued { id, command });

        let mut events = Vec::new();
        if self.deadline.is_none() {
            self.promote(now, &mut events);
        }
        (id, events)
    }

    /// Feed a chunk of bytes received from the transport.
    pub fn on_bytes(&mut self, chunk: &[u8], now: Instant) -> Vec<DispatchEvent> {
        let mut events = Vec::new();
        trace!(bytes = chunk.len(), "Received chunk");
        self.framer.push(chunk);
        self.drain(now, &mut events);
        events
    }

    /// Check the response deadline; drops the outstanding command once it has passed.
    pub fn on_timer(&mut self, now: Instant) -> Vec<DispatchEvent> {
        let mut events = Vec::new();
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return events,
        }

        self.deadline = None;
        self.framer.reset();
        if let Some(dropped) = self.queue.pop_front() {
            warn!(id = dropped.id, kind = %dropped.command.kind, "Response timeout");
            events.push(DispatchEvent::Failed {
                id: dropped.id,
                kind: dropped.command.kind,
                channel: dropped.command.channel,
                error: VnaError::Timeout {
                    kind: dropped.command.kind,
                    channel: dropped.command.channel,
                },
            });
        }
        self.promote(now, &mut events);
        events
    }

    /// Fail every queued command with `error` and clear all framing state.
    pub fn clear(&mut self, error: VnaError) -> Vec<DispatchEvent> {
        self.deadline = None;
        self.framer.reset();
        self.queue
            .drain(..)
            .map(|q| DispatchEvent::Failed {
                id: q.id,
                kind: q.command.kind,
                channel: q.command.channel,
                error: error.clone(),
            })
            .collect()
    }

    fn promote(&mut self, now: Instant, events: &mut Vec<DispatchEvent>) {
        let Some(head) = self.queue.front() else {
            return;
        };
        self.deadline = Some(now + self.response_timeout);
        debug!(id = head.id, kind = %head.command.kind, "Transmit command");
        events.push(DispatchEvent::Transmit {
            id: head.id,
            command: head.command.clone(),
        });
    }

    /// Emit every response the buffered bytes complete, promoting the next head after each.
    fn drain(&mut self, now: Instant, events: &mut Vec<DispatchEvent>) {
        while self.deadline.is_some() {
            let Some(head) = self.queue.front() else {
                self.deadline = None;
                break;
            };
            let rule = head.command.framing_rule();

            match self.framer.next_frame(rule) {
                Ok(None) => break,
                Ok(Some(payload)) => {
                    self.deadline = None;
                    let Some(done) = self.queue.pop_front() else {
                        break;
                    };
                    let response = decode(done.command.kind, &payload, done.command.channel);
                    if let Err(err) = &response {
                        warn!(id = done.id, error = %err, "Decode failed");
                    } else {
                        debug!(
                            id = done.id,
                            kind = %done.command.kind,
                            bytes = payload.len(),
                            "Command resolved"
                        );
                    }
                    events.push(DispatchEvent::Completed {
                        id: done.id,
                        kind: done.command.kind,
                        channel: done.command.channel,
                        response,
                    });
                    self.promote(now, events);
                }
                Err(err) => {
                    self.deadline = None;
                    self.framer.reset();
                    let Some(dropped) = self.queue.pop_front() else {
                        break;
                    };
                    warn!(
                        id = dropped.id,
                        kind = %dropped.command.kind,
                        error = %err,
                        "Framing error"
                    );
                    events.push(DispatchEvent::Failed {
                        id: dropped.id,
                        kind: dropped.command.kind,
                        channel: dropped.command.channel,
                        error: VnaError::Framing {
                            kind: dropped.command.kind,
                            reason: err.to_string(),
                        },
                    });
                    self.promote(now, events);
                }
            }
        }

        if self.deadline.is_none() {
            self.discard_unsolicited();
        }
    }

    /// Nothing is outstanding, so whatever is buffered answers no command.
    fn discard_unsolicited(&mut self) {
        let dropped = self.framer.discard_unsolicited();
        if dropped > 0 {
            warn!(
                bytes = dropped,
                "Discarding bytes received with no command outstanding"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn transmitted(events: &[DispatchEvent]) -> Vec<CommandId> {
        events
            .iter()
            .filter_map(|e| match e {
                DispatchEvent::Transmit { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn completed(events: &[DispatchEvent]) -> Vec<(CommandId, Response)> {
        events
            .iter()
            .filter_map(|e| match e {
                DispatchEvent::Completed { id, response, .. } => {
                    Some((*id, response.clone().unwrap()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn first_command_is_written_immediately() {
        let now = Instant::now();
        let mut dispatcher = Dispatcher::default();
        let (id, events) = dispatcher.enqueue(Command::identify(), now);
        assert_eq!(transmitted(&events), vec![id]);
        assert_eq!(dispatcher.deadline(), Some(now + DEFAULT_RESPONSE_TIMEOUT));

        // Second command waits behind the outstanding one
        let (_, events) = dispatcher.enqueue(Command::poll_hold(), now);
        assert!(events.is_empty());
        assert_eq!(dispatcher.len(), 2);
        assert_eq!(dispatcher.outstanding().map(|(i, _)| i), Some(id));
    }

    #[test]
    fn identify_split_in_two_chunks() {
        let now = Instant::now();
        let mut dispatcher = Dispatcher::default();
        let (id, _) = dispatcher.enqueue(Command::identify(), now);

        assert!(dispatcher.on_bytes(b"HP87", now).is_empty());
        let events = dispatcher.on_bytes(b"51A\n", now);
        assert_eq!(
            completed(&events),
            vec![(id, Response::Identity("HP8751A".into()))]
        );
        assert!(dispatcher.is_empty());
        assert_eq!(dispatcher.deadline(), None);
    }

    #[test]
    fn stimulus_block_with_trailing_newline() {
        let now = Instant::now();
        let mut dispatcher = Dispatcher::default();
        let (id, _) = dispatcher.enqueue(Command::get_stimulus(), now);

        let mut events = dispatcher.on_bytes(b"#6", now);
        events.extend(dispatcher.on_bytes(b"000008", now));
        let body: Vec<u8> = [1000.0f32, 2000.0]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();
        events.extend(dispatcher.on_bytes(&body, now));
        events.extend(dispatcher.on_bytes(b"\n", now));

        assert_eq!(
            completed(&events),
            vec![(id, Response::Stimulus(vec![1000.0, 2000.0]))]
        );
    }

    #[test]
    fn fifo_matching_survives_fragmentation() {
        let now = Instant::now();
        let mut wire = b"HP8751A\n0\n1\n#6000004".to_vec();
        wire.extend_from_slice(&5.0f32.to_be_bytes());
        wire.extend_from_slice(b"\n1\n");

        for chunk_size in [1usize, 3, 7, wire.len()] {
            let mut d = Dispatcher::default();
            let mut evs = Vec::new();
            for cmd in [
                Command::identify(),
                Command::poll_hold(),
                Command::cancel_sweep(),
                Command::get_stimulus(),
                Command::poll_hold(),
            ] {
                evs.extend(d.enqueue(cmd, now).1);
            }
            for chunk in wire.chunks(chunk_size) {
                evs.extend(d.on_bytes(chunk, now));
            }
            let resolved = completed(&evs);
            assert_eq!(
                resolved.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
                vec![1, 2, 3, 4, 5],
                "chunk size {chunk_size}"
            );
            assert_eq!(resolved[0].1, Response::Identity("HP8751A".into()));
            assert_eq!(resolved[1].1, Response::SweepDone(false));
            assert_eq!(resolved[2].1, Response::Acknowledged);
            assert_eq!(resolved[3].1, Response::Stimulus(vec![5.0]));
            assert_eq!(resolved[4].1, Response::SweepDone(true));
            // Every command was written exactly once, in order
            assert_eq!(transmitted(&evs), vec![1, 2, 3, 4, 5]);
            assert!(d.is_empty());
        }
    }

    #[test]
    fn timeout_drops_exactly_one_and_promotes_next() {
        let now = Instant::now();
        let mut dispatcher = Dispatcher::new(Duration::from_secs(5));
        let (first, _) = dispatcher.enqueue(Command::poll_hold(), now);
        let (second, _) = dispatcher.enqueue(Command::identify(), now);

        assert!(dispatcher
            .on_timer(now + Duration::from_millis(4999))
            .is_empty());

        let later = now + Duration::from_secs(5);
        let events = dispatcher.on_timer(later);
        assert_eq!(events.len(), 2);
        match &events[0] {
            DispatchEvent::Failed { id, error, .. } => {
                assert_eq!(*id, first);
                assert!(matches!(
                    error,
                    VnaError::Timeout {
                        kind: CommandKind::PollHold,
                        ..
                    }
                ));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(transmitted(&events), vec![second]);
        assert_eq!(dispatcher.len(), 1);
        // Window of the promoted command starts at its own write
        assert_eq!(dispatcher.deadline(), Some(later + Duration::from_secs(5)));
    }

    #[test]
    fn timeout_clears_partial_response() {
        let now = Instant::now();
        let mut dispatcher = Dispatcher::default();
        dispatcher.enqueue(Command::get_stimulus(), now);
        dispatcher.enqueue(Command::identify(), now);
        dispatcher.on_bytes(b"#6000016abc", now);

        dispatcher.on_timer(now + DEFAULT_RESPONSE_TIMEOUT);
        let events = dispatcher.on_bytes(b"HP8751A\n", now + DEFAULT_RESPONSE_TIMEOUT);
        assert_eq!(
            completed(&events),
            vec![(2, Response::Identity("HP8751A".into()))]
        );
    }

    #[test]
    fn framing_error_is_handled_like_timeout() {
        let now = Instant::now();
        let mut dispatcher = Dispatcher::default();
        dispatcher.enqueue(Command::get_channel_data(Channel::One), now);
        dispatcher.enqueue(Command::poll_hold(), now);

        let events = dispatcher.on_bytes(b"?>#6000008", now);
        assert!(matches!(
            events[0],
            DispatchEvent::Failed {
                id: 1,
                error: VnaError::Framing { .. },
                ..
            }
        ));
        assert_eq!(transmitted(&events), vec![2]);
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn decode_error_still_pops_the_command() {
        let now = Instant::now();
        let mut dispatcher = Dispatcher::default();
        dispatcher.enqueue(Command::fit_trace(), now);
        dispatcher.enqueue(Command::poll_hold(), now);

        let events = dispatcher.on_bytes(b"abc;def\n", now);
        match &events[0] {
            DispatchEvent::Completed { id, response, .. } => {
                assert_eq!(*id, 1);
                assert!(matches!(response, Err(VnaError::Decode { .. })));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(transmitted(&events), vec![2]);
    }

    #[test]
    #[traced_test]
    fn bytes_without_outstanding_command_are_discarded() {
        let now = Instant::now();
        let mut dispatcher = Dispatcher::default();
        assert!(dispatcher.on_bytes(b"1\n", now).is_empty());
        assert!(logs_contain("Discarding bytes received with no command outstanding"));

        let (id, _) = dispatcher.enqueue(Command::poll_hold(), now);
        let events = dispatcher.on_bytes(b"0\n", now);
        assert_eq!(completed(&events), vec![(id, Response::SweepDone(false))]);
    }

    #[test]
    fn bytes_after_the_last_reply_are_dropped_however_they_are_chunked() {
        let now = Instant::now();
        let chunkings: Vec<Vec<&[u8]>> = vec![
            vec![&b"HP8751A\n0\n"[..]],
            vec![&b"HP8751A\n"[..], &b"0\n"[..]],
        ];

        for chunks in chunkings {
            let mut dispatcher = Dispatcher::default();
            dispatcher.enqueue(Command::identify(), now);
            for chunk in &chunks {
                dispatcher.on_bytes(chunk, now);
            }
            assert!(dispatcher.framer.is_empty(), "chunks {chunks:?}");

            let (id, _) = dispatcher.enqueue(Command::poll_hold(), now);
            let events = dispatcher.on_bytes(b"1\n", now);
            assert_eq!(
                completed(&events),
                vec![(id, Response::SweepDone(true))],
                "chunks {chunks:?}"
            );
        }
    }

    #[test]
    #[traced_test]
    fn block_terminator_in_its_own_read_is_not_reported() {
        let now = Instant::now();
        let mut dispatcher = Dispatcher::default();
        let (id, _) = dispatcher.enqueue(Command::get_stimulus(), now);

        let mut block = b"#6000008".to_vec();
        block.extend_from_slice(&1000.0f32.to_be_bytes());
        block.extend_from_slice(&2000.0f32.to_be_bytes());
        let events = dispatcher.on_bytes(&block, now);
        assert_eq!(
            completed(&events),
            vec![(id, Response::Stimulus(vec![1000.0, 2000.0]))]
        );

        assert!(dispatcher.on_bytes(b"\n", now).is_empty());
        assert!(dispatcher.framer.is_empty());
        assert!(!logs_contain("Discarding bytes"));
    }

    #[test]
    fn clear_fails_everything() {
        let now = Instant::now();
        let mut dispatcher = Dispatcher::default();
        dispatcher.enqueue(Command::identify(), now);
        dispatcher.enqueue(Command::poll_hold(), now);

        let events = dispatcher.clear(VnaError::NotConnected);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(
            e,
            DispatchEvent::Failed {
                error: VnaError::NotConnected,
                ..
            }
        )));
        assert!(dispatcher.is_empty());
        assert_eq!(dispatcher.deadline(), None);
    }
}
