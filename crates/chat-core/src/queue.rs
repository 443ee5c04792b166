use std::collections::VecDeque;

use crate::types::{Message, OutboundFrame};

/// A chat message waiting for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub room_id: String,
    pub message: Message,
}

impl QueuedMessage {
    pub fn message_id(&self) -> &str {
        &self.message.id
    }

    pub fn to_frame(&self) -> OutboundFrame {
        OutboundFrame::ChatMessage {
            room_id: self.room_id.clone(),
            message: self.message.clone(),
        }
    }
}

/// A queued message that was handed to the writer and is waiting for the
/// writer to confirm the socket write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    /// Writer-assigned receipt; receipts grow with write order.
    pub receipt: u64,
    pub entry: QueuedMessage,
}

/// Result of one drain pass.
#[derive(Debug, PartialEq, Eq)]
pub struct DrainReport<E> {
    /// Entries handed to the sink and now awaiting acknowledgment.
    pub dispatched: usize,
    /// Receipt of the last dispatched entry.
    pub last_receipt: Option<u64>,
    /// Entries still waiting for the transport after the pass.
    pub remaining: usize,
    /// Sink failure that stopped the pass, if any.
    pub error: Option<E>,
}

/// FIFO buffer for chat messages that have not been confirmed as written.
///
/// Entries are `pending` until handed to the writer, then `in flight` until
/// the writer acknowledges their receipt. Only an acknowledgment removes an
/// entry; a lost connection puts every unacknowledged entry back at the front
/// in its original order. Draining needs `&mut self`, so an entry can never
/// be in two sends at once.
#[derive(Debug, Clone, Default)]
pub struct OutboundQueue {
    pending: VecDeque<QueuedMessage>,
    in_flight: VecDeque<InFlight>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries waiting for the transport.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.pending.iter()
    }

    /// Append an entry and return the new queue length.
    pub fn enqueue(&mut self, room_id: impl Into<String>, message: Message) -> usize {
        self.pending.push_back(QueuedMessage {
            room_id: room_id.into(),
            message,
        });
        self.pending.len()
    }

    /// Record a message that went to the writer without waiting in the queue.
    pub fn track(&mut self, room_id: impl Into<String>, message: Message, receipt: u64) {
        self.in_flight.push_back(InFlight {
            receipt,
            entry: QueuedMessage {
                room_id: room_id.into(),
                message,
            },
        });
    }

    /// Remove a pending or in-flight entry. Returns whether anything was
    /// removed.
    pub fn cancel(&mut self, room_id: &str, message_id: &str) -> bool {
        let matches =
            |entry: &QueuedMessage| entry.room_id == room_id && entry.message.id == message_id;
        let before = self.pending.len() + self.in_flight.len();
        self.pending.retain(|entry| !matches(entry));
        self.in_flight.retain(|flight| !matches(&flight.entry));
        self.pending.len() + self.in_flight.len() != before
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight.clear();
    }

    /// Hand pending entries to `sink` in enqueue order.
    ///
    /// `sink` returns the writer receipt for the entry, which then moves in
    /// flight. On the first failure that entry stays at the front, everything
    /// behind it stays in order, and the pass stops.
    pub fn drain<E, F>(&mut self, mut sink: F) -> DrainReport<E>
    where
        F: FnMut(&QueuedMessage) -> Result<u64, E>,
    {
        let mut dispatched = 0;
        let mut last_receipt = None;
        while let Some(entry) = self.pending.pop_front() {
            match sink(&entry) {
                Ok(receipt) => {
                    self.in_flight.push_back(InFlight { receipt, entry });
                    last_receipt = Some(receipt);
                    dispatched += 1;
                }
                Err(err) => {
                    self.pending.push_front(entry);
                    return DrainReport {
                        dispatched,
                        last_receipt,
                        remaining: self.pending.len(),
                        error: Some(err),
                    };
                }
            }
        }

        DrainReport {
            dispatched,
            last_receipt,
            remaining: 0,
            error: None,
        }
    }

    /// Drop every in-flight entry written up to and including `receipt`.
    ///
    /// The writer confirms writes in order, so one receipt covers all earlier
    /// ones.
    pub fn acknowledge(&mut self, receipt: u64) -> Vec<InFlight> {
        let mut written = Vec::new();
        while self
            .in_flight
            .front()
            .is_some_and(|flight| flight.receipt <= receipt)
        {
            if let Some(flight) = self.in_flight.pop_front() {
                written.push(flight);
            }
        }
        written
    }

    /// Put every unacknowledged entry back ahead of the pending ones, keeping
    /// send order, and return what was moved.
    pub fn requeue_in_flight(&mut self) -> Vec<InFlight> {
        let returned: Vec<InFlight> = self.in_flight.drain(..).collect();
        for flight in returned.iter().rev() {
            self.pending.push_front(flight.entry.clone());
        }
        returned
    }
}
