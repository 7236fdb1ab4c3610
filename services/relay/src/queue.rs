//! Per-direction packet queue.
//!
//! A strict FIFO of packets read from one side and bound for the other, plus
//! two single slots:
//! - `current`: the packet a receive is filling
//! - `blocked`: the packet whose send completed only partially; it is always
//!   retried first, in place, with its send cursor already advanced

use std::collections::VecDeque;

use crate::pool::Packet;

#[derive(Debug, Default)]
pub struct PacketQueue {
    queue: VecDeque<Packet>,
    current: Option<Packet>,
    blocked: Option<Packet>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filled packet.
    pub fn push_tail(&mut self, packet: Packet) {
        self.queue.push_back(packet);
    }

    /// Take the oldest queued packet. Ignores the `blocked` slot.
    pub fn pop_head(&mut self) -> Option<Packet> {
        self.queue.pop_front()
    }

    /// Next packet to send: the blocked one if any, otherwise the head.
    pub fn next_to_send(&mut self) -> Option<Packet> {
        self.blocked.take().or_else(|| self.queue.pop_front())
    }

    /// Park a partially sent packet so it is retried before anything else.
    pub fn park_blocked(&mut self, packet: Packet) {
        debug_assert!(self.blocked.is_none(), "blocked slot already occupied");
        self.blocked = Some(packet);
    }

    pub fn has_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    pub fn set_current(&mut self, packet: Packet) {
        debug_assert!(self.current.is_none(), "current slot already occupied");
        self.current = Some(packet);
    }

    pub fn take_current(&mut self) -> Option<Packet> {
        self.current.take()
    }

    /// Packets in the FIFO (excluding the two slots).
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing at all is held: FIFO and both slots empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.current.is_none() && self.blocked.is_none()
    }

    /// Remove every held packet, in send order (blocked, FIFO, current).
    pub fn drain(&mut self) -> impl Iterator<Item = Packet> + '_ {
        self.blocked
            .take()
            .into_iter()
            .chain(self.queue.drain(..))
            .chain(self.current.take())
    }
}
