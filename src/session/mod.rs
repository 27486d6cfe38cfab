//! Client session state
//!
//! Mutable per-connection state: lifecycle phase, negotiated parameters,
//! the in-memory will, and the inflight tables for both handshake
//! directions. A session is owned by its client handle and guarded by a
//! `parking_lot::Mutex`; the lock is never held across an await point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::protocol::Will;
use crate::qos::{Direction, Inflight};

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Attached, CONNECT not yet accepted
    Connecting,
    /// CONNECT accepted, serving traffic
    Connected,
    /// Torn down; every further operation fails
    Closed,
}

/// Per-connection session state
pub struct Session {
    /// Client identifier, empty until CONNECT is accepted
    pub client_id: Arc<str>,
    /// Clean-session flag from CONNECT
    pub clean: bool,
    /// Negotiated keep-alive in seconds, 0 disables the watchdog
    pub keep_alive: u16,
    /// Will presented in CONNECT, cleared by graceful DISCONNECT
    pub will: Option<Will>,
    phase: Phase,
    last_activity: Instant,
    connect_deadline: Instant,
    outbound: AHashMap<u16, Inflight>,
    inbound: AHashMap<u16, Inflight>,
    next_packet_id: u16,
}

impl Session {
    pub fn new(connect_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            client_id: Arc::from(""),
            clean: true,
            keep_alive: 0,
            will: None,
            phase: Phase::Connecting,
            last_activity: now,
            connect_deadline: now + connect_timeout,
            outbound: AHashMap::new(),
            inbound: AHashMap::new(),
            next_packet_id: 1,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Promote to `Connected` with the parameters accepted from CONNECT
    pub fn establish(&mut self, client_id: Arc<str>, clean: bool, keep_alive: u16) {
        self.client_id = client_id;
        self.clean = clean;
        self.keep_alive = keep_alive;
        self.phase = Phase::Connected;
        self.last_activity = Instant::now();
    }

    pub fn close(&mut self) {
        self.phase = Phase::Closed;
    }

    /// Record client activity for the keep-alive watchdog
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Instant at which the watchdog should fire, if it is armed.
    ///
    /// While connecting this is the CONNECT deadline; once connected it is
    /// 1.5x the negotiated keep-alive past the last activity, the grace the
    /// protocol allows the server.
    pub fn watchdog_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Connecting => Some(self.connect_deadline),
            Phase::Connected if self.keep_alive > 0 => {
                let grace = Duration::from_secs(self.keep_alive as u64 * 3 / 2);
                Some(self.last_activity + grace)
            }
            _ => None,
        }
    }

    /// Allocate a packet id for an outbound QoS > 0 publish, skipping ids
    /// still tied to an open handshake.
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.outbound.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn inflight_insert(&mut self, record: Inflight) {
        let table = match record.direction {
            Direction::Outbound => &mut self.outbound,
            Direction::Inbound => &mut self.inbound,
        };
        table.insert(record.packet_id, record);
    }

    pub fn inflight_get_mut(&mut self, direction: Direction, packet_id: u16) -> Option<&mut Inflight> {
        match direction {
            Direction::Outbound => self.outbound.get_mut(&packet_id),
            Direction::Inbound => self.inbound.get_mut(&packet_id),
        }
    }

    pub fn inflight_remove(&mut self, direction: Direction, packet_id: u16) -> Option<Inflight> {
        match direction {
            Direction::Outbound => self.outbound.remove(&packet_id),
            Direction::Inbound => self.inbound.remove(&packet_id),
        }
    }

    pub fn inflight_contains(&self, direction: Direction, packet_id: u16) -> bool {
        match direction {
            Direction::Outbound => self.outbound.contains_key(&packet_id),
            Direction::Inbound => self.inbound.contains_key(&packet_id),
        }
    }

    /// Load restored records into the tables on session resume
    pub fn restore_inflight(&mut self, records: impl IntoIterator<Item = Inflight>) {
        for record in records {
            self.inflight_insert(record);
        }
    }
}
