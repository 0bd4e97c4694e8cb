use std::{io::ErrorKind, net::TcpListener};

use zapline_instance::BotId;

/// Maps a bot to its worker's control port: `base_port + bot_id`.
///
/// Stateless: the same bot always gets the same port, so status and send
/// calls can recompute it without a lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocator {
    base_port: u16,
}

impl PortAllocator {
    pub const fn new(base_port: u16) -> Self {
        Self { base_port }
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Whether `bot_id` has a port under this base (non-negative and the
    /// sum fits in a TCP port).
    pub fn admits(&self, bot_id: BotId) -> bool {
        bot_id.0 >= 0 && self.base_port as i64 + bot_id.0 as i64 <= u16::MAX as i64
    }

    /// Only meaningful for ids where [`PortAllocator::admits`] holds; the
    /// supervisor rejects every other id before allocating.
    pub fn allocate(&self, bot_id: BotId) -> u16 {
        debug_assert!(self.admits(bot_id));
        let port = self.base_port as u32 + bot_id.0.max(0) as u32;
        port.min(u16::MAX as u32) as u16
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortProbe {
    Free,
    InUse,
    Unknown(String),
}

/// Checks whether `port` can be bound locally right now. A port still held by
/// an orphaned worker shows up as `InUse`.
pub fn probe(port: u16) -> PortProbe {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => {
            l.set_nonblocking(true).ok();
            PortProbe::Free
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => PortProbe::InUse,
        Err(e) => PortProbe::Unknown(e.to_string()),
    }
}
