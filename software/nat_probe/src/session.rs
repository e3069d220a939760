//! Per-connection state for the TCP device status protocol.
//!
//! A TCP device confirms a reply by sending anything else on the same
//! connection. The session holds the one entry whose reply has been written
//! but not yet confirmed.

use crate::log_entry::LogEntry;

#[derive(Default, Debug)]
pub struct TcpSession {
    pending: Option<LogEntry>,
}

impl TcpSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// More bytes arrived on the connection: the previous reply got through.
    pub fn confirm_previous(&mut self) -> Option<LogEntry> {
        self.pending.take()
    }

    /// Hold `entry` until the device sends again or the connection ends.
    ///
    /// Any entry still held is returned confirmed, though the read loop
    /// always takes it first.
    pub fn await_confirmation(&mut self, entry: LogEntry) -> Option<LogEntry> {
        self.pending.replace(entry)
    }

    /// The connection ended: the last reply was never confirmed.
    pub fn abandon(&mut self) -> Option<LogEntry> {
        self.pending.take().map(LogEntry::into_timed_out)
    }

    pub fn is_awaiting(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_entry::tests::nat_entry;

    #[test]
    fn sequence_of_messages_then_disconnect() {
        let mut session = TcpSession::new();
        let mut flushed = Vec::new();

        // First message: nothing to confirm yet
        assert!(session.confirm_previous().is_none());
        assert!(session.await_confirmation(nat_entry("10.0.0.1:1")).is_none());

        for _ in 0..2 {
            flushed.extend(session.confirm_previous());
            assert!(!session.is_awaiting());
            session.await_confirmation(nat_entry("10.0.0.1:1"));
        }

        flushed.extend(session.abandon());
        assert!(!session.is_awaiting());
        assert!(session.abandon().is_none());

        let timed_out: Vec<bool> = flushed.iter().map(LogEntry::timed_out).collect();
        assert_eq!(timed_out, [false, false, true]);
    }

    #[test]
    fn held_entry_comes_back_confirmed() {
        let mut session = TcpSession::new();
        let first = nat_entry("10.0.0.1:1");
        let first_id = first.trace_id;
        session.await_confirmation(first);

        let held = session.await_confirmation(nat_entry("10.0.0.1:1")).unwrap();
        assert_eq!(held.trace_id, first_id);
        assert!(!held.timed_out());
        assert!(session.is_awaiting());
    }
}
