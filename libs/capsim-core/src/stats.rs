//! Simulation statistics

use std::fmt;

/// Counters maintained by the node controller.
#[derive(Debug, Default, Clone)]
pub struct ControllerStats {
    pub queries: u64,
    pub allocates: u64,
    pub revokes: u64,
    pub rc_updates: u64,
    pub loads: u64,
    pub stores: u64,
    pub busy_rejects: u64,
    /// Retry callbacks serviced on the controller's ports.
    pub retries: u64,
}

impl ControllerStats {
    pub fn commands(&self) -> u64 {
        self.queries + self.allocates + self.revokes + self.rc_updates
    }
}

impl fmt::Display for ControllerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "controller: {} commands ({} query, {} allocate, {} revoke, {} rc-update)",
            self.commands(),
            self.queries,
            self.allocates,
            self.revokes,
            self.rc_updates
        )?;
        write!(
            f,
            "controller: {} loads, {} stores, {} busy rejects, {} retries",
            self.loads, self.stores, self.busy_rejects, self.retries
        )
    }
}

/// Counters maintained by an NCQ unit and its shared sender.
#[derive(Debug, Default, Clone)]
pub struct NcqStats {
    pub inserted: u64,
    pub commands_pushed: u64,
    pub packets_sent: u64,
    pub completed: u64,
    pub squashed_entries: u64,
    pub responses_dropped: u64,
    /// Refused command packets retransmitted on a retry callback.
    pub retries: u64,
}

impl NcqStats {
    pub fn merge(&mut self, other: &NcqStats) {
        self.inserted += other.inserted;
        self.commands_pushed += other.commands_pushed;
        self.packets_sent += other.packets_sent;
        self.completed += other.completed;
        self.squashed_entries += other.squashed_entries;
        self.responses_dropped += other.responses_dropped;
        self.retries += other.retries;
    }
}

impl fmt::Display for NcqStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ncq: {} entries, {} commands, {} packets, {} completed, {} squashed, {} dropped responses, {} retries",
            self.inserted,
            self.commands_pushed,
            self.packets_sent,
            self.completed,
            self.squashed_entries,
            self.responses_dropped,
            self.retries
        )
    }
}
