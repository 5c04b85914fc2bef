// Operation-scoped version numbering
//
// One counter per ranking operation, moved into its producer. One gate per
// consumer, dropping anything not newer than what it already accepted.

/// Hands out strictly increasing versions, starting at 1
#[derive(Debug, Default)]
pub struct VersionCounter {
    current: u64,
}

impl VersionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the new version
    pub fn next(&mut self) -> u64 {
        self.current += 1;
        self.current
    }

    /// Last version handed out, 0 before the first
    pub fn current(&self) -> u64 {
        self.current
    }
}

/// Consumer-side filter for out-of-order or replayed results
#[derive(Debug, Default)]
pub struct VersionGate {
    last_seen: Option<u64>,
}

impl VersionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `version` if it is newer than the last accepted one
    pub fn accept(&mut self, version: u64) -> bool {
        match self.last_seen {
            Some(last) if version <= last => false,
            _ => {
                self.last_seen = Some(version);
                true
            }
        }
    }

    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }
}
