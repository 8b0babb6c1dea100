/// Drops messages older than the newest one already delivered.
///
/// Sits after reassembly on the unreliable-sequenced pipeline, keyed by the
/// sequence number of each message's first fragment.
#[derive(Debug, Default)]
pub struct SequencedFilter {
    last_delivered: Option<u64>,
    dropped: u64,
}

impl SequencedFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a message starting at `sequence` may be delivered.
    pub fn accept(&mut self, sequence: u64) -> bool {
        match self.last_delivered {
            Some(last) if sequence <= last => {
                self.dropped += 1;
                false
            }
            _ => {
                self.last_delivered = Some(sequence);
                true
            }
        }
    }

    /// Messages rejected as stale so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
