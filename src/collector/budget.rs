use tracing::warn;

/// Caps the number of data points reported for one instance in one cycle.
#[derive(Debug)]
pub struct ContextBudget {
    ceiling: usize,
    discovered: usize,
    emitted: usize,
    warned: bool,
}

impl ContextBudget {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            discovered: 0,
            emitted: 0,
            warned: false,
        }
    }

    /// Take one unit for a candidate data point. `false` means it must not be
    /// reported.
    pub fn admit(&mut self) -> bool {
        self.discovered += 1;
        if self.emitted < self.ceiling {
            self.emitted += 1;
            true
        } else {
            false
        }
    }

    pub fn discovered(&self) -> usize {
        self.discovered
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn dropped(&self) -> usize {
        self.discovered - self.emitted
    }

    /// Log the truncation once, with totals. Returns whether a warning was logged.
    pub fn warn_if_truncated(&mut self, instance: &str) -> bool {
        if self.warned || self.dropped() == 0 {
            return false;
        }
        self.warned = true;
        warn!(
            instance = %instance,
            discovered = self.discovered,
            ceiling = self.ceiling,
            dropped = self.dropped(),
            "Discovered more metric contexts than max_partition_contexts permits; \
             narrow the configured consumer groups, topics and partitions"
        );
        true
    }
}
