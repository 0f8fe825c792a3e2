/// Counters for one filter session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub nodes_scanned: u32,
    /// Coalesced mutation batches handled by the watch loop.
    pub mutation_batches: u32,
    pub items_processed: u32,
    pub skipped_retry: u32,
    pub skipped_permanent: u32,
    pub duplicates: u32,
    pub allow_listed: u32,
    pub reapplied: u32,
    pub heuristic_flags: u32,
    pub remote_flags: u32,
    pub batches_flushed: u32,
    pub batches_failed: u32,
    /// Remote verdicts discarded on arrival: session over, item no longer
    /// seen, or author allow-listed since queueing.
    pub late_results_dropped: u32,
    pub item_errors: u32,
    /// History writes failed; history is memory-only for this session.
    pub persistence_degraded: bool,
}

impl std::fmt::Display for FilterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Slop Filter Session ===")?;
        writeln!(f, "Nodes scanned:      {}", self.nodes_scanned)?;
        writeln!(f, "Mutation batches:   {}", self.mutation_batches)?;
        writeln!(f, "Items processed:    {}", self.items_processed)?;
        writeln!(f, "Skipped (retry):    {}", self.skipped_retry)?;
        writeln!(f, "Skipped (policy):   {}", self.skipped_permanent)?;
        writeln!(f, "Duplicates:         {}", self.duplicates)?;
        writeln!(f, "Allow-listed:       {}", self.allow_listed)?;
        writeln!(f, "Re-collapsed:       {}", self.reapplied)?;
        writeln!(f, "Item errors:        {}", self.item_errors)?;
        if self.persistence_degraded {
            writeln!(f, "History:            memory only (store unavailable)")?;
        }
        writeln!(f, "\nFlagged:")?;
        writeln!(f, "  Heuristic: {}", self.heuristic_flags)?;
        writeln!(f, "  Remote:    {}", self.remote_flags)?;
        let flushed = self.batches_flushed.max(1);
        writeln!(f, "\nBatches:")?;
        writeln!(f, "  Flushed: {}", self.batches_flushed)?;
        writeln!(
            f,
            "  Failed:  {} ({:.0}%)",
            self.batches_failed,
            self.batches_failed as f64 / flushed as f64 * 100.0
        )?;
        write!(f, "  Late results dropped: {}", self.late_results_dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_reports_failure_rate() {
        let stats = FilterStats {
            batches_flushed: 4,
            batches_failed: 1,
            heuristic_flags: 2,
            ..FilterStats::default()
        };
        let text = stats.to_string();
        assert!(text.contains("Failed:  1 (25%)"));
        assert!(text.contains("Heuristic: 2"));
    }
}
