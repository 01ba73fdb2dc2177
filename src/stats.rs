//! Per-stage counters
//!
//! Every stage owns its increments; readers tolerate torn snapshots, so all
//! counters are relaxed atomics. The whole group is dumped once at shutdown
//! when `--stats` is set.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

#[derive(Default)]
pub struct Stats {
    pub valid_preambles: AtomicU64,
    pub demodulated: AtomicU64,
    pub phase_corrected: AtomicU64,
    pub noise_filtered: AtomicU64,
    pub good_crc: AtomicU64,
    pub bad_crc: AtomicU64,
    pub fixed_single_bit: AtomicU64,
    pub fixed_two_bits: AtomicU64,
    pub messages_emitted: AtomicU64,
    pub unique_aircraft: AtomicU64,
    pub sinks: SinkStats,
}

/// Byte and client counters per network sink.
#[derive(Default)]
pub struct SinkStats {
    pub raw_out_bytes: AtomicU64,
    pub raw_out_clients_accepted: AtomicU64,
    pub raw_out_clients_removed: AtomicU64,
    pub raw_in_bytes: AtomicU64,
    pub raw_in_messages: AtomicU64,
    pub sbs_bytes: AtomicU64,
    pub sbs_clients_accepted: AtomicU64,
    pub sbs_clients_removed: AtomicU64,
    pub http_bytes: AtomicU64,
    pub http_clients_accepted: AtomicU64,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Relaxed);
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = |c: &AtomicU64| c.load(Relaxed);
        writeln!(f, "{} valid preambles", g(&self.valid_preambles))?;
        writeln!(f, "{} demodulated with zero errors", g(&self.demodulated))?;
        writeln!(f, "{} demodulated after phase correction", g(&self.phase_corrected))?;
        writeln!(f, "{} dropped by the noise filter", g(&self.noise_filtered))?;
        writeln!(f, "{} with good CRC", g(&self.good_crc))?;
        writeln!(f, "{} with bad CRC", g(&self.bad_crc))?;
        writeln!(f, "{} single bit errors fixed", g(&self.fixed_single_bit))?;
        writeln!(f, "{} two bit errors fixed", g(&self.fixed_two_bits))?;
        writeln!(f, "{} messages emitted", g(&self.messages_emitted))?;
        writeln!(f, "{} unique aircraft", g(&self.unique_aircraft))?;
        writeln!(f, "{} raw output bytes sent", g(&self.sinks.raw_out_bytes))?;
        writeln!(
            f,
            "{} raw output clients accepted, {} removed",
            g(&self.sinks.raw_out_clients_accepted),
            g(&self.sinks.raw_out_clients_removed)
        )?;
        writeln!(
            f,
            "{} raw input bytes received, {} messages accepted",
            g(&self.sinks.raw_in_bytes),
            g(&self.sinks.raw_in_messages)
        )?;
        writeln!(f, "{} SBS bytes sent", g(&self.sinks.sbs_bytes))?;
        writeln!(
            f,
            "{} SBS clients accepted, {} removed",
            g(&self.sinks.sbs_clients_accepted),
            g(&self.sinks.sbs_clients_removed)
        )?;
        writeln!(
            f,
            "{} HTTP bytes sent to {} requests",
            g(&self.sinks.http_bytes),
            g(&self.sinks.http_clients_accepted)
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::default();
        Stats::bump(&stats.valid_preambles);
        Stats::bump(&stats.valid_preambles);
        Stats::add(&stats.sinks.raw_out_bytes, 30);
        assert_eq!(stats.valid_preambles.load(Relaxed), 2);
        assert_eq!(stats.sinks.raw_out_bytes.load(Relaxed), 30);
    }

    #[test]
    fn dump_lists_every_stage() {
        let stats = Stats::default();
        let dump = stats.to_string();
        assert!(dump.contains("valid preambles"));
        assert!(dump.contains("good CRC"));
        assert!(dump.contains("unique aircraft"));
        assert!(dump.contains("SBS bytes sent"));
    }
}
