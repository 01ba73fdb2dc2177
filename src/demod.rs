//! Preamble detection and bit slicing
//!
//! Scans a magnitude block for the 8 us Mode S preamble, slices the 112
//! pulse-position bits that follow, and frames whatever survives the CRC.
//! Each valid preamble gets at most two slicing attempts: one straight, one
//! on a phase-corrected copy of the window.

use std::sync::Arc;

use tracing::debug;

use crate::crc::CrcRepair;
use crate::icao::IcaoCache;
use crate::message::{self, LONG_MSG_BITS, LONG_MSG_BYTES, ModesMessage, SHORT_MSG_BITS};
use crate::phase;
use crate::stats::Stats;

/// Preamble duration in microseconds.
pub const PREAMBLE_US: usize = 8;
/// Magnitude samples per microsecond at 2 MS/s.
pub const SAMPLES_PER_US: usize = 2;
/// Magnitude samples spanned by the preamble.
pub const PREAMBLE_SAMPLES: usize = PREAMBLE_US * SAMPLES_PER_US;
/// Magnitude samples spanned by a preamble plus a long message.
pub const FULL_FRAME_SAMPLES: usize = (PREAMBLE_US + LONG_MSG_BITS) * SAMPLES_PER_US;

/// Two adjacent samples closer than this inherit the previous bit value.
const INHERIT_DELTA: u16 = 256;
/// Minimum mean |low-high| per slot for a window to count as signal.
const NOISE_FLOOR_DELTA: u32 = 10 * 255;
/// Maximum tolerated first-half slicing errors in aggressive mode.
const MAX_AGGRESSIVE_ERRORS: u32 = 3;

pub struct Demodulator {
    fix_errors: bool,
    aggressive: bool,
    check_crc: bool,
    stats: Arc<Stats>,
}

struct Sliced {
    frame: [u8; LONG_MSG_BYTES],
    byte_len: usize,
    errors: u32,
}

impl Demodulator {
    pub fn new(fix_errors: bool, aggressive: bool, check_crc: bool, stats: Arc<Stats>) -> Self {
        Self {
            fix_errors,
            aggressive,
            check_crc,
            stats,
        }
    }

    /// Scan one magnitude block. Messages are handed to `emit` in ascending
    /// sample order; `now` (unix seconds) drives the recently-seen cache.
    pub fn scan(
        &self,
        m: &[u16],
        cache: &mut IcaoCache,
        now: u64,
        emit: &mut dyn FnMut(ModesMessage),
    ) {
        if m.len() < FULL_FRAME_SAMPLES {
            return;
        }

        let mut j = 0;
        while j + FULL_FRAME_SAMPLES <= m.len() {
            if !preamble_at(m, j) {
                j += 1;
                continue;
            }
            Stats::bump(&self.stats.valid_preambles);

            let window = &m[j..j + FULL_FRAME_SAMPLES];
            match self.try_window(window, cache, now, false) {
                Attempt::Accepted(mm) => {
                    // A frame that only got through because CRC checking is
                    // off still prints, but never causes a full-frame skip.
                    j += if mm.crc_ok {
                        PREAMBLE_SAMPLES + mm.bits * SAMPLES_PER_US
                    } else {
                        1
                    };
                    self.finish(mm, emit);
                    continue;
                }
                Attempt::Noise => {
                    // Too faint to be worth a phase retry.
                    Stats::bump(&self.stats.noise_filtered);
                    j += 1;
                    continue;
                }
                Attempt::Rejected => {}
            }

            // Retry once on a phase-corrected copy of the same window. Only
            // a frame with a verified CRC is worth emitting twice over.
            if let Attempt::Accepted(mm) = self.try_window(&phase::corrected(window), cache, now, true)
            {
                if mm.crc_ok {
                    j += PREAMBLE_SAMPLES + mm.bits * SAMPLES_PER_US;
                    Stats::bump(&self.stats.phase_corrected);
                    self.finish(mm, emit);
                    continue;
                }
            }
            j += 1;
        }
    }

    /// One slicing + framing attempt over a window starting at the preamble.
    fn try_window(
        &self,
        window: &[u16],
        cache: &mut IcaoCache,
        now: u64,
        phase_corrected: bool,
    ) -> Attempt {
        let sliced = slice_bits(&window[PREAMBLE_SAMPLES..]);

        if !passes_noise_filter(&window[PREAMBLE_SAMPLES..], sliced.byte_len) {
            return Attempt::Noise;
        }

        if sliced.errors > 0 && !(self.aggressive && sliced.errors < MAX_AGGRESSIVE_ERRORS) {
            debug!(errors = sliced.errors, "demodulated with too many errors");
            return Attempt::Rejected;
        }
        if sliced.errors == 0 {
            Stats::bump(&self.stats.demodulated);
        }

        let mut mm = message::decode(
            &sliced.frame[..sliced.byte_len],
            self.fix_errors,
            self.aggressive,
        );
        mm.phase_corrected = phase_corrected;

        if !mm.crc_ok && message::is_address_parity(mm.df) && cache.recent(mm.icao, now) {
            mm.crc_ok = true;
        }

        if mm.crc_ok {
            Stats::bump(&self.stats.good_crc);
        } else {
            Stats::bump(&self.stats.bad_crc);
            debug!(df = mm.df, crc = mm.crc, "bad CRC");
        }
        match mm.repair {
            Some(CrcRepair::Single(_)) => {
                Stats::bump(&self.stats.bad_crc);
                Stats::bump(&self.stats.fixed_single_bit);
            }
            Some(CrcRepair::Double(_, _)) => {
                Stats::bump(&self.stats.bad_crc);
                Stats::bump(&self.stats.fixed_two_bits);
            }
            None => {}
        }

        // A self-checking frame with an untouched CRC vouches for its
        // address.
        if mm.crc_ok && (mm.df == 11 || mm.df == 17) && mm.repair.is_none() {
            cache.add(mm.icao, now);
        }

        if mm.crc_ok {
            Attempt::Accepted(mm)
        } else if !self.check_crc {
            // CRC checking disabled: emit, but never advance past the frame.
            Attempt::Accepted(mm)
        } else {
            Attempt::Rejected
        }
    }

    fn finish(&self, mm: ModesMessage, emit: &mut dyn FnMut(ModesMessage)) {
        Stats::bump(&self.stats.messages_emitted);
        emit(mm);
    }
}

enum Attempt {
    Accepted(ModesMessage),
    Rejected,
    Noise,
}

/// The preamble is two pulse pairs: spikes at 0, 2, 7 and 9 us-halves with
/// quiet between them and a quiet guard before the data.
fn preamble_at(m: &[u16], j: usize) -> bool {
    if !(m[j] > m[j + 1]
        && m[j + 1] < m[j + 2]
        && m[j + 2] > m[j + 3]
        && m[j + 3] < m[j]
        && m[j + 4] < m[j]
        && m[j + 5] < m[j]
        && m[j + 6] < m[j]
        && m[j + 7] > m[j + 8]
        && m[j + 8] < m[j + 9]
        && m[j + 9] > m[j + 6])
    {
        return false;
    }

    let high = ((m[j] as u32 + m[j + 2] as u32 + m[j + 7] as u32 + m[j + 9] as u32) / 6) as u16;

    if m[j + 4] >= high || m[j + 5] >= high {
        return false;
    }
    if m[j + 11] >= high || m[j + 12] >= high || m[j + 13] >= high || m[j + 14] >= high {
        return false;
    }

    true
}

/// Slice 112 pulse-position bits starting at the first data sample. Each bit
/// is a (high, low) or (low, high) sample pair; ambiguous pairs inherit the
/// previous bit, dead-even pairs count as errors in the first half.
fn slice_bits(data: &[u16]) -> Sliced {
    let mut bits = [0u8; LONG_MSG_BITS];
    let mut errors = 0u32;

    for b in 0..LONG_MSG_BITS {
        let low = data[b * 2];
        let high = data[b * 2 + 1];
        let delta = low.abs_diff(high);

        if b > 0 && delta < INHERIT_DELTA {
            bits[b] = bits[b - 1];
        } else if low == high {
            bits[b] = 0;
            if b < SHORT_MSG_BITS {
                errors += 1;
            }
        } else {
            bits[b] = (low > high) as u8;
        }
    }

    let mut frame = [0u8; LONG_MSG_BYTES];
    for (i, byte) in frame.iter_mut().enumerate() {
        *byte = bits[i * 8..(i + 1) * 8]
            .iter()
            .fold(0, |acc, &b| (acc << 1) | b);
    }

    let byte_len = message::bit_len(frame[0] >> 3) / 8;

    Sliced {
        frame,
        byte_len,
        errors,
    }
}

/// Mean |low-high| over the frame's bits must clear the noise floor,
/// otherwise the "preamble" was a coincidence in static.
fn passes_noise_filter(data: &[u16], byte_len: usize) -> bool {
    let mut delta = 0u32;
    for b in 0..byte_len * 8 {
        delta += data[b * 2].abs_diff(data[b * 2 + 1]) as u32;
    }
    delta / (byte_len as u32 * 8) >= NOISE_FLOOR_DELTA
}

#[cfg(test)]
mod tests {
    use super::*;

    const HIGH: u16 = 6000;

    /// Magnitudes an ideal transmitter would produce for `frame`, with the
    /// preamble starting at sample `at`.
    fn synthesize(frame: &[u8], at: usize, total: usize) -> Vec<u16> {
        let mut m = vec![0u16; total];
        for &p in &[0usize, 2, 7, 9] {
            m[at + p] = HIGH;
        }
        for b in 0..frame.len() * 8 {
            let bit = (frame[b / 8] >> (7 - b % 8)) & 1;
            let idx = at + PREAMBLE_SAMPLES + b * 2;
            if bit == 1 {
                m[idx] = HIGH;
            } else {
                m[idx + 1] = HIGH;
            }
        }
        m
    }

    fn demod(aggressive: bool) -> (Demodulator, Arc<Stats>) {
        let stats = Arc::new(Stats::default());
        (
            Demodulator::new(true, aggressive, true, Arc::clone(&stats)),
            stats,
        )
    }

    const KLM_FRAME: [u8; 14] = [
        0x8D, 0x48, 0x40, 0xD6, 0x20, 0x2C, 0xC3, 0x71, 0xC3, 0x2C, 0xE0, 0x57, 0x60, 0x98,
    ];

    #[test]
    fn synthetic_frame_decodes_exactly() {
        let m = synthesize(&KLM_FRAME, 5, 300);
        let (demod, stats) = demod(false);
        let mut cache = IcaoCache::new(60);

        let mut out = Vec::new();
        demod.scan(&m, &mut cache, 1000, &mut |mm| out.push(mm));

        assert_eq!(out.len(), 1);
        let mm = &out[0];
        assert!(mm.crc_ok);
        assert_eq!(mm.df, 17);
        assert_eq!(mm.icao, 0x4840D6);
        assert_eq!(&mm.raw, &KLM_FRAME);
        assert!(!mm.phase_corrected);

        use std::sync::atomic::Ordering::Relaxed;
        assert_eq!(stats.valid_preambles.load(Relaxed), 1);
        assert_eq!(stats.good_crc.load(Relaxed), 1);
        assert_eq!(stats.demodulated.load(Relaxed), 1);
    }

    #[test]
    fn good_frame_seeds_the_cache() {
        let m = synthesize(&KLM_FRAME, 0, 280);
        let (demod, _) = demod(false);
        let mut cache = IcaoCache::new(60);

        let mut out = Vec::new();
        demod.scan(&m, &mut cache, 1000, &mut |mm| out.push(mm));

        assert_eq!(out.len(), 1);
        assert!(cache.recent(0x4840D6, 1000));
    }

    #[test]
    fn address_parity_frame_needs_cache_confirmation() {
        // DF4 destined for 0xABCDEF.
        let mut frame = [0x20u8, 0x00, 0x0F, 0x1F, 0x00, 0x00, 0x00];
        let crc = crate::crc::checksum(&frame, 56);
        let ap = crc ^ 0xABCDEF;
        frame[4] = (ap >> 16) as u8;
        frame[5] = (ap >> 8) as u8;
        frame[6] = ap as u8;

        let m = synthesize(&frame, 3, 300);
        let (demod, _) = demod(false);

        // Unknown address: nothing comes out.
        let mut cache = IcaoCache::new(60);
        let mut out = Vec::new();
        demod.scan(&m, &mut cache, 1000, &mut |mm| out.push(mm));
        assert!(out.is_empty());

        // Seeded cache: confirmed, crc_ok set.
        cache.add(0xABCDEF, 999);
        demod.scan(&m, &mut cache, 1000, &mut |mm| out.push(mm));
        assert_eq!(out.len(), 1);
        assert!(out[0].crc_ok);
        assert_eq!(out[0].icao, 0xABCDEF);
    }

    #[test]
    fn pure_noise_yields_nothing() {
        // Repetitive low-level pattern with no preamble shape.
        let m: Vec<u16> = (0..2000).map(|i| 100 + (i % 7) as u16 * 30).collect();
        let (demod, stats) = demod(false);
        let mut cache = IcaoCache::new(60);

        let mut out = Vec::new();
        demod.scan(&m, &mut cache, 1000, &mut |mm| out.push(mm));
        assert!(out.is_empty());

        use std::sync::atomic::Ordering::Relaxed;
        assert_eq!(stats.messages_emitted.load(Relaxed), 0);
    }

    #[test]
    fn faint_window_is_noise_filtered() {
        // Preamble shape present but data deltas far below the floor.
        let mut m = vec![0u16; 300];
        for &p in &[0usize, 2, 7, 9] {
            m[10 + p] = 2000;
        }
        for b in 0..LONG_MSG_BITS {
            m[10 + PREAMBLE_SAMPLES + b * 2] = 300;
        }
        let (demod, stats) = demod(false);
        let mut cache = IcaoCache::new(60);

        let mut out = Vec::new();
        demod.scan(&m, &mut cache, 1000, &mut |mm| out.push(mm));
        assert!(out.is_empty());

        use std::sync::atomic::Ordering::Relaxed;
        assert!(stats.noise_filtered.load(Relaxed) >= 1);
    }

    #[test]
    fn marginal_deltas_stay_below_the_noise_floor() {
        // Per-bit delta of 2000: clean bits, but under the 2550 floor.
        let mut m = vec![0u16; 300];
        for &p in &[0usize, 2, 7, 9] {
            m[10 + p] = 3000;
        }
        for b in 0..LONG_MSG_BITS {
            m[10 + PREAMBLE_SAMPLES + b * 2] = 2000;
        }
        let (demod, stats) = demod(false);
        let mut cache = IcaoCache::new(60);

        let mut out = Vec::new();
        demod.scan(&m, &mut cache, 1000, &mut |mm| out.push(mm));
        assert!(out.is_empty());

        use std::sync::atomic::Ordering::Relaxed;
        assert!(stats.noise_filtered.load(Relaxed) >= 1);
    }

    #[test]
    fn two_messages_in_one_block() {
        let mut m = synthesize(&KLM_FRAME, 5, 600);
        let velocity: [u8; 14] = [
            0x8D, 0x4B, 0x96, 0x96, 0x99, 0x15, 0x56, 0x00, 0xE8, 0x74, 0x06, 0xF5, 0xB6, 0x9F,
        ];
        let second = synthesize(&velocity, 300, 600);
        for (dst, src) in m.iter_mut().zip(second.iter()).skip(300) {
            *dst = *src;
        }

        let (demod, _) = demod(false);
        let mut cache = IcaoCache::new(60);
        let mut out = Vec::new();
        demod.scan(&m, &mut cache, 1000, &mut |mm| out.push(mm));

        assert_eq!(out.len(), 2);
        // Ascending sample order.
        assert_eq!(out[0].icao, 0x4840D6);
        assert_eq!(out[1].icao, 0x4B9696);
    }
}
