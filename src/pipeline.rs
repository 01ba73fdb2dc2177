//! Pipeline driver
//!
//! Two cooperating threads share a ring of two sample blocks: the sampler
//! owns the blocking source read and fills the back block; the decoder
//! (main thread) spins on the ready flag, swaps the block out under the
//! mutex, and does all CPU work lock-free on its own copy. A carryover tail
//! stitched ahead of each block keeps frames that straddle a block boundary
//! decodable exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::error;

use crate::demod::{Demodulator, FULL_FRAME_SAMPLES};
use crate::icao::IcaoCache;
use crate::magnitude::MagnitudeTable;
use crate::message::ModesMessage;
use crate::source::SampleSource;
use crate::stats::Stats;

/// I/Q bytes retained from the previous block: one sample short of a full
/// frame window, so any frame that was cut off is re-presented whole and any
/// frame already decoded cannot fit a second time.
pub const CARRYOVER_BYTES: usize = (FULL_FRAME_SAMPLES - 1) * 2;

/// Single-producer single-consumer hand-off of sample blocks.
pub struct SampleRing {
    back: Mutex<Vec<u8>>,
    ready: AtomicBool,
    exit: AtomicBool,
}

impl SampleRing {
    pub fn new() -> Self {
        Self {
            back: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
            exit: AtomicBool::new(false),
        }
    }

    /// Sampler side: copy a block in, waiting for the decoder to drain the
    /// previous one first.
    pub fn push(&self, block: &[u8]) {
        while self.ready.load(Ordering::Acquire) {
            if self.exit.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(Duration::from_micros(200));
        }

        {
            let mut back = self.back.lock();
            back.clear();
            back.extend_from_slice(block);
        }
        self.ready.store(true, Ordering::Release);
    }

    /// Decoder side: spin until a block is ready and swap it into `out`.
    /// Returns false once the ring is shut down and drained.
    pub fn pop(&self, out: &mut Vec<u8>) -> bool {
        loop {
            if self.ready.load(Ordering::Acquire) {
                {
                    let mut back = self.back.lock();
                    std::mem::swap(out, &mut *back);
                }
                self.ready.store(false, Ordering::Release);
                return true;
            }
            if self.exit.load(Ordering::Relaxed) {
                return false;
            }
            thread::sleep(Duration::from_micros(200));
        }
    }

    pub fn shutdown(&self) {
        self.exit.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.exit.load(Ordering::Relaxed)
    }

    pub fn exit_flag(&self) -> &AtomicBool {
        &self.exit
    }
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a source's blocking read loop on its own thread, feeding the ring.
pub fn spawn_sampler(
    mut source: Box<dyn SampleSource>,
    ring: Arc<SampleRing>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        if let Err(e) = source.run(ring.exit_flag(), &mut |block| ring.push(block)) {
            error!("sample source failed: {e}");
        }
        ring.shutdown();
    })
}

/// Owns the decoder-thread state: magnitude table, demodulator, address
/// cache, carryover tail and the optional message budget.
pub struct Pipeline {
    mag: MagnitudeTable,
    demod: Demodulator,
    cache: IcaoCache,
    budget: Option<u64>,
    carry: Vec<u8>,
    window: Vec<u8>,
    mags: Vec<u16>,
}

impl Pipeline {
    pub fn new(
        fix_errors: bool,
        aggressive: bool,
        check_crc: bool,
        cache_ttl_secs: u64,
        budget: Option<u64>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            mag: MagnitudeTable::new(),
            demod: Demodulator::new(fix_errors, aggressive, check_crc, stats),
            cache: IcaoCache::new(cache_ttl_secs),
            budget,
            // Silence, so the first block has nothing stitched ahead of it.
            carry: vec![127u8; CARRYOVER_BYTES],
            window: Vec::new(),
            mags: Vec::new(),
        }
    }

    /// Decoder loop. Returns when the ring shuts down or the message budget
    /// is spent (the ring is shut down in that case so the sampler follows).
    pub fn run(&mut self, ring: &SampleRing, tx: &Sender<ModesMessage>) {
        let mut block = Vec::new();
        while ring.pop(&mut block) {
            self.process_block(&block, &mut |mm| {
                let _ = tx.send(mm);
            });

            if self.budget == Some(0) {
                ring.shutdown();
                break;
            }
        }
    }

    /// Convert and scan one block, with the previous block's tail stitched
    /// in front. Messages come out in ascending sample order.
    pub fn process_block(&mut self, block: &[u8], emit: &mut dyn FnMut(ModesMessage)) {
        self.window.clear();
        self.window.extend_from_slice(&self.carry);
        self.window.extend_from_slice(block);

        let tail = self.window.len().saturating_sub(CARRYOVER_BYTES);
        self.carry.clear();
        self.carry.extend_from_slice(&self.window[tail..]);

        self.mag.convert(&self.window, &mut self.mags);

        let budget = &mut self.budget;
        self.demod
            .scan(&self.mags, &mut self.cache, unix_now_secs(), &mut |mm| {
                if mm.crc_ok {
                    if let Some(left) = budget {
                        *left = left.saturating_sub(1);
                    }
                }
                emit(mm);
            });
    }
}

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demod::PREAMBLE_SAMPLES;

    const KLM_FRAME: [u8; 14] = [
        0x8D, 0x48, 0x40, 0xD6, 0x20, 0x2C, 0xC3, 0x71, 0xC3, 0x2C, 0xE0, 0x57, 0x60, 0x98,
    ];

    /// I/Q byte stream an ideal transmitter would produce: high pulses as
    /// (255, 127) pairs, silence as (127, 127).
    fn synthesize_iq(frame: &[u8], at_pair: usize, total_pairs: usize) -> Vec<u8> {
        let mut pairs = vec![false; total_pairs];
        for &p in &[0usize, 2, 7, 9] {
            pairs[at_pair + p] = true;
        }
        for b in 0..frame.len() * 8 {
            let bit = (frame[b / 8] >> (7 - b % 8)) & 1;
            let idx = at_pair + PREAMBLE_SAMPLES + b * 2;
            pairs[idx + (bit == 0) as usize] = true;
        }

        let mut iq = Vec::with_capacity(total_pairs * 2);
        for high in pairs {
            iq.push(if high { 255 } else { 127 });
            iq.push(127);
        }
        iq
    }

    fn pipeline(budget: Option<u64>) -> Pipeline {
        Pipeline::new(true, false, true, 60, budget, Arc::new(Stats::default()))
    }

    #[test]
    fn single_block_decodes_frame() {
        let iq = synthesize_iq(&KLM_FRAME, 300, 840);
        let mut p = pipeline(None);

        let mut out = Vec::new();
        p.process_block(&iq, &mut |mm| out.push(mm));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].icao, 0x4840D6);
    }

    #[test]
    fn frame_straddling_blocks_decodes_exactly_once() {
        let iq = synthesize_iq(&KLM_FRAME, 300, 840);
        // Split mid-frame: the frame spans pairs 300..540.
        let (first, second) = iq.split_at(400 * 2);

        let mut p = pipeline(None);
        let mut out = Vec::new();
        p.process_block(first, &mut |mm| out.push(mm));
        assert!(out.is_empty());
        p.process_block(second, &mut |mm| out.push(mm));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].icao, 0x4840D6);

        // Nothing left over in later silence.
        p.process_block(&vec![127u8; 2000], &mut |mm| out.push(mm));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn frame_already_decoded_is_not_replayed_from_carry() {
        // Frame close to the block end, but fully inside it.
        let iq = synthesize_iq(&KLM_FRAME, 800 - 240, 800);
        let mut p = pipeline(None);

        let mut out = Vec::new();
        p.process_block(&iq, &mut |mm| out.push(mm));
        assert_eq!(out.len(), 1);
        p.process_block(&vec![127u8; 2000], &mut |mm| out.push(mm));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn message_budget_stops_the_run() {
        let iq = synthesize_iq(&KLM_FRAME, 100, 600);
        let ring = Arc::new(SampleRing::new());
        let (tx, rx) = crossbeam_channel::unbounded();

        let feeder = {
            let ring = Arc::clone(&ring);
            let iq = iq.clone();
            thread::spawn(move || {
                // Keep feeding until the budget shuts the ring down.
                for _ in 0..50 {
                    if ring.is_shutdown() {
                        break;
                    }
                    ring.push(&iq);
                }
            })
        };

        let mut p = pipeline(Some(1));
        p.run(&ring, &tx);
        assert!(ring.is_shutdown());
        feeder.join().unwrap();

        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn ring_hands_blocks_across_threads() {
        let ring = Arc::new(SampleRing::new());
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                ring.push(&[1, 2, 3, 4]);
                ring.push(&[5, 6]);
                ring.shutdown();
            })
        };

        let mut block = Vec::new();
        let mut seen = Vec::new();
        while ring.pop(&mut block) {
            seen.push(block.clone());
        }
        producer.join().unwrap();

        assert_eq!(seen, vec![vec![1, 2, 3, 4], vec![5, 6]]);
    }
}
