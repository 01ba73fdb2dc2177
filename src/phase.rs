//! Out-of-phase retry pass
//!
//! A message sampled between pulse boundaries smears energy into the
//! neighbouring sample. When the first slice of a valid preamble fails, a
//! second attempt runs on a reshaped copy: after each pair read as a 1 the
//! following sample is amplified, after a 0 it is attenuated. The input is
//! never modified, so there is nothing to restore before the scan moves on.

use crate::demod::PREAMBLE_SAMPLES;
use crate::message::LONG_MSG_BITS;

/// Amplification applied after a pair read as 1: `5/4`.
pub const AMPLIFY: (u32, u32) = (5, 4);
/// Attenuation applied after a pair read as 0: `4/5`.
pub const ATTENUATE: (u32, u32) = (4, 5);

/// Return a phase-corrected copy of a message window. `window` starts at the
/// first preamble sample; only samples after the preamble are reshaped.
pub fn corrected(window: &[u16]) -> Vec<u16> {
    let mut out = window.to_vec();

    let end = (PREAMBLE_SAMPLES + LONG_MSG_BITS * 2).min(out.len());
    let mut k = PREAMBLE_SAMPLES;
    while k + 2 < end {
        let (num, den) = if out[k] > out[k + 1] { AMPLIFY } else { ATTENUATE };
        out[k + 2] = ((out[k + 2] as u32 * num / den).min(u16::MAX as u32)) as u16;
        k += 2;
    }
    out
}
