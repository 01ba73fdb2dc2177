//! Compact Position Reporting
//!
//! Airborne positions arrive as 17-bit latitude/longitude halves in two
//! flavours (even/odd zone sizing). One half of each flavour, received close
//! together in time, pins the aircraft to a single world-wide cell.

/// One CPR half as carried in an airborne-position squitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CprHalf {
    /// 17-bit encoded latitude.
    pub lat: u32,
    /// 17-bit encoded longitude.
    pub lon: u32,
    /// Receive timestamp, milliseconds.
    pub at_ms: u64,
}

const DLAT_EVEN: f64 = 360.0 / 60.0;
const DLAT_ODD: f64 = 360.0 / 59.0;

/// 2^17, the span of one encoded half.
const CPR_SPAN: f64 = 131_072.0;

/// Latitude bands of the NL function, from 1090-WP-9-14. `nl` is 59 below
/// the first boundary and drops by one per band; past the last it is 1.
const NL_BOUNDARIES: [f64; 58] = [
    10.47047130, 14.82817437, 18.18626357, 21.02939493, 23.54504487, 25.82924707,
    27.93898710, 29.91135686, 31.77209708, 33.53993436, 35.22899598, 36.85025108,
    38.41241892, 39.92256684, 41.38651832, 42.80914012, 44.19454951, 45.54626723,
    46.86733252, 48.16039128, 49.42776439, 50.67150166, 51.89342469, 53.09516153,
    54.27817472, 55.44378444, 56.59318756, 57.72747354, 58.84763776, 59.95459277,
    61.04917774, 62.13216659, 63.20427479, 64.26616523, 65.31845310, 66.36171008,
    67.39646774, 68.42322022, 69.44242631, 70.45451075, 71.45986473, 72.45884545,
    73.45177442, 74.43893416, 75.42056257, 76.39684391, 77.36789461, 78.33374083,
    79.29428225, 80.24923213, 81.19801349, 82.13956981, 83.07199445, 83.99173563,
    84.89166191, 85.75541621, 86.53536998, 87.00000000,
];

/// Number of longitude zones at a latitude. Symmetric about the equator.
fn nl(lat: f64) -> i32 {
    let lat = lat.abs();
    for (i, bound) in NL_BOUNDARIES.iter().enumerate() {
        if lat < *bound {
            return 59 - i as i32;
        }
    }
    1
}

/// Non-negative remainder.
fn modpos(a: i32, b: i32) -> i32 {
    let r = a % b;
    if r < 0 { r + b } else { r }
}

fn zones(lat: f64, odd: bool) -> i32 {
    (nl(lat) - odd as i32).max(1)
}

/// Resolve a globally-unambiguous position from one even and one odd half.
///
/// The caller decides which half is newer (the position is computed in that
/// half's zone grid). Returns `None` when the two halves straddle an NL
/// boundary and do not describe a single cell.
pub fn resolve(even: &CprHalf, odd: &CprHalf) -> Option<(f64, f64)> {
    let lat_even = even.lat as f64;
    let lat_odd = odd.lat as f64;
    let lon_even = even.lon as f64;
    let lon_odd = odd.lon as f64;

    // Latitude zone index.
    let j = ((59.0 * lat_even - 60.0 * lat_odd) / CPR_SPAN + 0.5).floor() as i32;

    let mut rlat_even = DLAT_EVEN * (modpos(j, 60) as f64 + lat_even / CPR_SPAN);
    let mut rlat_odd = DLAT_ODD * (modpos(j, 59) as f64 + lat_odd / CPR_SPAN);
    if rlat_even >= 270.0 {
        rlat_even -= 360.0;
    }
    if rlat_odd >= 270.0 {
        rlat_odd -= 360.0;
    }

    // Both halves must agree on the longitude zone count.
    if nl(rlat_even) != nl(rlat_odd) {
        return None;
    }

    let newest_is_odd = odd.at_ms > even.at_ms;
    let (rlat, lon_new, is_odd) = if newest_is_odd {
        (rlat_odd, lon_odd, true)
    } else {
        (rlat_even, lon_even, false)
    };

    let ni = zones(rlat, is_odd);
    let m = ((lon_even * (nl(rlat) - 1) as f64 - lon_odd * nl(rlat) as f64) / CPR_SPAN + 0.5)
        .floor() as i32;

    let mut lon = (360.0 / ni as f64) * (modpos(m, ni) as f64 + lon_new / CPR_SPAN);
    if lon > 180.0 {
        lon -= 360.0;
    }

    Some((rlat, lon))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn nl_bands() {
        assert_eq!(nl(0.0), 59);
        assert_eq!(nl(45.0), 42);
        assert_eq!(nl(-45.0), 42);
        assert_eq!(nl(86.9), 2);
        assert_eq!(nl(89.9), 1);
    }

    #[test]
    fn modpos_is_non_negative() {
        assert_eq!(modpos(5, 3), 2);
        assert_eq!(modpos(-1, 3), 2);
        assert_eq!(modpos(-28, 47), 19);
    }

    #[test]
    fn resolve_reference_pair() {
        // 1090-WP reference vector; even half is the newer one.
        let odd = CprHalf { lat: 74_158, lon: 50_194, at_ms: 0 };
        let even = CprHalf { lat: 93_000, lon: 51_372, at_ms: 8_000 };

        let (lat, lon) = resolve(&even, &odd).unwrap();
        assert!(close(lat, 52.257_202_148_437_5));
        assert!(close(lon, 3.919_372_558_593_75));
    }

    #[test]
    fn resolve_polar_pair() {
        let even = CprHalf { lat: 108_011, lon: 110_088, at_ms: 0 };
        let odd = CprHalf { lat: 75_050, lon: 36_777, at_ms: 100 };

        let (lat, lon) = resolve(&even, &odd).unwrap();
        assert!(close(lat, 88.917_474_261_784_96));
        assert!(close(lon, 101.011_047_363_281_25));
    }

    #[test]
    fn resolve_negative_zone_index() {
        // Southern-hemisphere pair that drives the zone index negative.
        let even = CprHalf { lat: 3_487, lon: 4_958, at_ms: 0 };
        let odd = CprHalf { lat: 16_540, lon: 81_316, at_ms: 100 };

        let (lat, lon) = resolve(&even, &odd).unwrap();
        assert!(close(lat, -35.840_195_478_019_07));
        assert!(close(lon, 150.283_852_435_172_9));
    }

    #[test]
    fn resolve_rejects_zone_mismatch() {
        // Halves whose decoded latitudes straddle the 10.47047 NL boundary
        // (10.464 on the even grid vs 10.483 on the odd grid).
        let even = CprHalf { lat: 97_518, lon: 0, at_ms: 0 };
        let odd = CprHalf { lat: 94_110, lon: 0, at_ms: 100 };
        assert!(resolve(&even, &odd).is_none());
    }

    #[test]
    fn resolved_position_is_in_range() {
        let even = CprHalf { lat: 93_000, lon: 51_372, at_ms: 8_000 };
        let odd = CprHalf { lat: 74_158, lon: 50_194, at_ms: 0 };
        let (lat, lon) = resolve(&even, &odd).unwrap();
        assert!((-90.0..=90.0).contains(&lat));
        assert!((-180.0..180.0).contains(&lon));
    }
}
