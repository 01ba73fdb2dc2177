//! Mode S message framing and field decoding
//!
//! A raw frame is at most 14 bytes; the top five bits of byte 0 give the
//! Downlink Format, which fixes the frame length and the payload shape. The
//! decoded payload is a union keyed by DF, with the DF17 extended squitter
//! nested one level deeper by ME type.

use std::fmt;

use crate::crc::{self, CrcRepair};

pub const LONG_MSG_BITS: usize = 112;
pub const SHORT_MSG_BITS: usize = 56;
pub const LONG_MSG_BYTES: usize = 14;
pub const SHORT_MSG_BYTES: usize = 7;

/// AIS six-bit character set used for callsigns.
const AIS_CHARSET: &[u8; 64] =
    b"?ABCDEFGHIJKLMNOPQRSTUVWXYZ????? ???????????????0123456789??????";

/// Frame length in bits implied by the Downlink Format. DF24 (Comm-D) is a
/// long frame per 1090-WP even though it shares the address-parity scheme of
/// the short surveillance replies.
pub fn bit_len(df: u8) -> usize {
    match df {
        16 | 17 | 19 | 20 | 21 | 24 => LONG_MSG_BITS,
        _ => SHORT_MSG_BITS,
    }
}

/// Formats whose ICAO address arrives XORed into the parity field rather
/// than in the frame body.
pub fn is_address_parity(df: u8) -> bool {
    matches!(df, 0 | 4 | 5 | 16 | 20 | 21 | 24)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltitudeUnit {
    Feet,
    Meters,
}

/// DF17 extended-squitter payload, keyed by ME type.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtendedSquitter {
    /// ME 1..4: callsign and emitter category.
    Identification { callsign: String, category: u8 },
    /// ME 9..18: one CPR half plus barometric altitude.
    AirbornePosition {
        odd: bool,
        utc: bool,
        altitude: i32,
        lat_cpr: u32,
        lon_cpr: u32,
    },
    /// ME 19 subtype 1/2: ground-referenced velocity vector.
    AirborneVelocity {
        ew_west: bool,
        ew_vel: u16,
        ns_south: bool,
        ns_vel: u16,
        vr_gnss: bool,
        vr_down: bool,
        vr: u16,
        /// Magnitude of the horizontal vector, knots.
        speed: u16,
        /// Track over ground, degrees in [0, 360); absent for a zero vector.
        heading: Option<f64>,
    },
    /// ME 19 subtype 3/4: airspeed and magnetic heading.
    MagneticHeading { valid: bool, heading: f64 },
    /// ME 28 subtype 1: emergency/priority status.
    AircraftStatus { emergency: u8 },
    /// ME 31: operational status, carried for the record.
    OperationalStatus { subtype: u8 },
    Unsupported { me_type: u8, me_sub: u8 },
}

/// Decoded payload, keyed by Downlink Format.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    /// DF0/DF16: air-air surveillance altitude.
    AirAirSurveillance { altitude: i32, unit: AltitudeUnit },
    /// DF4/DF20: surveillance or Comm-B altitude reply.
    AltitudeReply {
        fs: u8,
        dr: u8,
        um: u8,
        altitude: i32,
        unit: AltitudeUnit,
    },
    /// DF5/DF21: surveillance or Comm-B identity reply.
    IdentityReply { fs: u8, dr: u8, um: u8, identity: u16 },
    /// DF11: all-call reply.
    AllCallReply { capability: u8 },
    /// DF17: ADS-B extended squitter.
    ExtendedSquitter {
        capability: u8,
        me_type: u8,
        me_sub: u8,
        me: ExtendedSquitter,
    },
    Unsupported,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModesMessage {
    pub raw: [u8; LONG_MSG_BYTES],
    pub bits: usize,
    pub df: u8,
    /// Parity field as transmitted.
    pub crc: u32,
    pub crc_ok: bool,
    pub repair: Option<CrcRepair>,
    /// 24-bit address: from the frame body for DF11/17/18, otherwise the
    /// address-parity candidate pending cache confirmation.
    pub icao: u32,
    pub phase_corrected: bool,
    pub payload: MessagePayload,
}

impl ModesMessage {
    pub fn byte_len(&self) -> usize {
        self.bits / 8
    }

    /// `*<hex>;` line for the raw output sink.
    pub fn to_raw_line(&self) -> String {
        let mut s = String::with_capacity(self.byte_len() * 2 + 2);
        s.push('*');
        for b in &self.raw[..self.byte_len()] {
            use fmt::Write;
            let _ = write!(s, "{:02X}", b);
        }
        s.push(';');
        s
    }

    /// SBS/BaseStation record for this message, with the roster's resolved
    /// position when one exists. Formats outside the SBS grid yield `None`.
    pub fn to_sbs_line(&self, position: Option<(f64, f64)>) -> Option<String> {
        let icao = format!("{:06X}", self.icao);

        match &self.payload {
            MessagePayload::AirAirSurveillance { altitude, .. } if self.df == 0 => Some(format!(
                "MSG,5,,,{},,,,,,,,{},,,,,,,,,,",
                icao, altitude
            )),
            MessagePayload::AltitudeReply { fs, altitude, .. } if self.df == 4 => {
                let (alert, emergency, spi, ground) = status_flags(*fs, 0);
                Some(format!(
                    "MSG,5,,,{},,,,,,,{},,,,,,,,{},{},{},{}",
                    icao, altitude, alert, emergency, spi, ground
                ))
            }
            MessagePayload::IdentityReply { fs, identity, .. } => {
                let (alert, emergency, spi, ground) = status_flags(*fs, *identity);
                Some(format!(
                    "MSG,6,,,{},,,,,,,,,,,,,,{},{},{},{},{}",
                    icao, identity, alert, emergency, spi, ground
                ))
            }
            MessagePayload::AllCallReply { .. } => {
                Some(format!("MSG,8,,,{},,,,,,,,,,,,,,,,,", icao))
            }
            MessagePayload::ExtendedSquitter { me, .. } => match me {
                ExtendedSquitter::Identification { callsign, .. } => Some(format!(
                    "MSG,1,,,{},,,,,,,{},,,,,,,,0,0,0,0",
                    icao, callsign
                )),
                ExtendedSquitter::AirbornePosition { altitude, .. } => match position {
                    Some((lat, lon)) => Some(format!(
                        "MSG,3,,,{},,,,,,,{},,{:.5},{:.5},,,0,0,0,0",
                        icao, altitude, lat, lon
                    )),
                    None => Some(format!(
                        "MSG,3,,,{},,,,,,,,{},,,,,,,,0,0,0,0",
                        icao, altitude
                    )),
                },
                ExtendedSquitter::AirborneVelocity {
                    vr_down,
                    vr,
                    speed,
                    heading,
                    ..
                } => {
                    let rate = if *vr_down { -1 } else { 1 } * (*vr as i32 - 1) * 64;
                    Some(format!(
                        "MSG,4,,,{},,,,,,,,{},{},,,,{},,0,0,0,0",
                        icao,
                        speed,
                        heading.unwrap_or(0.0) as i32,
                        rate
                    ))
                }
                _ => None,
            },
            _ => None,
        }
    }
}

/// SBS identity flags: `-1` asserted, `0` clear.
fn status_flags(fs: u8, identity: u16) -> (i32, i32, i32, i32) {
    let emergency = if matches!(identity, 7500 | 7600 | 7700) { -1 } else { 0 };
    let ground = if fs == 1 || fs == 3 { -1 } else { 0 };
    let alert = if matches!(fs, 2 | 3 | 4) { -1 } else { 0 };
    let spi = if fs == 4 || fs == 5 { -1 } else { 0 };
    (alert, emergency, spi, ground)
}

/// Decode a raw frame. CRC is verified (and repaired when allowed) for the
/// self-checking formats; address-parity formats come out with `crc_ok`
/// false and the recovered candidate address, to be confirmed against the
/// recently-seen cache by the caller.
pub fn decode(frame: &[u8], fix_errors: bool, aggressive: bool) -> ModesMessage {
    let mut raw = [0u8; LONG_MSG_BYTES];
    let len = frame.len().min(LONG_MSG_BYTES);
    raw[..len].copy_from_slice(&frame[..len]);

    let df = raw[0] >> 3;
    let bits = bit_len(df);

    let mut crc_ok = false;
    let mut repair = None;
    let icao;

    if is_address_parity(df) {
        icao = crc::recover_address(&raw, bits);
    } else {
        let computed = crc::checksum(&raw, bits);
        crc_ok = crc::stored_crc(&raw, bits) == computed;

        if !crc_ok && fix_errors && (df == 11 || df == 17) {
            if let Some(bit) = crc::repair_single_bit(&mut raw, bits) {
                repair = Some(CrcRepair::Single(bit));
                crc_ok = true;
            } else if aggressive && df == 17 {
                if let Some((lo, hi)) = crc::repair_two_bits(&mut raw, bits) {
                    repair = Some(CrcRepair::Double(lo, hi));
                    crc_ok = true;
                }
            }
        }

        icao = ((raw[1] as u32) << 16) | ((raw[2] as u32) << 8) | raw[3] as u32;
    }

    let payload = decode_payload(&raw, df);

    ModesMessage {
        raw,
        bits,
        df,
        crc: crc::stored_crc(&raw, bits),
        crc_ok,
        repair,
        icao,
        phase_corrected: false,
        payload,
    }
}

fn decode_payload(raw: &[u8; LONG_MSG_BYTES], df: u8) -> MessagePayload {
    match df {
        0 | 16 => {
            let (altitude, unit) = decode_ac13(raw);
            MessagePayload::AirAirSurveillance { altitude, unit }
        }
        4 | 20 => {
            let (altitude, unit) = decode_ac13(raw);
            MessagePayload::AltitudeReply {
                fs: raw[0] & 0x07,
                dr: (raw[1] >> 3) & 0x1F,
                um: ((raw[1] & 0x07) << 3) | (raw[2] >> 5),
                altitude,
                unit,
            }
        }
        5 | 21 => MessagePayload::IdentityReply {
            fs: raw[0] & 0x07,
            dr: (raw[1] >> 3) & 0x1F,
            um: ((raw[1] & 0x07) << 3) | (raw[2] >> 5),
            identity: decode_identity(raw),
        },
        11 => MessagePayload::AllCallReply {
            capability: raw[0] & 0x07,
        },
        17 => {
            let me_type = raw[4] >> 3;
            let me_sub = raw[4] & 0x07;
            MessagePayload::ExtendedSquitter {
                capability: raw[0] & 0x07,
                me_type,
                me_sub,
                me: decode_extended_squitter(raw, me_type, me_sub),
            }
        }
        _ => MessagePayload::Unsupported,
    }
}

fn decode_extended_squitter(raw: &[u8; LONG_MSG_BYTES], me_type: u8, me_sub: u8) -> ExtendedSquitter {
    match me_type {
        1..=4 => {
            let idx = [
                (raw[5] >> 2) as usize,
                (((raw[5] & 0x03) << 4) | (raw[6] >> 4)) as usize,
                (((raw[6] & 0x0F) << 2) | (raw[7] >> 6)) as usize,
                (raw[7] & 0x3F) as usize,
                (raw[8] >> 2) as usize,
                (((raw[8] & 0x03) << 4) | (raw[9] >> 4)) as usize,
                (((raw[9] & 0x0F) << 2) | (raw[10] >> 6)) as usize,
                (raw[10] & 0x3F) as usize,
            ];
            let callsign: String = idx
                .iter()
                .map(|&i| AIS_CHARSET[i] as char)
                .collect::<String>()
                .trim_end()
                .to_string();
            ExtendedSquitter::Identification {
                callsign,
                category: me_type - 1,
            }
        }
        9..=18 => ExtendedSquitter::AirbornePosition {
            odd: raw[6] & 0x04 != 0,
            utc: raw[6] & 0x08 != 0,
            altitude: decode_ac12(raw),
            lat_cpr: (((raw[6] & 0x03) as u32) << 15)
                | ((raw[7] as u32) << 7)
                | ((raw[8] >> 1) as u32),
            lon_cpr: (((raw[8] & 0x01) as u32) << 16)
                | ((raw[9] as u32) << 8)
                | raw[10] as u32,
        },
        19 if me_sub == 1 || me_sub == 2 => {
            let ew_west = raw[5] & 0x04 != 0;
            let ew_vel = (((raw[5] & 0x03) as u16) << 8) | raw[6] as u16;
            let ns_south = raw[7] & 0x80 != 0;
            let ns_vel = (((raw[7] & 0x7F) as u16) << 3) | ((raw[8] >> 5) as u16);

            let ew = ew_vel as f64;
            let ns = ns_vel as f64;
            let speed = ew.hypot(ns).round() as u16;
            let heading = (speed > 0).then(|| {
                let ew = if ew_west { -ew } else { ew };
                let ns = if ns_south { -ns } else { ns };
                let mut h = ew.atan2(ns).to_degrees();
                if h < 0.0 {
                    h += 360.0;
                }
                h
            });

            ExtendedSquitter::AirborneVelocity {
                ew_west,
                ew_vel,
                ns_south,
                ns_vel,
                vr_gnss: raw[8] & 0x10 == 0,
                vr_down: raw[8] & 0x08 != 0,
                vr: (((raw[8] & 0x07) as u16) << 6) | ((raw[9] >> 2) as u16),
                speed,
                heading,
            }
        }
        19 if me_sub == 3 || me_sub == 4 => ExtendedSquitter::MagneticHeading {
            valid: raw[5] & 0x04 != 0,
            heading: (360.0 / 128.0)
                * ((((raw[5] & 0x03) as u16) << 5) | ((raw[6] >> 3) as u16)) as f64,
        },
        28 if me_sub == 1 => ExtendedSquitter::AircraftStatus {
            emergency: raw[5] >> 5,
        },
        31 => ExtendedSquitter::OperationalStatus { subtype: me_sub },
        _ => ExtendedSquitter::Unsupported { me_type, me_sub },
    }
}

/// 13-bit altitude field of DF0/4/16/20. The M bit selects the unit, the Q
/// bit the 25 ft resolution encoding; without Q the field is Gillham coded.
fn decode_ac13(raw: &[u8]) -> (i32, AltitudeUnit) {
    let m_bit = raw[3] & 0x40 != 0;
    let q_bit = raw[3] & 0x10 != 0;

    if m_bit {
        let n = (((raw[2] & 0x1F) as i32) << 7)
            | (((raw[3] & 0x80) >> 1) as i32)
            | ((raw[3] & 0x20) as i32)
            | ((raw[3] & 0x0F) as i32);
        return (n * 25, AltitudeUnit::Meters);
    }

    if q_bit {
        let n = (((raw[2] & 0x1F) as i32) << 6)
            | (((raw[3] & 0x80) >> 2) as i32)
            | (((raw[3] & 0x20) >> 1) as i32)
            | ((raw[3] & 0x0F) as i32);
        return (n * 25 - 1000, AltitudeUnit::Feet);
    }

    let c1 = (raw[2] >> 4) & 1;
    let a1 = (raw[2] >> 3) & 1;
    let c2 = (raw[2] >> 2) & 1;
    let a2 = (raw[2] >> 1) & 1;
    let c4 = raw[2] & 1;
    let a4 = (raw[3] >> 7) & 1;
    let b1 = (raw[3] >> 5) & 1;
    let d2 = (raw[3] >> 3) & 1;
    let b2 = (raw[3] >> 2) & 1;
    let d4 = (raw[3] >> 1) & 1;
    let b4 = raw[3] & 1;

    let code = gillham_code(d4, d2, b4, b2, b1, a4, a2, a1, c4, c2, c1);
    (decode_gillham(code).unwrap_or(0), AltitudeUnit::Feet)
}

/// 12-bit altitude field of DF17 airborne position.
fn decode_ac12(raw: &[u8]) -> i32 {
    let q_bit = raw[5] & 0x01 != 0;

    if q_bit {
        let n = (((raw[5] >> 1) as i32) << 4) | (((raw[6] & 0xF0) >> 4) as i32);
        return n * 25 - 1000;
    }

    let c1 = (raw[5] >> 1) & 1;
    let a1 = (raw[5] >> 2) & 1;
    let c2 = (raw[5] >> 3) & 1;
    let a2 = (raw[5] >> 4) & 1;
    let c4 = (raw[5] >> 5) & 1;
    let a4 = (raw[5] >> 6) & 1;
    let b1 = (raw[5] >> 7) & 1;
    let b2 = (raw[6] >> 4) & 1;
    let d2 = (raw[6] >> 5) & 1;
    let b4 = (raw[6] >> 6) & 1;
    let d4 = (raw[6] >> 7) & 1;

    let code = gillham_code(d4, d2, b4, b2, b1, a4, a2, a1, c4, c2, c1);
    decode_gillham(code).unwrap_or(0)
}

#[allow(clippy::too_many_arguments)]
fn gillham_code(d4: u8, d2: u8, b4: u8, b2: u8, b1: u8, a4: u8, a2: u8, a1: u8, c4: u8, c2: u8, c1: u8) -> u16 {
    ((d4 as u16) << 10)
        | ((d2 as u16) << 9)
        | ((b4 as u16) << 8)
        | ((b2 as u16) << 7)
        | ((b1 as u16) << 6)
        | ((a4 as u16) << 5)
        | ((a2 as u16) << 4)
        | ((a1 as u16) << 3)
        | ((c4 as u16) << 2)
        | ((c2 as u16) << 1)
        | c1 as u16
}

/// Gray-coded Mode C altitude: D/B groups carry the 500 ft bands, C/A the
/// 100 ft steps in a reflected pattern. Out-of-range codes yield `None`.
fn decode_gillham(code: u16) -> Option<i32> {
    if code == 0 {
        return None;
    }

    let bit = |mask: u16| (code & mask != 0) as i32;

    let mut five_hundreds = (bit(0x400) << 5) | (bit(0x200) << 4)
        | (bit(0x100) << 2) | (bit(0x080) << 1) | bit(0x040);
    five_hundreds ^= five_hundreds >> 4;
    five_hundreds ^= five_hundreds >> 2;
    five_hundreds ^= five_hundreds >> 1;

    let mut one_hundreds = (bit(0x004) << 4) | (bit(0x002) << 3)
        | (bit(0x001) << 2) | (bit(0x020) << 1) | bit(0x010);
    one_hundreds ^= one_hundreds >> 4;
    one_hundreds ^= one_hundreds >> 2;
    one_hundreds ^= one_hundreds >> 1;

    let hundreds = if code & 0x008 != 0 {
        4 - (one_hundreds % 5).min(4)
    } else {
        (one_hundreds % 5).min(4)
    };

    let altitude = five_hundreds * 500 + hundreds * 100 - 1300;
    (-1200..=126_700).contains(&altitude).then_some(altitude)
}

/// Squawk identity of DF5/DF21: interleaved 13-bit field at bits 20..32,
/// four octal digits rendered in decimal.
fn decode_identity(raw: &[u8]) -> u16 {
    let a = ((raw[3] & 0x80) >> 5) | (raw[2] & 0x02) | ((raw[2] & 0x08) >> 3);
    let b = ((raw[3] & 0x02) << 1) | ((raw[3] & 0x08) >> 2) | ((raw[3] & 0x20) >> 5);
    let c = ((raw[2] & 0x01) << 2) | ((raw[2] & 0x04) >> 1) | ((raw[2] & 0x10) >> 4);
    let d = ((raw[3] & 0x01) << 2) | ((raw[3] & 0x04) >> 1) | ((raw[3] & 0x10) >> 4);
    a as u16 * 1000 + b as u16 * 100 + c as u16 * 10 + d as u16
}

/// Parse one raw-input line (`*<hex>;`, surrounding whitespace allowed) and
/// decode it as if locally demodulated. Anything malformed yields `None`.
pub fn decode_raw_line(line: &str, fix_errors: bool, aggressive: bool) -> Option<ModesMessage> {
    let line = line.trim();
    if line.len() < 4 || !line.starts_with('*') || !line.ends_with(';') {
        return None;
    }

    let hex = &line[1..line.len() - 1];
    if hex.len() > LONG_MSG_BYTES * 2 || hex.len() % 2 != 0 {
        return None;
    }

    let mut frame = [0u8; LONG_MSG_BYTES];
    for (i, pair) in hex.as_bytes().chunks_exact(2).enumerate() {
        frame[i] = (hex_val(pair[0])? << 4) | hex_val(pair[1])?;
    }

    Some(decode(&frame[..hex.len() / 2], fix_errors, aggressive))
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn capability_str(ca: u8) -> &'static str {
    match ca {
        0 => "Level 1 (Surveillance Only)",
        1 => "Level 2 (DF0,4,5,11)",
        2 => "Level 3 (DF0,4,5,11,20,21)",
        3 => "Level 4 (DF0,4,5,11,20,21,24)",
        4 => "Level 2+3+4 (DF0,4,5,11,20,21,24,code7 - is on ground)",
        5 => "Level 2+3+4 (DF0,4,5,11,20,21,24,code7 - is airborne)",
        6 => "Level 2+3+4 (DF0,4,5,11,20,21,24,code7)",
        7 => "Level 7",
        _ => "Unknown",
    }
}

fn flight_status_str(fs: u8) -> &'static str {
    match fs {
        0 => "Normal, Airborne",
        1 => "Normal, On the ground",
        2 => "ALERT, Airborne",
        3 => "ALERT, On the ground",
        4 => "ALERT & Special Position Identification",
        5 => "Special Position Identification",
        _ => "Not assigned",
    }
}

impl fmt::Display for ModesMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.to_raw_line())?;
        writeln!(
            f,
            "CRC: {:06x} ({})",
            self.crc,
            if self.crc_ok { "ok" } else { "wrong" }
        )?;
        match self.repair {
            Some(CrcRepair::Single(bit)) => writeln!(f, "Single bit error fixed, bit {}", bit)?,
            Some(CrcRepair::Double(lo, hi)) => {
                writeln!(f, "Two bit errors fixed, bits {} and {}", lo, hi)?
            }
            None => {}
        }

        let unit_str = |u: &AltitudeUnit| if *u == AltitudeUnit::Meters { "meters" } else { "feet" };

        match &self.payload {
            MessagePayload::AirAirSurveillance { altitude, unit } => {
                let name = if self.df == 0 { "Short" } else { "Long" };
                writeln!(f, "DF {}: {} Air-Air Surveillance.", self.df, name)?;
                writeln!(f, "  Altitude       : {} {}", altitude, unit_str(unit))?;
                writeln!(f, "  ICAO Address   : {:06x}", self.icao)?;
            }
            MessagePayload::AltitudeReply { fs, dr, um, altitude, unit } => {
                let name = if self.df == 4 { "Surveillance" } else { "Comm-B" };
                writeln!(f, "DF {}: {}, Altitude Reply.", self.df, name)?;
                writeln!(f, "  Flight Status  : {}", flight_status_str(*fs))?;
                writeln!(f, "  DR             : {}", dr)?;
                writeln!(f, "  UM             : {}", um)?;
                writeln!(f, "  Altitude       : {} {}", altitude, unit_str(unit))?;
                writeln!(f, "  ICAO Address   : {:06x}", self.icao)?;
            }
            MessagePayload::IdentityReply { fs, dr, um, identity } => {
                let name = if self.df == 5 { "Surveillance" } else { "Comm-B" };
                writeln!(f, "DF {}: {}, Identity Reply.", self.df, name)?;
                writeln!(f, "  Flight Status  : {}", flight_status_str(*fs))?;
                writeln!(f, "  DR             : {}", dr)?;
                writeln!(f, "  UM             : {}", um)?;
                writeln!(f, "  Squawk         : {:04}", identity)?;
                writeln!(f, "  ICAO Address   : {:06x}", self.icao)?;
            }
            MessagePayload::AllCallReply { capability } => {
                writeln!(f, "DF 11: All Call Reply.")?;
                writeln!(f, "  Capability  : {}", capability_str(*capability))?;
                writeln!(f, "  ICAO Address: {:06x}", self.icao)?;
            }
            MessagePayload::ExtendedSquitter { capability, me_type, me_sub, me } => {
                writeln!(f, "DF 17: ADS-B message.")?;
                writeln!(f, "  Capability     : {} ({})", capability, capability_str(*capability))?;
                writeln!(f, "  ICAO Address   : {:06x}", self.icao)?;
                writeln!(f, "  Extended Squitter Type: {}", me_type)?;
                writeln!(f, "  Extended Squitter Sub : {}", me_sub)?;
                match me {
                    ExtendedSquitter::Identification { callsign, category } => {
                        writeln!(f, "    Emitter Category : {}", category)?;
                        writeln!(f, "    Identification   : {}", callsign)?;
                    }
                    ExtendedSquitter::AirbornePosition { odd, utc, altitude, lat_cpr, lon_cpr } => {
                        writeln!(f, "    F flag   : {}", if *odd { "odd" } else { "even" })?;
                        writeln!(f, "    T flag   : {}", if *utc { "UTC" } else { "non-UTC" })?;
                        writeln!(f, "    Altitude : {} feet", altitude)?;
                        writeln!(f, "    Latitude : {} (not decoded)", lat_cpr)?;
                        writeln!(f, "    Longitude: {} (not decoded)", lon_cpr)?;
                    }
                    ExtendedSquitter::AirborneVelocity { ew_west, ew_vel, ns_south, ns_vel, vr_gnss, vr_down, vr, speed, heading } => {
                        writeln!(f, "    EW direction      : {}", *ew_west as u8)?;
                        writeln!(f, "    EW velocity       : {}", ew_vel)?;
                        writeln!(f, "    NS direction      : {}", *ns_south as u8)?;
                        writeln!(f, "    NS velocity       : {}", ns_vel)?;
                        writeln!(f, "    Vertical rate src : {}", if *vr_gnss { "GNSS" } else { "baro" })?;
                        writeln!(f, "    Vertical rate sign: {}", *vr_down as u8)?;
                        writeln!(f, "    Vertical rate     : {}", vr)?;
                        writeln!(f, "    Speed             : {}", speed)?;
                        if let Some(h) = heading {
                            writeln!(f, "    Heading           : {:.1}", h)?;
                        }
                    }
                    ExtendedSquitter::MagneticHeading { valid, heading } => {
                        writeln!(f, "    Heading status: {}", valid)?;
                        writeln!(f, "    Heading       : {:.1}", heading)?;
                    }
                    ExtendedSquitter::AircraftStatus { emergency } => {
                        writeln!(f, "    Emergency state: {}", emergency)?;
                    }
                    ExtendedSquitter::OperationalStatus { subtype } => {
                        writeln!(f, "    Operational status, subtype {}", subtype)?;
                    }
                    ExtendedSquitter::Unsupported { me_type, me_sub } => {
                        writeln!(f, "    Unrecognized ME type: {} subtype: {}", me_type, me_sub)?;
                    }
                }
            }
            MessagePayload::Unsupported => {
                writeln!(f, "DF {} (decoding not implemented)", self.df)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_lengths_by_df() {
        assert_eq!(bit_len(0) / 8, SHORT_MSG_BYTES);
        assert_eq!(bit_len(17) / 8, LONG_MSG_BYTES);
        assert_eq!(bit_len(0), SHORT_MSG_BITS);
        assert_eq!(bit_len(4), SHORT_MSG_BITS);
        assert_eq!(bit_len(5), SHORT_MSG_BITS);
        assert_eq!(bit_len(11), SHORT_MSG_BITS);
        assert_eq!(bit_len(16), LONG_MSG_BITS);
        assert_eq!(bit_len(17), LONG_MSG_BITS);
        assert_eq!(bit_len(20), LONG_MSG_BITS);
        assert_eq!(bit_len(21), LONG_MSG_BITS);
        assert_eq!(bit_len(24), LONG_MSG_BITS);
    }

    #[test]
    fn identification_frame() {
        let mm = decode_raw_line("*8D4840D6202CC371C32CE0576098;", false, false).unwrap();
        assert_eq!(mm.df, 17);
        assert!(mm.crc_ok);
        assert_eq!(mm.repair, None);
        assert_eq!(mm.icao, 0x4840D6);
        match mm.payload {
            MessagePayload::ExtendedSquitter { me_type, me: ExtendedSquitter::Identification { ref callsign, category }, .. } => {
                assert_eq!(me_type, 4);
                assert_eq!(callsign, "KLM1023");
                assert_eq!(category, 3);
            }
            ref other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn velocity_frame() {
        let mm = decode_raw_line("*8D4B969699155600E87406F5B69F;", false, false).unwrap();
        assert_eq!(mm.df, 17);
        assert!(mm.crc_ok);
        assert_eq!(mm.icao, 0x4B9696);
        match mm.payload {
            MessagePayload::ExtendedSquitter { me_type, me_sub, me: ExtendedSquitter::AirborneVelocity { ew_west, ew_vel, ns_south, ns_vel, speed, heading, .. }, .. } => {
                assert_eq!(me_type, 19);
                assert_eq!(me_sub, 1);
                assert!(ew_west);
                assert_eq!(ew_vel, 342);
                assert!(!ns_south);
                assert_eq!(ns_vel, 7);
                assert_eq!(speed, 342);
                let h = heading.unwrap();
                assert!((h - 271.17).abs() < 0.1, "heading {}", h);
            }
            ref other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn airborne_position_frames() {
        // Even and odd halves of the same aircraft, seconds apart.
        let even = decode_raw_line("*8D40621D58C382D690C8AC2863A7;", false, false).unwrap();
        assert!(even.crc_ok);
        assert_eq!(even.icao, 0x40621D);
        match even.payload {
            MessagePayload::ExtendedSquitter { me_type, me: ExtendedSquitter::AirbornePosition { odd, utc, altitude, lat_cpr, lon_cpr }, .. } => {
                assert_eq!(me_type, 11);
                assert!(!odd);
                assert!(!utc);
                assert_eq!(altitude, 38_000);
                assert_eq!(lat_cpr, 93_000);
                assert_eq!(lon_cpr, 51_372);
            }
            ref other => panic!("wrong payload: {:?}", other),
        }

        let odd = decode_raw_line("*8D40621D58C386435CC412692AD6;", false, false).unwrap();
        assert!(odd.crc_ok);
        match odd.payload {
            MessagePayload::ExtendedSquitter { me: ExtendedSquitter::AirbornePosition { odd, lat_cpr, lon_cpr, .. }, .. } => {
                assert!(odd);
                assert_eq!(lat_cpr, 74_158);
                assert_eq!(lon_cpr, 50_194);
            }
            ref other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn df4_altitude_and_recovered_address() {
        let mm = decode_raw_line("*20000F1F684A6C;", false, false).unwrap();
        assert_eq!(mm.df, 4);
        // Address-parity frame: candidate recovered, pending cache check.
        assert!(!mm.crc_ok);
        assert_ne!(mm.icao, 0);
        match mm.payload {
            MessagePayload::AltitudeReply { altitude, unit, .. } => {
                assert_eq!(altitude, 23_375);
                assert_eq!(unit, AltitudeUnit::Feet);
            }
            ref other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn df5_identity() {
        let mm = decode_raw_line("*2A00516D492B80;", false, false).unwrap();
        assert_eq!(mm.df, 5);
        match mm.payload {
            MessagePayload::IdentityReply { identity, .. } => assert_eq!(identity, 356),
            ref other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn single_bit_repair_applied() {
        // Valid DF17 frame with one bit flipped.
        let mut line = String::from("*8D4840D6202CC371C32CE0576098;");
        // Byte 5 (0x2C) with bit 0x04 flipped -> 0x28, hex chars 11..13.
        line.replace_range(11..13, "28");
        let mm = decode_raw_line(&line, true, false).unwrap();
        assert!(mm.crc_ok);
        assert!(matches!(mm.repair, Some(CrcRepair::Single(_))));
        assert_eq!(mm.raw[5], 0x2C);
    }

    #[test]
    fn two_bit_repair_needs_aggressive() {
        let mut frame = [
            0x8Du8, 0x48, 0x40, 0xD6, 0x20, 0x2C, 0xC3, 0x71, 0xC3, 0x2C, 0xE0, 0x57, 0x60, 0x98,
        ];
        frame[5] ^= 0x04;
        frame[9] ^= 0x01;

        let mm = decode(&frame, true, false);
        assert!(!mm.crc_ok);
        assert_eq!(mm.repair, None);

        let mm = decode(&frame, true, true);
        assert!(mm.crc_ok);
        assert!(matches!(mm.repair, Some(CrcRepair::Double(_, _))));
    }

    #[test]
    fn raw_line_round_trip() {
        let mm = decode_raw_line("*8D4840D6202CC371C32CE0576098;", false, false).unwrap();
        assert_eq!(mm.to_raw_line(), "*8D4840D6202CC371C32CE0576098;");

        let short = decode_raw_line("*20000F1F684A6C;", false, false).unwrap();
        assert_eq!(short.to_raw_line(), "*20000F1F684A6C;");
    }

    #[test]
    fn raw_line_rejects_malformed_input() {
        assert!(decode_raw_line("8D4840D6202CC371C32CE0576098", false, false).is_none());
        assert!(decode_raw_line("*;", false, false).is_none());
        assert!(decode_raw_line("*8D484;", false, false).is_none());
        assert!(decode_raw_line("*8G4840D6202CC371C32CE0576098;", false, false).is_none());
        // 30 hex chars: longer than a long frame.
        assert!(decode_raw_line("*8D4840D6202CC371C32CE057609812;", false, false).is_none());
        // Whitespace around a valid line is fine.
        assert!(decode_raw_line("  *8D4840D6202CC371C32CE0576098;\r\n", false, false).is_some());
    }

    #[test]
    fn sbs_rows_match_grid() {
        let mm = decode_raw_line("*8D4840D6202CC371C32CE0576098;", false, false).unwrap();
        let line = mm.to_sbs_line(None).unwrap();
        assert!(line.starts_with("MSG,1,,,4840D6,"));
        assert!(line.contains("KLM1023"));

        let mm = decode_raw_line("*8D4B969699155600E87406F5B69F;", false, false).unwrap();
        let line = mm.to_sbs_line(None).unwrap();
        assert!(line.starts_with("MSG,4,,,4B9696,"));

        let mm = decode_raw_line("*20000F1F684A6C;", false, false).unwrap();
        let line = mm.to_sbs_line(None).unwrap();
        assert!(line.starts_with("MSG,5,,,"));
        assert!(line.contains("23375"));

        let mm = decode_raw_line("*2A00516D492B80;", false, false).unwrap();
        let line = mm.to_sbs_line(None).unwrap();
        assert!(line.starts_with("MSG,6,,,"));
        assert!(line.contains("356"));
    }

    #[test]
    fn emergency_squawks_flagged_in_sbs() {
        for (squawk, expect) in [(7500u16, -1), (7600, -1), (7700, -1), (1200, 0)] {
            let (alert, emergency, spi, ground) = status_flags(0, squawk);
            assert_eq!(emergency, expect);
            assert_eq!(alert, 0);
            assert_eq!(spi, 0);
            assert_eq!(ground, 0);
        }
    }

    #[test]
    fn gillham_altitudes() {
        assert_eq!(decode_gillham(0), None);
        // C1=1 only: first 100 ft step of the lowest band.
        assert_eq!(decode_gillham(0x001).unwrap_or(0) % 100, 0);
    }
}
