//! Aircraft roster
//!
//! Keyed state for every aircraft heard recently, fused from whatever
//! message types come in. Entries age out on a timer tick; position appears
//! once both CPR halves have been received close enough together.

use std::collections::HashMap;

use serde::Serialize;

use crate::cpr::{self, CprHalf};
use crate::message::{ExtendedSquitter, MessagePayload, ModesMessage};

/// Odd and even CPR halves only combine when received within this window.
const CPR_FUSE_WINDOW_MS: u64 = 10_000;

/// Display lifecycle of a roster entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowState {
    /// Below the message threshold, not listed yet.
    None,
    /// Crossed the threshold since the last tick.
    FirstTime,
    Normal,
    /// One tick away from eviction.
    LastTime,
}

#[derive(Debug, Clone)]
pub struct Aircraft {
    pub icao: u32,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub messages: u64,
    pub callsign: String,
    pub altitude: i32,
    pub speed: u16,
    pub heading: u16,
    pub heading_valid: bool,
    pub squawk: u16,
    pub odd_cpr: Option<CprHalf>,
    pub even_cpr: Option<CprHalf>,
    pub position: Option<(f64, f64)>,
    pub show_state: ShowState,
}

impl Aircraft {
    fn new(icao: u32, now_ms: u64) -> Self {
        Self {
            icao,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            messages: 0,
            callsign: String::new(),
            altitude: 0,
            speed: 0,
            heading: 0,
            heading_valid: false,
            squawk: 0,
            odd_cpr: None,
            even_cpr: None,
            position: None,
            show_state: ShowState::None,
        }
    }
}

/// Record shape served as `data.json`: only aircraft with a resolved
/// position are listed.
#[derive(Serialize)]
struct JsonAircraft<'a> {
    hex: String,
    flight: &'a str,
    lat: f64,
    lon: f64,
    altitude: i32,
    track: u16,
    speed: u16,
}

pub struct Roster {
    aircraft: HashMap<u32, Aircraft>,
    ttl_secs: u64,
    min_messages: u64,
    unique_seen: u64,
}

impl Roster {
    pub fn new(ttl_secs: u64, min_messages: u64) -> Self {
        Self {
            aircraft: HashMap::new(),
            ttl_secs,
            min_messages,
            unique_seen: 0,
        }
    }

    /// Fold one decoded message into the roster. Returns the updated record,
    /// or `None` for the null address, which is never tracked.
    pub fn update(&mut self, mm: &ModesMessage, now_ms: u64) -> Option<&Aircraft> {
        if mm.icao == 0 {
            return None;
        }

        if !self.aircraft.contains_key(&mm.icao) {
            self.unique_seen += 1;
        }
        let ac = self
            .aircraft
            .entry(mm.icao)
            .or_insert_with(|| Aircraft::new(mm.icao, now_ms));

        ac.last_seen_ms = now_ms;
        ac.messages += 1;
        if ac.show_state == ShowState::None && ac.messages >= self.min_messages {
            ac.show_state = ShowState::FirstTime;
        }

        match &mm.payload {
            MessagePayload::AirAirSurveillance { altitude, .. }
            | MessagePayload::AltitudeReply { altitude, .. } => {
                ac.altitude = *altitude;
            }
            MessagePayload::IdentityReply { identity, .. } => {
                if *identity != 0 {
                    ac.squawk = *identity;
                }
            }
            MessagePayload::ExtendedSquitter { me, .. } => match me {
                ExtendedSquitter::Identification { callsign, .. } => {
                    ac.callsign = callsign.clone();
                }
                ExtendedSquitter::AirbornePosition {
                    odd,
                    altitude,
                    lat_cpr,
                    lon_cpr,
                    ..
                } => {
                    ac.altitude = *altitude;
                    let half = CprHalf {
                        lat: *lat_cpr,
                        lon: *lon_cpr,
                        at_ms: now_ms,
                    };
                    if *odd {
                        ac.odd_cpr = Some(half);
                    } else {
                        ac.even_cpr = Some(half);
                    }

                    if let (Some(even), Some(odd)) = (&ac.even_cpr, &ac.odd_cpr) {
                        if even.at_ms.abs_diff(odd.at_ms) <= CPR_FUSE_WINDOW_MS {
                            // Zone mismatch keeps whatever position we had.
                            if let Some(pos) = cpr::resolve(even, odd) {
                                ac.position = Some(pos);
                            }
                        }
                    }
                }
                ExtendedSquitter::AirborneVelocity { speed, heading, .. } => {
                    ac.speed = *speed;
                    if let Some(h) = heading {
                        ac.heading = *h as u16;
                        ac.heading_valid = true;
                    }
                }
                ExtendedSquitter::MagneticHeading { valid, heading } => {
                    if *valid {
                        ac.heading = *heading as u16;
                        ac.heading_valid = true;
                    }
                }
                _ => {}
            },
            _ => {}
        }

        self.aircraft.get(&mm.icao)
    }

    /// Age the roster: entries a full TTL old get one farewell tick, older
    /// ones are dropped. Runs on the display/eviction timer (~4 Hz).
    pub fn tick(&mut self, now_ms: u64) {
        let ttl = self.ttl_secs;
        self.aircraft.retain(|_, ac| {
            let age_s = now_ms.saturating_sub(ac.last_seen_ms) / 1000;
            if age_s > ttl {
                return false;
            }
            if age_s >= ttl {
                ac.show_state = ShowState::LastTime;
            } else if ac.show_state == ShowState::FirstTime {
                ac.show_state = ShowState::Normal;
            }
            true
        });
    }

    pub fn get(&self, icao: u32) -> Option<&Aircraft> {
        self.aircraft.get(&icao)
    }

    pub fn position_of(&self, icao: u32) -> Option<(f64, f64)> {
        self.aircraft.get(&icao).and_then(|ac| ac.position)
    }

    /// Entries past the message threshold, for display.
    pub fn visible(&self) -> impl Iterator<Item = &Aircraft> {
        self.aircraft
            .values()
            .filter(|ac| ac.show_state != ShowState::None)
    }

    pub fn len(&self) -> usize {
        self.aircraft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }

    /// Distinct aircraft seen over the whole run, evicted or not.
    pub fn unique_seen(&self) -> u64 {
        self.unique_seen
    }

    /// `data.json` body: every positioned aircraft as one record.
    pub fn to_json(&self) -> String {
        let records: Vec<JsonAircraft<'_>> = self
            .aircraft
            .values()
            .filter_map(|ac| {
                let (lat, lon) = ac.position?;
                Some(JsonAircraft {
                    hex: format!("{:06X}", ac.icao),
                    flight: &ac.callsign,
                    lat,
                    lon,
                    altitude: ac.altitude,
                    track: ac.heading,
                    speed: ac.speed,
                })
            })
            .collect();
        serde_json::to_string(&records).unwrap_or_else(|_| "[]".into())
    }
}
