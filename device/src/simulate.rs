use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::protocol::Location;
use crate::types::Reading;

pub const BATTERY_FULL: u8 = 100;
pub const BATTERY_LOW: u8 = 5;
pub const RSSI: u8 = 30;

const DEFAULT_LAT: f64 = 45.448803450183924;
const DEFAULT_LON: f64 = -75.63533774831912;
const CELL_LAC: &str = "1234";
const CELL_ID: &str = "5678";

#[derive(Debug, Clone, PartialEq)]
pub enum LocationMode {
    /// Random-walk GNSS coordinates.
    Simulated,
    /// Serving cell of the configured network.
    CellId { mcc: String, mnc: String },
}

pub struct SensorSimulator {
    rng: StdRng,
    lat: f64,
    lon: f64,
    battery: u8,
    mode: LocationMode,
}

impl SensorSimulator {
    pub fn new(mode: LocationMode) -> Self {
        Self::with_rng(mode, StdRng::from_entropy())
    }

    pub fn with_rng(mode: LocationMode, rng: StdRng) -> Self {
        Self {
            rng,
            lat: DEFAULT_LAT,
            lon: DEFAULT_LON,
            battery: BATTERY_FULL,
            mode,
        }
    }

    pub fn set_start(&mut self, lat: f64, lon: f64) {
        self.lat = lat;
        self.lon = lon;
    }

    pub fn temperature(&mut self) -> f32 {
        round1(self.rng.gen_range(18.0..=24.0))
    }

    pub fn humidity(&mut self) -> f32 {
        round1(self.rng.gen_range(35.0..=50.0))
    }

    pub fn reading(&mut self) -> Reading {
        Reading {
            temperature: self.temperature(),
            humidity: self.humidity(),
        }
    }

    /// Advances the walk: latitude jitters both ways, longitude drifts east.
    pub fn step_location(&mut self) -> (f64, f64) {
        self.lat += self.rng.gen_range(-0.0001..=0.0001);
        self.lon += self.rng.gen_range(0.0001..=0.0003);
        (round6(self.lat), round6(self.lon))
    }

    pub fn location(&mut self) -> Location {
        match &self.mode {
            LocationMode::CellId { mcc, mnc } => Location::Cell {
                mcc: mcc.clone(),
                mnc: mnc.clone(),
                lac: CELL_LAC.to_string(),
                cell: CELL_ID.to_string(),
                signal: RSSI,
            },
            LocationMode::Simulated => {
                let (lat, lon) = self.step_location();
                Location::Gnss { lat, lon }
            }
        }
    }

    /// Even odds of losing one percent; below the low mark it recharges.
    pub fn battery(&mut self) -> u8 {
        if self.rng.gen_bool(0.5) {
            self.battery = self.battery.saturating_sub(1);
        }
        if self.battery < BATTERY_LOW {
            self.battery = BATTERY_FULL;
        }
        self.battery = self.battery.clamp(BATTERY_LOW, BATTERY_FULL);
        self.battery
    }

    pub fn steps(&mut self, duration_secs: u64) -> u32 {
        let rate: f64 = self.rng.gen_range(0.8..=1.8);
        let base = (rate * duration_secs.max(1) as f64) as i64;
        let noise: i64 = self.rng.gen_range(-5..=5);
        u32::try_from((base + noise).max(0)).unwrap_or(u32::MAX)
    }
}

fn round1(v: f64) -> f32 {
    ((v * 10.0).round() / 10.0) as f32
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> SensorSimulator {
        SensorSimulator::with_rng(LocationMode::Simulated, StdRng::seed_from_u64(seed))
    }

    #[test]
    fn battery_stays_in_range() {
        let mut sim = seeded(7);
        let mut recharged = false;
        let mut last = BATTERY_FULL;
        for _ in 0..10_000 {
            let level = sim.battery();
            assert!((BATTERY_LOW..=BATTERY_FULL).contains(&level));
            if level > last {
                assert_eq!(level, BATTERY_FULL);
                recharged = true;
            }
            last = level;
        }
        assert!(recharged);
    }

    #[test]
    fn steps_stay_within_rate_bounds() {
        let mut sim = seeded(1);
        for duration in [0, 1, 2, 5, 10, 600] {
            for _ in 0..200 {
                let steps = sim.steps(duration);
                assert!(steps <= (1.8 * duration.max(1) as f64) as u32 + 5);
            }
        }
    }

    #[test]
    fn readings_stay_in_bounds() {
        let mut sim = seeded(3);
        for _ in 0..1_000 {
            let r = sim.reading();
            assert!((18.0..=24.0).contains(&r.temperature));
            assert!((35.0..=50.0).contains(&r.humidity));
        }
    }

    #[test]
    fn longitude_drifts_east_and_latitude_wanders() {
        let mut sim = seeded(11);
        sim.set_start(10.0, 20.0);
        let mut prev_lon = 20.0;
        for _ in 0..100 {
            let (lat, lon) = sim.step_location();
            assert!(lon > prev_lon);
            assert!((lat - 10.0).abs() < 0.0101);
            prev_lon = lon;
        }
        assert!(prev_lon >= 20.0 + 100.0 * 0.0001 - 1e-6);
    }

    #[test]
    fn cell_mode_reports_configured_network() {
        let mut sim = SensorSimulator::with_rng(
            LocationMode::CellId {
                mcc: "302".to_string(),
                mnc: "720".to_string(),
            },
            StdRng::seed_from_u64(0),
        );
        assert_eq!(
            sim.location(),
            Location::Cell {
                mcc: "302".to_string(),
                mnc: "720".to_string(),
                lac: "1234".to_string(),
                cell: "5678".to_string(),
                signal: RSSI,
            }
        );
    }
}
