//! Sensor sources for telemetry messages
//!
//! A [`SensorSource`] produces one snapshot of named readings per publish
//! cycle. Real collectors (system metrics, I2C drivers) live outside this
//! crate and plug in through the trait; the simulated sources here generate
//! realistic patterns without hardware.
//!
//! # Sources
//!
//! | Source | Readings |
//! |--------|----------|
//! | `SimulatedHost` | ram_usage, cpu_usage, number_of_cores, number_of_processes, battery_percentage |
//! | `SimulatedSensor` | temperature, humidity, pressure |
//!
//! # Example
//!
//! ```ignore
//! use alice_iot_link::sensors::{SensorSource, SimulatedHost};
//!
//! let mut host = SimulatedHost::new(4);
//! let snapshot = host.snapshot()?;
//! ```
//!
//! Author: Moroya Sakamoto

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// One measured value
///
/// Counts stay integers on the wire; levels are floats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reading {
    Count(u64),
    Level(f64),
}

impl From<u64> for Reading {
    fn from(v: u64) -> Self {
        Reading::Count(v)
    }
}

impl From<f64> for Reading {
    fn from(v: f64) -> Self {
        Reading::Level(v)
    }
}

/// Named readings, ordered by name
pub type Measurements = BTreeMap<String, Reading>;

/// Sensor errors
#[derive(Debug, Error)]
pub enum SensorError {
    /// Sensor not found or not responding
    #[error("sensor not found: {0}")]
    NotFound(String),
    /// Invalid data received
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// Timeout
    #[error("sensor timeout")]
    Timeout,
}

/// Trait for everything that can feed a telemetry message
pub trait SensorSource {
    /// Read the current values
    fn snapshot(&mut self) -> Result<Measurements, SensorError>;
    /// Get source name
    fn name(&self) -> &'static str;
}

/// Simple deterministic pseudo-random noise in ±25
#[inline(always)]
fn noise(seed: u64) -> i32 {
    let hash = seed
        .wrapping_mul(0x9E3779B97F4A7C15)
        .wrapping_add(0x6A09E667);
    ((hash >> 48) as i32) % 50 - 25
}

// ============================================================
// Simulated Host (system metrics shape)
// ============================================================

/// Simulated host metrics
///
/// Produces the same readings a system-metrics collector would, with load
/// wandering around a baseline and the battery slowly draining.
pub struct SimulatedHost {
    /// Logical CPU count reported
    pub cores: u64,
    /// Baseline RAM usage (%)
    pub base_ram: f64,
    /// Baseline CPU usage (%)
    pub base_cpu: f64,
    /// Battery drain per snapshot (%)
    pub battery_drain: f64,
    tick: u64,
}

impl SimulatedHost {
    pub fn new(cores: u64) -> Self {
        Self {
            cores,
            base_ram: 42.0,
            base_cpu: 12.0,
            battery_drain: 0.05,
            tick: 0,
        }
    }
}

impl SensorSource for SimulatedHost {
    fn snapshot(&mut self) -> Result<Measurements, SensorError> {
        let t = self.tick;
        self.tick += 1;

        let n = noise(t) as f64;
        let ram = (self.base_ram + n * 0.2).clamp(0.0, 100.0);
        let cpu = (self.base_cpu + n * 0.4).clamp(0.0, 100.0);
        let processes = (180 + noise(t.wrapping_add(7)) / 5) as u64;
        let battery = (100.0 - t as f64 * self.battery_drain).max(0.0);

        let mut readings = Measurements::new();
        readings.insert("ram_usage".into(), Reading::Level(ram));
        readings.insert("cpu_usage".into(), Reading::Level(cpu));
        readings.insert("number_of_cores".into(), Reading::Count(self.cores));
        readings.insert("number_of_processes".into(), Reading::Count(processes));
        readings.insert("battery_percentage".into(), Reading::Level(battery));
        Ok(readings)
    }

    fn name(&self) -> &'static str {
        "SimulatedHost"
    }
}

// ============================================================
// Simulated Sensor (environmental shape)
// ============================================================

/// Simulated environmental sensor for testing and demos
///
/// Generates a drifting temperature with humidity and pressure trends.
/// Values are scaled integers converted to physical units on output.
pub struct SimulatedSensor {
    /// Noise amplitude (raw integer units)
    pub noise_amplitude: i32,
    /// Base temperature (°C × 100)
    pub base_temp: i32,
    /// Temperature drift rate per sample (°C × 100 / 100)
    pub temp_drift: i32,
    sample: u64,
}

impl SimulatedSensor {
    /// Create a new simulated sensor
    ///
    /// * `base_temp` - Base temperature in °C × 100 (e.g., 2500 = 25.00°C)
    /// * `noise_amplitude` - Maximum noise amplitude (e.g., 5 = ±0.05°C)
    pub fn new(base_temp: i32, noise_amplitude: i32) -> Self {
        Self {
            noise_amplitude,
            base_temp,
            temp_drift: 10,
            sample: 0,
        }
    }
}

impl SensorSource for SimulatedSensor {
    fn snapshot(&mut self) -> Result<Measurements, SensorError> {
        const INV_100: f32 = 1.0 / 100.0;

        let i = self.sample;
        self.sample += 1;

        let t = i as f32;
        let noise = if self.noise_amplitude > 0 {
            noise(i) * self.noise_amplitude / 25
        } else {
            0
        };

        let temperature = self.base_temp + (t * self.temp_drift as f32 * INV_100) as i32 + noise;
        let humidity = 6500 - (t * 5.0) as i32 + noise / 2;
        let pressure = 10132 + (t * 2.0) as i32 + noise / 3;

        let mut readings = Measurements::new();
        readings.insert("temperature".into(), Reading::Level(temperature as f64 / 100.0));
        readings.insert(
            "humidity".into(),
            Reading::Level((humidity as f64 / 100.0).clamp(0.0, 100.0)),
        );
        readings.insert("pressure".into(), Reading::Level(pressure as f64 / 10.0));
        Ok(readings)
    }

    fn name(&self) -> &'static str {
        "Simulated"
    }
}
