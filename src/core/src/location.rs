use crate::error::{Error, Result};
use strum_macros::{AsRefStr, EnumString, FromRepr};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, AsRefStr, EnumString, FromRepr)]
#[strum(serialize_all = "lowercase")]
#[repr(u32)]
pub enum Provider {
    #[default]
    Gps = 0,
    Network = 1,
    Fused = 2,
}

/// One position sample. Plain value type: copied across every boundary.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f32,
    pub bearing: f32,
    pub speed: f32,
    /// `CLOCK_BOOTTIME` nanoseconds at which the fix was taken; `0` if never
    /// stamped.
    pub timestamp_ns: u64,
    pub provider: Provider,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: 5.0,
            ..Default::default()
        }
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = altitude;
        self
    }

    pub fn with_motion(mut self, speed: f32, bearing: f32) -> Self {
        self.speed = speed;
        self.bearing = bearing;
        self
    }

    pub fn with_accuracy(mut self, accuracy: f32) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    /// Marks the fix as taken now.
    pub fn stamped(mut self) -> Self {
        self.timestamp_ns = boottime_ns();
        self
    }

    /// Checks plausibility and returns the normalised fix (bearing folded
    /// into `[0, 360)`).
    pub fn validated(mut self) -> Result<Self> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(Error::configuration(format!(
                "latitude out of range: {}",
                self.latitude
            )));
        }

        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(Error::configuration(format!(
                "longitude out of range: {}",
                self.longitude
            )));
        }

        if !self.altitude.is_finite() {
            return Err(Error::configuration("altitude is not finite"));
        }

        if !self.accuracy.is_finite() || self.accuracy < 0.0 {
            return Err(Error::configuration(format!(
                "invalid accuracy: {}",
                self.accuracy
            )));
        }

        if !self.speed.is_finite() || self.speed < 0.0 {
            return Err(Error::configuration(format!("invalid speed: {}", self.speed)));
        }

        if !self.bearing.is_finite() {
            return Err(Error::configuration("bearing is not finite"));
        }

        self.bearing = self.bearing.rem_euclid(360.0);
        if self.bearing >= 360.0 {
            self.bearing = 0.0;
        }

        Ok(self)
    }
}

/// Current `CLOCK_BOOTTIME` in nanoseconds, the clock behind
/// `Location.getElapsedRealtimeNanos()`.
pub fn boottime_ns() -> u64 {
    clock_ns(nix::time::ClockId::CLOCK_BOOTTIME)
}

/// Current wall clock in milliseconds, the clock behind `Location.getTime()`.
pub fn realtime_ms() -> u64 {
    clock_ns(nix::time::ClockId::CLOCK_REALTIME) / 1_000_000
}

fn clock_ns(clock: nix::time::ClockId) -> u64 {
    nix::time::clock_gettime(clock)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}
