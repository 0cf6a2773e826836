use rand::rngs::ThreadRng;
use rand::Rng;

/// One environmental sample, complete or not taken at all.
#[derive(Debug, Clone, Copy)]
pub struct EnvSample {
    pub temperature: f64,
    pub humidity: f64,
    pub battery: f64,
    pub door_open: bool,
    pub lat: f64,
    pub lon: f64,
}

/// Simulated onboard sensor bank: a reefer-container temperature probe, a
/// humidity probe, a battery gauge, a door switch, a GPS fix jittering
/// around the base position, and an accelerometer.
pub struct SensorBank {
    rng: ThreadRng,
    base_lat: f64,
    base_lon: f64,
    battery: f64,
    door_open: bool,
    /// Probability that a probe read comes back not-a-number.
    fault_rate: f64,
}

impl SensorBank {
    pub fn new(base_lat: f64, base_lon: f64, fault_rate: f64) -> Self {
        Self {
            rng: rand::thread_rng(),
            base_lat,
            base_lon,
            battery: 100.0,
            door_open: false,
            fault_rate,
        }
    }

    /// Take one environmental sample. Returns `None` when any probe read is
    /// non-finite; the caller skips that tick rather than publish a partial
    /// record.
    pub fn sample_environment(&mut self) -> Option<EnvSample> {
        let temperature = self.read_temperature();
        let humidity = self.read_humidity();
        if !temperature.is_finite() || !humidity.is_finite() {
            return None;
        }

        self.battery = (self.battery - 0.002).max(0.0);
        if self.rng.gen_bool(0.01) {
            self.door_open = !self.door_open;
        }

        Some(EnvSample {
            temperature,
            humidity,
            battery: self.battery,
            door_open: self.door_open,
            lat: self.base_lat + self.rng.gen_range(-0.001..0.001),
            lon: self.base_lon + self.rng.gen_range(-0.001..0.001),
        })
    }

    /// Instantaneous acceleration in g. Mostly vibration noise, with rare
    /// handling spikes.
    pub fn sample_shock(&mut self) -> f64 {
        if self.rng.gen_bool(0.002) {
            self.rng.gen_range(1.0..8.0)
        } else {
            self.rng.gen_range(0.0..0.4)
        }
    }

    fn read_temperature(&mut self) -> f64 {
        if self.fault_rate > 0.0 && self.rng.gen_bool(self.fault_rate) {
            return f64::NAN;
        }
        if self.rng.gen_bool(0.03) {
            // Cooling excursion, e.g. door left open or unit cycling
            self.rng.gen_range(4.2..15.0)
        } else {
            4.2 + self.rng.gen_range(-0.5..0.5)
        }
    }

    fn read_humidity(&mut self) -> f64 {
        if self.fault_rate > 0.0 && self.rng.gen_bool(self.fault_rate) {
            return f64::NAN;
        }
        self.rng.gen_range(55.0..75.0)
    }
}
