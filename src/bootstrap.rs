//! The initialization state machine: accumulates averaged sensor readings
//! until enough of them are available to seed the filter's first attitude
//! estimate, then hands off a world-to-body rotation matrix.

use crate::linalg::{any_orthogonal_unit, Mat33, Vec3};
use crate::mode::FusionMode;

/// How many accelerometer samples must be averaged before bootstrap can
/// complete. Magnetometer and gyroscope readiness only need a single sample.
const ACC_SAMPLES_REQUIRED: u32 = 32;

/// Which sensors have contributed enough samples to seed the filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    acc: bool,
    mag: bool,
    gyro: bool,
}

impl Readiness {
    /// The readiness a given mode must reach before [`Fusion`](crate::Fusion)
    /// will start predicting/updating.
    pub fn required(mode: &FusionMode) -> Readiness {
        Readiness { acc: true, mag: mode.use_mag(), gyro: mode.use_gyro() }
    }

    pub fn satisfied(&self, required: &Readiness) -> bool {
        (!required.acc || self.acc) && (!required.mag || self.mag) && (!required.gyro || self.gyro)
    }

    /// Clears readiness bits that the given mode no longer requires, so a
    /// mode change without a full reinitialize can't spuriously look ready.
    fn narrow(&mut self, required: &Readiness) {
        self.acc &= required.acc;
        self.mag &= required.mag;
        self.gyro &= required.gyro;
    }
}

/// Running sums and sample counts for the three sensor channels, plus the
/// estimated sample interval used to size the initial process noise.
#[derive(Clone, Copy, Debug)]
pub struct Accumulators {
    acc_count: u32,
    mag_count: u32,
    acc_sum: Vec3,
    mag_sum: Vec3,
    have: Readiness,
    sample_interval: f32,
}

impl Accumulators {
    pub fn new() -> Accumulators {
        Accumulators {
            acc_count: 0,
            mag_count: 0,
            acc_sum: Vec3::ZERO,
            mag_sum: Vec3::ZERO,
            have: Readiness::default(),
            sample_interval: 0.0,
        }
    }

    pub fn reset(&mut self) {
        *self = Accumulators::new();
    }

    pub fn narrow(&mut self, required: &Readiness) {
        self.have.narrow(required);
    }

    pub fn readiness(&self) -> Readiness {
        self.have
    }

    /// Folds in an accelerometer sample. In gyro-less (geomag) mode the
    /// accelerometer also supplies the timing reference, so `dt` is recorded
    /// unconditionally when there is no gyroscope to do so.
    pub fn record_acc(&mut self, a: Vec3, dt: f32, has_gyro: bool) {
        if !has_gyro {
            self.sample_interval = dt;
        }
        if let Some(unit) = a.try_normalize() {
            self.acc_sum = self.acc_sum + unit;
            self.acc_count += 1;
            if self.acc_count >= ACC_SAMPLES_REQUIRED {
                self.have.acc = true;
            }
        }
    }

    pub fn record_mag(&mut self, m: Vec3) {
        if let Some(unit) = m.try_normalize() {
            self.mag_sum = self.mag_sum + unit;
            self.mag_count += 1;
            self.have.mag = true;
        }
    }

    pub fn record_gyro(&mut self, dt: f32) {
        self.sample_interval = dt;
        self.have.gyro = true;
    }

    /// Builds the seed world-to-body rotation matrix and sample interval
    /// once readiness has been reached. `up` comes from the averaged
    /// accelerometer reading; `east`/`north` come from the magnetometer when
    /// available, or from an arbitrary orthogonal vector otherwise.
    pub fn finalize(&self, mode: &FusionMode) -> (Mat33, f32) {
        let up = self.acc_sum.scale((self.acc_count.max(1) as f32).recip());

        let east = if mode.use_mag() {
            let mag_avg = self.mag_sum.scale((self.mag_count.max(1) as f32).recip());
            mag_avg
                .cross(&up)
                .try_normalize()
                .unwrap_or_else(|| any_orthogonal_unit(up))
        } else {
            any_orthogonal_unit(up)
        };

        let north = up.cross(&east);
        (Mat33::from_columns(east, north, up), self.sample_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_for_full_9dof_requires_all_three() {
        let required = Readiness::required(&FusionMode::full_9dof());
        let mut have = Readiness::default();
        assert!(!have.satisfied(&required));
        have.acc = true;
        have.gyro = true;
        assert!(!have.satisfied(&required));
        have.mag = true;
        assert!(have.satisfied(&required));
    }

    #[test]
    fn acc_readiness_needs_enough_samples() {
        let mut acc = Accumulators::new();
        for _ in 0..ACC_SAMPLES_REQUIRED - 1 {
            acc.record_acc(Vec3::new(0.0, 0.0, 1.0), 0.01, true);
        }
        assert!(!acc.readiness().acc);
        acc.record_acc(Vec3::new(0.0, 0.0, 1.0), 0.01, true);
        assert!(acc.readiness().acc);
    }

    #[test]
    fn geomag_mode_seeds_from_accel_and_mag_only() {
        let mut acc = Accumulators::new();
        for _ in 0..ACC_SAMPLES_REQUIRED {
            acc.record_acc(Vec3::new(0.0, 0.0, 1.0), 0.02, false);
        }
        acc.record_mag(Vec3::new(0.0, 1.0, 0.3));
        let (r, dt) = acc.finalize(&FusionMode::geomag());
        assert!((dt - 0.02).abs() < 1e-6);
        // "up" column should be close to +Z.
        assert!((r.m[2][2] - 1.0).abs() < 1e-3);
    }
}
