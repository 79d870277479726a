//! Operating mode and derived noise parameters.
//!
//! Replaces the raw `FUSION_USE_GYRO | FUSION_USE_MAG` bitflags with a typed
//! value built through named constructors, so an invalid combination can't be
//! expressed.

/// Which sensors the engine expects to be fed, and whether construction
/// should force a full reset instead of narrowing the existing bootstrap
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FusionMode {
    use_gyro: bool,
    use_mag: bool,
    reinitialize: bool,
}

impl FusionMode {
    /// Full 9-DOF fusion: accelerometer + magnetometer + gyroscope.
    pub const fn full_9dof() -> Self {
        FusionMode { use_gyro: true, use_mag: true, reinitialize: false }
    }

    /// Game-rotation-vector mode: gyroscope + accelerometer only. Heading is
    /// not observable; a synthetic magnetometer heartbeat keeps yaw from
    /// drifting unbounded.
    pub const fn game_rotation() -> Self {
        FusionMode { use_gyro: true, use_mag: false, reinitialize: false }
    }

    /// Geomagnetic-rotation-vector mode: magnetometer + accelerometer only,
    /// no gyroscope. The accelerometer also stands in as the timing source.
    pub const fn geomag() -> Self {
        FusionMode { use_gyro: false, use_mag: true, reinitialize: false }
    }

    /// Forces [`Fusion::init`](crate::Fusion::init) to fully reset state
    /// rather than narrow the existing bootstrap readiness.
    pub const fn reinitialize(mut self) -> Self {
        self.reinitialize = true;
        self
    }

    pub const fn use_gyro(&self) -> bool {
        self.use_gyro
    }

    pub const fn use_mag(&self) -> bool {
        self.use_mag
    }

    pub const fn should_reinitialize(&self) -> bool {
        self.reinitialize
    }
}

/// Measurement-noise parameters. Scaled up for geomag mode, which has no
/// gyroscope to damp high-frequency accelerometer/magnetometer noise.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Parameters {
    pub gyro_var: f32,
    pub gyro_bias_var: f32,
    pub acc_stdev: f32,
    pub mag_stdev: f32,
}

impl Parameters {
    pub const NORMAL: Parameters = Parameters {
        gyro_var: 1e-7,
        gyro_bias_var: 1e-12,
        acc_stdev: 1.5e-2,
        mag_stdev: 1.0e-2,
    };

    pub const GEOMAG: Parameters = Parameters {
        gyro_var: 1e-4,
        gyro_bias_var: 1e-8,
        acc_stdev: 0.05,
        mag_stdev: 0.1,
    };

    pub fn for_mode(mode: &FusionMode) -> Parameters {
        if mode.use_gyro() {
            Parameters::NORMAL
        } else {
            Parameters::GEOMAG
        }
    }
}
