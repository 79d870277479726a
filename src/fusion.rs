//! The indirect (error-state) EKF: a 7-element state (orientation quaternion
//! plus gyro bias) with a 6x6 covariance stored as a 2x2 block of 3x3
//! matrices, fused with accelerometer, magnetometer and gyroscope samples.

use micromath::F32Ext;

use crate::bootstrap::{Accumulators, Readiness};
use crate::error::{RejectReason, SampleOutcome};
use crate::linalg::{
    apply_kinematics_step, apply_orientation_correction, matrix_to_quaternion,
    quaternion_to_matrix, sandwich, skew, Mat33, Quaternion, Vec3,
};
use crate::mode::{FusionMode, Parameters};

/// Below this specific force, the accelerometer is trusted less: the sensor
/// is assumed to be in (or near) free fall and contributing no useful
/// gravity reference.
const FREE_FALL_THRESHOLD_SQ: f32 = 0.962361; // (0.1 * 9.81)^2

/// Plausible geomagnetic field magnitude envelope, in the same units as the
/// caller's magnetometer samples (squared).
const MAX_VALID_MAG_FIELD_SQ: f32 = 10_000.0; // 100^2
const MIN_VALID_MAG_FIELD_SQ: f32 = 100.0; // 10^2

/// Below this, the magnetometer reading is too close to parallel with the
/// gravity reference to give a usable heading direction.
const MIN_VALID_CROSS_PRODUCT_SQ: f32 = 1.0e-6; // (1e-3)^2

/// Below this angular rate the predict step is a no-op: the closed-form
/// quaternion integration has a removable singularity at zero rate.
const PREDICT_SINGULARITY_EPS: f32 = 1.0e-4;

/// Offset added to the bias estimate to synthesize a non-zero angular rate
/// for the geomag-mode dummy predict step.
const GEOMAG_DUMMY_RATE_EPS: f32 = 1.0e-4;

/// Interval, in the same time units as `dt`, between synthetic magnetometer
/// updates in game-rotation mode.
const FAKE_MAG_INTERVAL: f32 = 1.0;

/// Tolerance used when checking the covariance blocks stay symmetric and
/// positive semidefinite.
const SYMMETRY_TOLERANCE: f32 = 1.0e-10;

fn zero_block() -> [[Mat33; 2]; 2] {
    [[Mat33::ZERO; 2]; 2]
}

enum Sensor {
    Acc,
    Mag,
    Gyro,
}

/// The attitude/bias estimator.
///
/// `handle_gyro` drives the predict step, `handle_acc`/`handle_mag` drive
/// measurement updates. Until [`Fusion::has_estimate`] is true the engine is
/// still bootstrapping and `get_attitude`/`get_bias`/`get_rotation_matrix`
/// are not meaningful.
pub struct Fusion {
    mode: FusionMode,
    params: Parameters,
    /// Reference gravity direction in the body frame at rest, in the
    /// engine's working units (unit vector).
    reference_up: Vec3,
    /// Reference magnetic north-ish direction in the body frame at rest.
    reference_north: Vec3,
    /// Orientation estimate, body-to-world, scalar-last.
    orientation: Quaternion,
    /// Gyro bias estimate, rad/s.
    bias: Vec3,
    /// 6x6 covariance as a 2x2 block of 3x3 matrices:
    /// `[[P_oo, P_ob], [P_bo, P_bb]]`.
    p: [[Mat33; 2]; 2],
    /// Process noise covariance for one predict step at the bootstrap
    /// sample interval, recomputed whenever bootstrap completes.
    gqgt: [[Mat33; 2]; 2],
    /// State-transition blocks from the most recent predict step, reused by
    /// the covariance propagation.
    phi0: [Mat33; 2],
    bootstrap: Accumulators,
    fake_mag_elapsed: f32,
}

impl Fusion {
    /// Builds a new engine for the given mode. Equivalent to calling
    /// [`Fusion::init`] with `mode` on a blank engine.
    pub fn new(mode: FusionMode) -> Fusion {
        let mut engine = Fusion {
            mode,
            params: Parameters::for_mode(&mode),
            reference_up: Vec3::new(0.0, 0.0, 1.0),
            reference_north: Vec3::new(0.0, 1.0, 0.0),
            orientation: Quaternion::IDENTITY,
            bias: Vec3::ZERO,
            p: zero_block(),
            gqgt: zero_block(),
            phi0: [Mat33::ZERO; 2],
            bootstrap: Accumulators::new(),
            fake_mag_elapsed: 0.0,
        };
        engine.bootstrap.narrow(&Readiness::required(&mode));
        engine
    }

    /// Re-applies mode flags to an existing engine. When
    /// [`FusionMode::should_reinitialize`] is set this fully resets state
    /// and bootstrap progress; otherwise it only narrows readiness to what
    /// the new mode requires, preserving any bootstrap progress still valid
    /// under the new mode.
    pub fn init(&mut self, mode: FusionMode) {
        self.mode = mode;
        self.params = Parameters::for_mode(&mode);
        if mode.should_reinitialize() {
            self.reference_up = Vec3::new(0.0, 0.0, 1.0);
            self.reference_north = Vec3::new(0.0, 1.0, 0.0);
            self.orientation = Quaternion::IDENTITY;
            self.bias = Vec3::ZERO;
            self.p = zero_block();
            self.gqgt = zero_block();
            self.phi0 = [Mat33::ZERO; 2];
            self.bootstrap.reset();
            self.fake_mag_elapsed = 0.0;
        } else {
            self.bootstrap.narrow(&Readiness::required(&mode));
        }
    }

    /// Whether bootstrap has completed and the state estimate is valid.
    pub fn has_estimate(&self) -> bool {
        self.bootstrap.readiness().satisfied(&Readiness::required(&self.mode))
    }

    pub fn get_attitude(&self) -> Quaternion {
        self.orientation
    }

    pub fn get_bias(&self) -> Vec3 {
        self.bias
    }

    /// The current world-to-body rotation matrix: `get_rotation_matrix() * v`
    /// maps a vector expressed in the world (reference) frame into the body
    /// frame.
    pub fn get_rotation_matrix(&self) -> Mat33 {
        self.world_to_body_matrix()
    }

    fn world_to_body_matrix(&self) -> Mat33 {
        quaternion_to_matrix(self.orientation).transpose()
    }

    /// Gyroscope sample: angular rate `w` (rad/s) and the elapsed time `dt`
    /// (s) since the previous sample. Drives the predict step once
    /// bootstrap has completed.
    pub fn handle_gyro(&mut self, w: Vec3, dt: f32) {
        if !self.bootstrap_step(Sensor::Gyro, w, dt) {
            return;
        }
        self.predict(w, dt);
    }

    /// Accelerometer sample, in units of local gravity, and the elapsed
    /// time `dt` (s) since the previous accelerometer sample.
    pub fn handle_acc(&mut self, a: Vec3, dt: f32) -> SampleOutcome {
        if !self.bootstrap_step(Sensor::Acc, a, dt) {
            return SampleOutcome::BootstrapPending;
        }

        let norm_sq = a.norm_squared();
        if norm_sq < FREE_FALL_THRESHOLD_SQ {
            return SampleOutcome::OutOfEnvelope(RejectReason::FreeFall);
        }
        let norm = norm_sq.sqrt();
        let inv_norm = norm.recip();

        if !self.mode.use_gyro() {
            // No gyroscope: synthesize a non-zero rate from the bias
            // estimate so predict still advances the covariance in time.
            let dummy_rate = self.bias
                + Vec3::new(GEOMAG_DUMMY_RATE_EPS, GEOMAG_DUMMY_RATE_EPS, GEOMAG_DUMMY_RATE_EPS);
            self.predict(dummy_rate, dt);
        }

        if !self.mode.use_mag() {
            self.fake_mag_elapsed += dt;
            if self.fake_mag_elapsed > FAKE_MAG_INTERVAL {
                let predicted_north = self.world_to_body_matrix() * self.reference_north;
                self.update(predicted_north, self.reference_north, self.params.mag_stdev);
                self.fake_mag_elapsed = 0.0;
            }
        }

        let unit_a = a.scale(inv_norm);
        let deviation = (norm - 9.81).abs().sqrt();
        let sigma = inv_norm * self.params.acc_stdev * deviation.exp();
        self.update(unit_a, self.reference_up, sigma);

        SampleOutcome::Accepted
    }

    /// Magnetometer sample, in arbitrary consistent units (the engine only
    /// cares about direction and a plausibility envelope on magnitude).
    pub fn handle_mag(&mut self, m: Vec3) -> SampleOutcome {
        if !self.bootstrap_step(Sensor::Mag, m, 0.0) {
            return SampleOutcome::BootstrapPending;
        }

        let mag_sq = m.norm_squared();
        if mag_sq > MAX_VALID_MAG_FIELD_SQ || mag_sq < MIN_VALID_MAG_FIELD_SQ {
            return SampleOutcome::OutOfEnvelope(RejectReason::MagFieldOutOfRange);
        }

        let predicted_up = self.world_to_body_matrix() * self.reference_up;
        let east = m.cross(&predicted_up);
        if east.norm_squared() < MIN_VALID_CROSS_PRODUCT_SQ {
            return SampleOutcome::OutOfEnvelope(RejectReason::MagParallelToGravity);
        }

        let north = predicted_up.cross(&east);
        let north_norm = north.norm();
        let inv_norm = north_norm.recip();
        let unit_north = north.scale(inv_norm);
        self.update(unit_north, self.reference_north, self.params.mag_stdev * inv_norm);
        SampleOutcome::Accepted
    }

    /// Feeds `d` into the bootstrap accumulator for sensor `what` if the
    /// engine isn't ready yet. Returns `true` if the caller should proceed
    /// with predict/update. If this call is the one that completes
    /// bootstrap, the sample is still only consumed by the accumulator;
    /// predict/update resumes on the next sample.
    fn bootstrap_step(&mut self, what: Sensor, d: Vec3, dt: f32) -> bool {
        if self.has_estimate() {
            return true;
        }
        match what {
            Sensor::Acc => self.bootstrap.record_acc(d, dt, self.mode.use_gyro()),
            Sensor::Mag => self.bootstrap.record_mag(d),
            Sensor::Gyro => self.bootstrap.record_gyro(dt),
        }
        if self.has_estimate() {
            let (r, sample_interval) = self.bootstrap.finalize(&self.mode);
            self.seed(r, sample_interval);
        }
        false
    }

    /// Seeds orientation and process noise from a completed bootstrap.
    fn seed(&mut self, world_to_body: Mat33, dt: f32) {
        self.orientation = matrix_to_quaternion(world_to_body.transpose());
        self.bias = Vec3::ZERO;

        let dt2 = dt * dt;
        let dt3 = dt2 * dt;
        let q_oo = self.params.gyro_var * dt + self.params.gyro_bias_var * dt3 / 3.0;
        let q_ob = 0.5 * self.params.gyro_bias_var * dt2;
        let q_bb = self.params.gyro_var * dt;

        self.gqgt[0][0] = Mat33::diagonal(q_oo);
        self.gqgt[0][1] = Mat33::diagonal(-q_ob);
        self.gqgt[1][0] = Mat33::diagonal(-q_ob);
        self.gqgt[1][1] = Mat33::diagonal(q_bb);
        self.p = zero_block();
    }

    /// Propagates orientation, and the covariance through the linearized
    /// state transition, by `dt` seconds at angular rate `w`.
    fn predict(&mut self, w: Vec3, dt: f32) {
        let we = w - self.bias;
        let norm_we = we.norm();
        if norm_we < PREDICT_SINGULARITY_EPS {
            return;
        }
        let inv = norm_we.recip();
        let theta = norm_we * dt;
        let half_theta = 0.5 * theta;
        let k0 = (1.0 - theta.cos()) * inv * inv;
        let k1 = theta.sin();
        let k2 = half_theta.cos();
        let psi = we.scale(half_theta.sin() * inv);

        self.orientation = apply_kinematics_step(psi, k2, self.orientation).canonicalized();

        let we_skew = skew(we);
        let we_skew2 = we_skew * we_skew;
        let identity = Mat33::identity();

        self.phi0[0] = identity - we_skew * (k1 * inv) + we_skew2 * k0;
        self.phi0[1] =
            we_skew * k0 - identity * dt - we_skew2 * (inv * inv * inv * (theta - k1));

        let p = self.p;
        let p_oo = self.phi0[0] * p[0][0] + self.phi0[1] * p[1][0];
        let p_ob = self.phi0[0] * p[0][1] + self.phi0[1] * p[1][1];

        self.p[0][0] = p_oo * self.phi0[0].transpose() + p_ob * self.phi0[1].transpose();
        self.p[0][1] = p_ob;
        self.p[1][0] = p[1][0] * self.phi0[0].transpose() + p[1][1] * self.phi0[1].transpose();
        self.p[1][1] = p[1][1];

        for i in 0..2 {
            for j in 0..2 {
                self.p[i][j] = self.p[i][j] + self.gqgt[i][j];
            }
        }

        self.check_covariance();
    }

    /// Fuses a unit-vector measurement `z` (body frame) against reference
    /// direction `bi` (world frame) with isotropic standard deviation
    /// `sigma`.
    fn update(&mut self, z: Vec3, bi: Vec3, sigma: f32) {
        let predicted = self.world_to_body_matrix() * bi;
        let l = skew(predicted);
        let s = sandwich(&l, &self.p[0][0]) + Mat33::diagonal(sigma * sigma);
        let s_inv = match s.invert() {
            Some(inv) => inv,
            None => return,
        };

        let lt_s_inv = l.transpose() * s_inv;
        let k0 = self.p[0][0] * lt_s_inv;
        let k1 = self.p[0][1].transpose() * lt_s_inv;

        let p00_old = self.p[0][0];
        let p01_old = self.p[0][1];
        let k0l = k0 * l;
        let k1l = k1 * l;

        self.p[0][0] = p00_old - k0l * p00_old;
        self.p[1][1] = self.p[1][1] - k1l * p01_old;
        self.p[0][1] = p01_old - k0l * p01_old;
        self.p[1][0] = self.p[0][1].transpose();

        let innovation = z - predicted;
        let dq = k0 * innovation;
        self.orientation = apply_orientation_correction(self.orientation, dq);

        if self.mode.use_mag() {
            let db = k1 * innovation;
            self.bias = self.bias + db;
        }

        self.check_covariance();
    }

    /// Zeros the whole covariance if either diagonal block stops being
    /// symmetric positive semidefinite within tolerance, recovering from
    /// accumulated floating-point drift rather than propagating garbage.
    fn check_covariance(&mut self) {
        let ok = self.p[0][0].is_positive_semidefinite(SYMMETRY_TOLERANCE)
            && self.p[1][1].is_positive_semidefinite(SYMMETRY_TOLERANCE);
        if !ok {
            self.p = zero_block();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bootstrap_stationary(engine: &mut Fusion, mode: &FusionMode) {
        for _ in 0..40 {
            if mode.use_gyro() {
                engine.handle_gyro(Vec3::ZERO, 0.01);
            }
            let outcome = engine.handle_acc(Vec3::new(0.0, 0.0, 1.0), 0.01);
            if mode.use_mag() {
                engine.handle_mag(Vec3::new(0.0, 1.0, 0.3));
            }
            if outcome.is_accepted() {
                break;
            }
        }
    }

    #[test]
    fn stationary_bootstrap_converges_to_identity() {
        let mut engine = Fusion::new(FusionMode::full_9dof());
        bootstrap_stationary(&mut engine, &FusionMode::full_9dof());
        assert!(engine.has_estimate());
        let q = engine.get_attitude();
        assert_relative_eq!(q.w, 1.0, epsilon = 1e-2);
    }

    /// Roll/pitch/yaw (rad) from a body-to-world quaternion, in the same
    /// XYZ-intrinsic sequence `quaternion_to_matrix` implements.
    fn roll_pitch_yaw(q: Quaternion) -> (f32, f32, f32) {
        let roll = (2.0 * (q.w * q.x + q.y * q.z)).atan2(1.0 - 2.0 * (q.x * q.x + q.y * q.y));
        let pitch = (2.0 * (q.w * q.y - q.z * q.x)).clamp(-1.0, 1.0).asin();
        let yaw = (2.0 * (q.w * q.z + q.x * q.y)).atan2(1.0 - 2.0 * (q.y * q.y + q.z * q.z));
        (roll, pitch, yaw)
    }

    #[test]
    fn pure_yaw_rotation_tracks_gyro_integral() {
        let mut engine = Fusion::new(FusionMode::full_9dof());
        bootstrap_stationary(&mut engine, &FusionMode::full_9dof());

        let rate = core::f32::consts::FRAC_PI_2; // rad/s about +Z
        let dt = 0.01;
        for _ in 0..100 {
            engine.handle_gyro(Vec3::new(0.0, 0.0, rate), dt);
        }
        let world_to_body = engine.get_rotation_matrix();
        // The world "up" vector should still map to body "up": pure yaw
        // does not tilt the device.
        let up = world_to_body * Vec3::new(0.0, 0.0, 1.0);
        assert_relative_eq!(up.z, 1.0, epsilon = 5e-2);

        let (roll, pitch, yaw) = roll_pitch_yaw(engine.get_attitude());
        assert_relative_eq!(yaw, core::f32::consts::FRAC_PI_2, epsilon = 5e-3);
        assert!(roll.abs() < 5e-3, "roll drifted during pure yaw: {roll}");
        assert!(pitch.abs() < 5e-3, "pitch drifted during pure yaw: {pitch}");
    }

    #[test]
    fn free_fall_is_rejected() {
        let mut engine = Fusion::new(FusionMode::full_9dof());
        bootstrap_stationary(&mut engine, &FusionMode::full_9dof());
        let outcome = engine.handle_acc(Vec3::new(0.0, 0.0, 0.01), 0.01);
        assert_eq!(outcome, SampleOutcome::OutOfEnvelope(RejectReason::FreeFall));
    }

    #[test]
    fn mag_field_out_of_range_is_rejected() {
        let mut engine = Fusion::new(FusionMode::full_9dof());
        bootstrap_stationary(&mut engine, &FusionMode::full_9dof());
        let outcome = engine.handle_mag(Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(outcome, SampleOutcome::OutOfEnvelope(RejectReason::MagFieldOutOfRange));
    }

    #[test]
    fn mag_parallel_to_gravity_is_rejected() {
        let mut engine = Fusion::new(FusionMode::full_9dof());
        bootstrap_stationary(&mut engine, &FusionMode::full_9dof());
        // Reference up is +Z; a mag reading pointing straight up/down is
        // degenerate for heading.
        let outcome = engine.handle_mag(Vec3::new(0.0, 0.0, 40.0));
        assert_eq!(outcome, SampleOutcome::OutOfEnvelope(RejectReason::MagParallelToGravity));
    }

    #[test]
    fn game_rotation_mode_runs_without_magnetometer() {
        let mut engine = Fusion::new(FusionMode::game_rotation());
        bootstrap_stationary(&mut engine, &FusionMode::game_rotation());
        assert!(engine.has_estimate());
        for _ in 0..150 {
            engine.handle_gyro(Vec3::new(0.01, 0.0, 0.0), 0.01);
            engine.handle_acc(Vec3::new(0.0, 0.0, 1.0), 0.01);
        }
        // Should still produce a finite, roughly unit quaternion.
        let q = engine.get_attitude();
        assert_relative_eq!(q.norm(), 1.0, epsilon = 1e-2);
    }

    #[test]
    fn geomag_mode_runs_without_gyroscope() {
        let mut engine = Fusion::new(FusionMode::geomag());
        bootstrap_stationary(&mut engine, &FusionMode::geomag());
        assert!(engine.has_estimate());
        for _ in 0..50 {
            let outcome = engine.handle_acc(Vec3::new(0.0, 0.0, 1.0), 0.02);
            assert_ne!(outcome, SampleOutcome::BootstrapPending);
            engine.handle_mag(Vec3::new(0.0, 1.0, 0.3));
        }
        let q = engine.get_attitude();
        assert_relative_eq!(q.norm(), 1.0, epsilon = 1e-2);
    }

    #[test]
    fn bias_is_frozen_in_game_rotation_mode() {
        let mut engine = Fusion::new(FusionMode::game_rotation());
        bootstrap_stationary(&mut engine, &FusionMode::game_rotation());
        for _ in 0..100 {
            engine.handle_gyro(Vec3::new(0.02, 0.0, 0.0), 0.01);
            engine.handle_acc(Vec3::new(0.0, 0.02, 1.0), 0.01);
        }
        assert_relative_eq!(engine.get_bias().norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn reinitialize_clears_bootstrap_progress() {
        let mut engine = Fusion::new(FusionMode::full_9dof());
        bootstrap_stationary(&mut engine, &FusionMode::full_9dof());
        assert!(engine.has_estimate());
        engine.init(FusionMode::full_9dof().reinitialize());
        assert!(!engine.has_estimate());
    }

    #[test]
    fn predict_canonicalizes_scalar_part_non_negative() {
        let mut engine = Fusion::new(FusionMode::full_9dof());
        bootstrap_stationary(&mut engine, &FusionMode::full_9dof());
        // theta = |w| * dt = 4 rad, past pi: the raw closed-form update would
        // flip the scalar part negative without canonicalization.
        engine.handle_gyro(Vec3::new(0.0, 0.0, 400.0), 0.01);
        assert!(engine.get_attitude().w >= 0.0);
    }

    fn trace(block: Mat33) -> f32 {
        block.m[0][0] + block.m[1][1] + block.m[2][2]
    }

    #[test]
    fn game_mode_heartbeat_keeps_orientation_covariance_bounded() {
        let mut engine = Fusion::new(FusionMode::game_rotation());
        bootstrap_stationary(&mut engine, &FusionMode::game_rotation());
        for _ in 0..250 {
            engine.handle_gyro(Vec3::ZERO, 0.01);
            engine.handle_acc(Vec3::new(0.0, 0.0, 1.0), 0.01);
        }
        let t = trace(engine.p[0][0]);
        assert!(t.is_finite() && t < 10.0, "orientation covariance trace diverged: {t}");
    }

    #[test]
    fn geomag_mode_updates_shrink_covariance_growth() {
        let mut engine = Fusion::new(FusionMode::geomag());
        bootstrap_stationary(&mut engine, &FusionMode::geomag());
        for _ in 0..100 {
            engine.handle_acc(Vec3::new(0.0, 0.0, 1.0), 0.05);
            engine.handle_mag(Vec3::new(0.0, 1.0, 0.3));
        }
        let t = trace(engine.p[0][0]);
        assert!(t.is_finite() && t >= 0.0);
        assert!(t < 1.0, "updates should keep orientation covariance small: {t}");
    }
}
