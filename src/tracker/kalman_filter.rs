//! Constant-velocity Kalman filter over `[cx, cy, vx, vy, w, h, vw, vh]`,
//! using ndarray for the state and nalgebra for the 4x4 innovation inverse.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Pivot magnitude below which the innovation matrix is treated as singular.
const SINGULAR_EPSILON: f64 = 1e-12;
/// Replacement value for a singular pivot.
const PIVOT_FLOOR: f64 = 1e-6;

/// State layout indices.
const CX: usize = 0;
const CY: usize = 1;
const VX: usize = 2;
const VY: usize = 3;
const W: usize = 4;
const H: usize = 5;
const VW: usize = 6;
const VH: usize = 7;

/// Measured components, in measurement order `[cx, cy, w, h]`.
const MEASURED: [usize; 4] = [CX, CY, W, H];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalmanConfig {
    /// Time step between predictions, in frames.
    pub dt: f64,
    /// Process noise standard deviation (σp), applied to the diagonal of Q.
    pub process_noise: f64,
    /// Measurement noise standard deviation (σm), applied to the diagonal of R.
    pub measurement_noise: f64,
    /// Diagonal of the initial state covariance.
    pub initial_covariance: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            dt: 1.0,
            process_noise: 1.0,
            measurement_noise: 1.0,
            initial_covariance: 1000.0,
        }
    }
}

/// Per-track filter state: 8-D mean and 8x8 covariance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalmanState {
    pub mean: Array1<f64>,
    pub covariance: Array2<f64>,
}

impl KalmanState {
    /// Estimated `[cx, cy, w, h]`.
    pub fn measurement(&self) -> [f64; 4] {
        MEASURED.map(|i| self.mean[i])
    }
}

#[derive(Debug, Clone)]
pub struct KalmanFilter {
    motion_mat: Array2<f64>,
    update_mat: Array2<f64>,
    process_cov: Array2<f64>,
    measurement_cov: Array2<f64>,
    initial_covariance: f64,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new(KalmanConfig::default())
    }
}

impl KalmanFilter {
    pub fn new(config: KalmanConfig) -> Self {
        let mut motion_mat = Array2::eye(8);
        motion_mat[[CX, VX]] = config.dt;
        motion_mat[[CY, VY]] = config.dt;
        motion_mat[[W, VW]] = config.dt;
        motion_mat[[H, VH]] = config.dt;

        let mut update_mat = Array2::zeros((4, 8));
        for (row, &col) in MEASURED.iter().enumerate() {
            update_mat[[row, col]] = 1.0;
        }

        let process_cov = Array2::eye(8) * config.process_noise.powi(2);
        let measurement_cov = Array2::eye(4) * config.measurement_noise.powi(2);

        Self {
            motion_mat,
            update_mat,
            process_cov,
            measurement_cov,
            initial_covariance: config.initial_covariance,
        }
    }

    /// Create a state from a first measurement `[cx, cy, w, h]`; velocities start at zero.
    pub fn initiate(&self, measurement: [f64; 4]) -> KalmanState {
        let mut mean = Array1::zeros(8);
        for (value, &idx) in measurement.iter().zip(MEASURED.iter()) {
            mean[idx] = *value;
        }
        let covariance = Array2::eye(8) * self.initial_covariance;
        KalmanState { mean, covariance }
    }

    /// Run the prediction step: x' = F x, P' = F P Fᵀ + Q.
    pub fn predict(&self, state: &KalmanState) -> KalmanState {
        let mean = self.motion_mat.dot(&state.mean);
        let covariance =
            self.motion_mat.dot(&state.covariance).dot(&self.motion_mat.t()) + &self.process_cov;
        KalmanState { mean, covariance }
    }

    /// Project the state into measurement space, returning (H x, H P Hᵀ + R).
    pub fn project(&self, state: &KalmanState) -> (Array1<f64>, Array2<f64>) {
        let mean_proj = self.update_mat.dot(&state.mean);
        let covariance_proj = self
            .update_mat
            .dot(&state.covariance)
            .dot(&self.update_mat.t())
            + &self.measurement_cov;
        (mean_proj, covariance_proj)
    }

    /// Run the correction step with a measurement `[cx, cy, w, h]`.
    pub fn update(&self, state: &KalmanState, measurement: [f64; 4]) -> KalmanState {
        let (projected_mean, projected_cov) = self.project(state);

        let innovation = Array1::from_vec(measurement.to_vec()) - projected_mean;

        // K = P Hᵀ S⁻¹
        let s_inv = invert_4x4(&projected_cov);
        let pht = state.covariance.dot(&self.update_mat.t()); // 8x4
        let kalman_gain = pht.dot(&s_inv); // 8x4

        let mean = &state.mean + &kalman_gain.dot(&innovation);
        let covariance =
            &state.covariance - &kalman_gain.dot(&projected_cov).dot(&kalman_gain.t());

        KalmanState { mean, covariance }
    }
}

/// Invert a 4x4 matrix with nalgebra, falling back to Gauss-Jordan with a
/// floored pivot when the matrix is singular. Never fails.
fn invert_4x4(m: &Array2<f64>) -> Array2<f64> {
    let mut nm = nalgebra::Matrix4::zeros();
    for i in 0..4 {
        for j in 0..4 {
            nm[(i, j)] = m[[i, j]];
        }
    }

    match nm.try_inverse() {
        Some(inv) if inv.iter().all(|v| v.is_finite()) => {
            let mut res = Array2::zeros((4, 4));
            for i in 0..4 {
                for j in 0..4 {
                    res[[i, j]] = inv[(i, j)];
                }
            }
            res
        }
        _ => gauss_jordan_floored(m),
    }
}

fn gauss_jordan_floored(m: &Array2<f64>) -> Array2<f64> {
    let mut a = [[0.0f64; 8]; 4];
    for i in 0..4 {
        for j in 0..4 {
            a[i][j] = if m[[i, j]].is_finite() { m[[i, j]] } else { 0.0 };
        }
        a[i][4 + i] = 1.0;
    }

    for col in 0..4 {
        // Partial pivoting on the remaining rows.
        let mut pivot_row = col;
        for row in (col + 1)..4 {
            if a[row][col].abs() > a[pivot_row][col].abs() {
                pivot_row = row;
            }
        }
        a.swap(col, pivot_row);

        if a[col][col].abs() < SINGULAR_EPSILON {
            a[col][col] = PIVOT_FLOOR;
        }

        let pivot = a[col][col];
        for v in a[col].iter_mut() {
            *v /= pivot;
        }

        for row in 0..4 {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for k in 0..8 {
                a[row][k] -= factor * a[col][k];
            }
        }
    }

    let mut res = Array2::zeros((4, 4));
    for i in 0..4 {
        for j in 0..4 {
            res[[i, j]] = a[i][4 + j];
        }
    }
    res
}
