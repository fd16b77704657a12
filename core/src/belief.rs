//! Kalman beliefs and constant-velocity motion models
//!
//! A particle's continuous state is a Gaussian belief in one of two regimes:
//!
//! - ground (off-road): `[x, ẋ, y, ẏ]` in local east/north meters and m/s,
//! - road (on-road): `[s, ṡ]`, the distance along the current edge from its first vertex and
//!   the signed speed along it.
//!
//! Both regimes use a constant-velocity model driven by white acceleration noise, so the
//! process noise grows with the time between fixes. Beliefs are immutable: every prediction,
//! correction and regime conversion returns a new value.
use nalgebra::{DMatrix, DVector, Matrix2, Vector2};

use crate::linalg::{gaussian_log_likelihood, robust_spd_solve, symmetrize};
use crate::road::RoadEdge;

/// Dimension of the off-road state `[x, ẋ, y, ẏ]`.
pub const GROUND_STATE_DIM: usize = 4;
/// Dimension of the on-road state `[s, ṡ]`.
pub const ROAD_STATE_DIM: usize = 2;

/// Gaussian belief: mean vector and symmetric covariance.
#[derive(Clone, Debug, PartialEq)]
pub struct Belief {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
}

impl Belief {
    pub fn new(mean: DVector<f64>, covariance: DMatrix<f64>) -> Self {
        Belief {
            mean,
            covariance: symmetrize(&covariance),
        }
    }

    /// Ground belief centered on `position` moving with `velocity`, with independent
    /// position and velocity variances.
    pub fn ground(
        position: Vector2<f64>,
        velocity: Vector2<f64>,
        position_variance: f64,
        velocity_variance: f64,
    ) -> Self {
        Belief::new(
            DVector::from_vec(vec![position.x, velocity.x, position.y, velocity.y]),
            DMatrix::from_diagonal(&DVector::from_vec(vec![
                position_variance,
                velocity_variance,
                position_variance,
                velocity_variance,
            ])),
        )
    }

    /// Road belief at `distance` along an edge with along-edge `speed`.
    pub fn road(distance: f64, speed: f64, covariance: Matrix2<f64>) -> Self {
        Belief::new(
            DVector::from_vec(vec![distance, speed]),
            DMatrix::from_iterator(2, 2, covariance.iter().cloned()),
        )
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
    pub fn dimension(&self) -> usize {
        self.mean.len()
    }
    pub fn is_road(&self) -> bool {
        self.mean.len() == ROAD_STATE_DIM
    }

    /// Position mean of a ground belief.
    pub fn ground_position(&self) -> Vector2<f64> {
        Vector2::new(self.mean[0], self.mean[2])
    }
    /// Velocity mean of a ground belief.
    pub fn ground_velocity(&self) -> Vector2<f64> {
        Vector2::new(self.mean[1], self.mean[3])
    }
    /// 2x2 position block of a ground belief's covariance.
    pub fn ground_position_covariance(&self) -> Matrix2<f64> {
        let p = &self.covariance;
        Matrix2::new(p[(0, 0)], p[(0, 2)], p[(2, 0)], p[(2, 2)])
    }

    /// Linear propagation `x ← A x`, `P ← A P Aᵀ + Q`.
    pub fn transform(&self, a: &DMatrix<f64>, q: &DMatrix<f64>) -> Belief {
        Belief::new(a * &self.mean, a * &self.covariance * a.transpose() + q)
    }

    /// Kalman measurement update with observation matrix `h`, noise `r` and measurement `z`.
    ///
    /// Uses the Joseph form for the covariance. If the innovation covariance cannot be
    /// inverted the belief is returned unchanged.
    pub fn correct(&self, h: &DMatrix<f64>, r: &DMatrix<f64>, z: &DVector<f64>) -> Belief {
        let p = &self.covariance;
        let s = h * p * h.transpose() + r;
        // Kᵀ = S⁻¹ H P
        let Some(k_t) = robust_spd_solve(&s, &(h * p)) else {
            return self.clone();
        };
        let k = k_t.transpose();
        let innovation = z - h * &self.mean;
        let i_kh = DMatrix::<f64>::identity(self.dimension(), self.dimension()) - &k * h;
        let covariance = &i_kh * p * i_kh.transpose() + &k * r * k.transpose();
        Belief::new(&self.mean + &k * innovation, covariance)
    }

    /// Log-likelihood of `z` under the predicted measurement distribution `N(H x, H P Hᵀ + R)`.
    pub fn innovation_log_likelihood(
        &self,
        h: &DMatrix<f64>,
        r: &DMatrix<f64>,
        z: &DVector<f64>,
    ) -> f64 {
        let s = h * &self.covariance * h.transpose() + r;
        gaussian_log_likelihood(&(z - h * &self.mean), &s)
    }
}

/// Observation matrix selecting the position from a ground state.
pub fn ground_observation_matrix() -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 4, &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0])
}

/// Observation matrix selecting the along-edge distance from a road state.
pub fn road_observation_matrix() -> DMatrix<f64> {
    DMatrix::from_row_slice(1, 2, &[1.0, 0.0])
}

/// White-acceleration constant-velocity model for both regimes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionModel {
    /// Along-edge acceleration variance (m²/s⁴)
    pub on_road_accel_variance: f64,
    /// Per-axis ground acceleration variance (m²/s⁴)
    pub off_road_accel_variance: f64,
}

impl MotionModel {
    /// Predict a belief `dt` seconds ahead in its own regime. Negative `dt` is treated as zero.
    pub fn predict(&self, belief: &Belief, dt: f64) -> Belief {
        let dt = dt.max(0.0);
        if belief.is_road() {
            belief.transform(&road_transition(dt), &self.road_process_noise(dt))
        } else {
            belief.transform(&ground_transition(dt), &self.ground_process_noise(dt))
        }
    }

    pub fn road_process_noise(&self, dt: f64) -> DMatrix<f64> {
        let g = DMatrix::from_row_slice(2, 1, &[0.5 * dt * dt, dt]);
        &g * g.transpose() * self.on_road_accel_variance
    }

    pub fn ground_process_noise(&self, dt: f64) -> DMatrix<f64> {
        let half_dt2 = 0.5 * dt * dt;
        let g = DMatrix::from_row_slice(4, 2, &[half_dt2, 0.0, dt, 0.0, 0.0, half_dt2, 0.0, dt]);
        &g * g.transpose() * self.off_road_accel_variance
    }
}

pub fn road_transition(dt: f64) -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 2, &[1.0, dt, 0.0, 1.0])
}

pub fn ground_transition(dt: f64) -> DMatrix<f64> {
    DMatrix::from_row_slice(
        4,
        4,
        &[
            1.0, dt, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, dt, //
            0.0, 0.0, 0.0, 1.0,
        ],
    )
}

/// Express a road belief on `edge` as a ground belief.
///
/// The along-edge distance maps onto the edge polyline and the speed onto its tangent, so
/// the ground covariance is the road covariance stretched along that tangent.
pub fn road_to_ground(belief: &Belief, edge: &RoadEdge) -> Belief {
    let (point, u) = edge.point_at(belief.mean[0]);
    let speed = belief.mean[1];
    let j = DMatrix::from_row_slice(4, 2, &[u.x, 0.0, 0.0, u.x, u.y, 0.0, 0.0, u.y]);
    Belief::new(
        DVector::from_vec(vec![point.x, speed * u.x, point.y, speed * u.y]),
        &j * &belief.covariance * j.transpose(),
    )
}

/// Project a ground belief onto `edge`: position onto the polyline, velocity onto its tangent.
pub fn ground_to_road(belief: &Belief, edge: &RoadEdge) -> Belief {
    let projection = edge.project(&belief.ground_position());
    let u = projection.tangent;
    let speed = u.dot(&belief.ground_velocity());
    let j = DMatrix::from_row_slice(2, 4, &[u.x, 0.0, u.y, 0.0, 0.0, u.x, 0.0, u.y]);
    Belief::new(
        DVector::from_vec(vec![projection.distance_along, speed]),
        &j * &belief.covariance * j.transpose(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::road::EdgeId;
    use assert_approx_eq::assert_approx_eq;

    fn model() -> MotionModel {
        MotionModel {
            on_road_accel_variance: 1.0,
            off_road_accel_variance: 2.0,
        }
    }

    fn north_edge() -> RoadEdge {
        RoadEdge::new(
            EdgeId(1),
            "north",
            1,
            2,
            vec![Vector2::new(10.0, 0.0), Vector2::new(10.0, 100.0)],
        )
        .unwrap()
    }

    #[test]
    fn ground_prediction_moves_with_velocity() {
        let b = Belief::ground(Vector2::new(0.0, 0.0), Vector2::new(3.0, -1.0), 4.0, 1.0);
        let p = model().predict(&b, 2.0);
        assert_approx_eq!(p.mean()[0], 6.0, 1e-12);
        assert_approx_eq!(p.mean()[2], -2.0, 1e-12);
        // var_x = 4 + dt² var_v + dt⁴/4 q = 4 + 4 + 8
        assert_approx_eq!(p.covariance()[(0, 0)], 16.0, 1e-12);
        assert_eq!(p.covariance(), &p.covariance().transpose());
    }

    #[test]
    fn process_noise_grows_with_elapsed_time() {
        let m = model();
        let short = m.road_process_noise(1.0);
        let long = m.road_process_noise(10.0);
        assert!(long[(0, 0)] > short[(0, 0)]);
        assert!(long[(1, 1)] > short[(1, 1)]);
        assert_eq!(m.road_process_noise(0.0), DMatrix::zeros(2, 2));
    }

    #[test]
    fn zero_or_negative_dt_leaves_belief_unchanged() {
        let b = Belief::road(5.0, 2.0, Matrix2::new(1.0, 0.0, 0.0, 1.0));
        assert_eq!(model().predict(&b, -3.0), b);
    }

    #[test]
    fn correction_pulls_toward_measurement() {
        let b = Belief::ground(Vector2::new(0.0, 0.0), Vector2::zeros(), 100.0, 1.0);
        let h = ground_observation_matrix();
        let r = DMatrix::identity(2, 2) * 100.0;
        let z = DVector::from_vec(vec![10.0, -4.0]);
        let c = b.correct(&h, &r, &z);
        assert_approx_eq!(c.mean()[0], 5.0, 1e-9);
        assert_approx_eq!(c.mean()[2], -2.0, 1e-9);
        assert_approx_eq!(c.covariance()[(0, 0)], 50.0, 1e-9);
        let ll_near = b.innovation_log_likelihood(&h, &r, &DVector::from_vec(vec![0.0, 0.0]));
        assert!(ll_near > b.innovation_log_likelihood(&h, &r, &z));
    }

    #[test]
    fn road_ground_conversions_agree() {
        let edge = north_edge();
        let road = Belief::road(30.0, -2.0, Matrix2::new(4.0, 0.0, 0.0, 1.0));
        let ground = road_to_ground(&road, &edge);
        assert_approx_eq!(ground.ground_position().x, 10.0, 1e-12);
        assert_approx_eq!(ground.ground_position().y, 30.0, 1e-12);
        assert_approx_eq!(ground.ground_velocity().y, -2.0, 1e-12);
        assert_approx_eq!(ground.ground_position_covariance()[(1, 1)], 4.0, 1e-12);
        assert_approx_eq!(ground.ground_position_covariance()[(0, 0)], 0.0, 1e-12);

        let back = ground_to_road(&ground, &edge);
        assert_approx_eq!(back.mean()[0], 30.0, 1e-12);
        assert_approx_eq!(back.mean()[1], -2.0, 1e-12);
        assert_approx_eq!(back.covariance()[(0, 0)], 4.0, 1e-12);
        assert_approx_eq!(back.covariance()[(1, 1)], 1.0, 1e-12);
    }
}
