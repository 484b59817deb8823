//! Perspective-n-point pose estimation.
//!
//! Recovers the rotation and translation that map model coordinates into the
//! camera frame from at least four 2D-3D correspondences and the camera
//! intrinsics (no lens distortion). Initial candidates come from Kneip's P3P
//! solver on triples of the first correspondences, the best one by
//! reprojection error is then refined with Levenberg-Marquardt over all
//! correspondences.

use nalgebra::{DMatrix, DVector, Matrix3, Point2, Point3, Rotation3, Schur, Vector3};
use thiserror::Error;
use tracing::debug;

/// Minimum number of correspondences the solver accepts
pub const MIN_POINTS: usize = 4;

const MAX_ITERATIONS: usize = 100;
const JACOBIAN_STEP: f64 = 1e-7;
const CONVERGENCE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PnpError {
    #[error("need at least {MIN_POINTS} correspondences, got {0}")]
    NotEnoughPoints(usize),

    #[error("got {points_2d} image points but {points_3d} model points")]
    MismatchedLengths { points_2d: usize, points_3d: usize },

    #[error("camera matrix is not invertible")]
    SingularIntrinsics,

    #[error("singular value decomposition failed")]
    SvdFailed,

    #[error("degenerate point configuration")]
    DegeneratePoints,

    #[error("no pose places every point in front of the camera")]
    NoSolution,
}

/// Result of a solve, in the convention `x_camera = R * x_model + t`
#[derive(Debug, Clone, PartialEq)]
pub struct PnpSolution {
    /// Rotation vector (axis scaled by the angle in radians)
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
    /// Mean distance in pixels between the observed and reprojected points
    pub reprojection_error: f64,
}

impl PnpSolution {
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        Rotation3::new(self.rotation).into_inner()
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
}

/// Estimate the pose of the model seen in the image.
///
/// `world` and `image` are matched index for index; `k` is the 3x3 intrinsic
/// matrix. Degenerate configurations are not rejected up front, they surface
/// as solver failures.
pub fn solve_pnp(world: &[Point3<f64>], image: &[Point2<f64>], k: &Matrix3<f64>) -> Result<PnpSolution, PnpError> {
    if world.len() != image.len() {
        return Err(PnpError::MismatchedLengths {
            points_2d: image.len(),
            points_3d: world.len(),
        });
    }
    if world.len() < MIN_POINTS {
        return Err(PnpError::NotEnoughPoints(world.len()));
    }
    let k_inv = k.try_inverse().ok_or(PnpError::SingularIntrinsics)?;

    let bearings: Vec<Vector3<f64>> = image
        .iter()
        .map(|p| (k_inv * Vector3::new(p.x, p.y, 1.0)).normalize())
        .collect();

    let seeds = world.len().min(MIN_POINTS);
    let mut best: Option<(f64, Candidate)> = None;
    let mut last_error = PnpError::NoSolution;

    for i in 0..seeds {
        for j in (i + 1)..seeds {
            for l in (j + 1)..seeds {
                let triple = [i, j, l];
                let candidates = match p3p(
                    &triple.map(|index| world[index]),
                    &triple.map(|index| bearings[index]),
                ) {
                    Ok(candidates) => candidates,
                    Err(e) => {
                        last_error = e;
                        continue;
                    }
                };

                for candidate in candidates {
                    if !in_front(&candidate, world) {
                        continue;
                    }
                    let error = mean_reprojection_error(&candidate, world, image, k);
                    if !error.is_finite() {
                        continue;
                    }
                    if best.as_ref().map_or(true, |(best_error, _)| error < *best_error) {
                        best = Some((error, candidate));
                    }
                }
            }
        }
    }

    let Some((initial_error, initial)) = best else {
        return Err(last_error);
    };

    let refined = refine(initial, world, image, k);
    let refined = if in_front(&refined, world) { refined } else { initial };
    let reprojection_error = mean_reprojection_error(&refined, world, image, k);

    debug!(
        points = world.len(),
        initial_error,
        reprojection_error,
        "solved perspective-n-point"
    );

    Ok(PnpSolution {
        rotation: Rotation3::from_matrix_unchecked(refined.rotation).scaled_axis(),
        translation: refined.translation,
        reprojection_error,
    })
}

/// Kneip's P3P: up to four poses from three points and their unit bearings
fn p3p(world: &[Point3<f64>; 3], bearings: &[Vector3<f64>; 3]) -> Result<Vec<Candidate>, PnpError> {
    let a = (world[1] - world[2]).norm();
    let b = (world[0] - world[2]).norm();
    let c = (world[0] - world[1]).norm();
    if a <= f64::EPSILON || b <= f64::EPSILON || c <= f64::EPSILON {
        return Err(PnpError::DegeneratePoints);
    }

    let cos_alpha = bearings[1].dot(&bearings[2]);
    let cos_beta = bearings[0].dot(&bearings[2]);
    let cos_gamma = bearings[0].dot(&bearings[1]);

    let (a2, b2, c2) = (a * a, b * b, c * c);
    let d = (b2 - a2) / c2;
    let e = b2 / c2;

    // v = n(u) / den(u), substituted into the law of cosines for AC
    let n = [1.0 - d, 2.0 * d * cos_gamma, -(1.0 + d)];
    let den = [2.0 * cos_beta, -2.0 * cos_alpha];
    let e_poly = [1.0 - e, 2.0 * e * cos_gamma, -e];

    let n2 = poly_mul(&n, &n);
    let nd = poly_mul(&n, &den);
    let d2 = poly_mul(&den, &den);
    let ed2 = poly_mul(&e_poly, &d2);

    let mut coefficients = [0.0; 5];
    for (power, coefficient) in coefficients.iter_mut().enumerate() {
        *coefficient = term(&n2, power) - 2.0 * cos_beta * term(&nd, power) + term(&ed2, power);
    }

    let mut candidates = Vec::new();
    for u in real_polynomial_roots(&coefficients) {
        let denominator = den[0] + den[1] * u;
        if denominator.abs() < 1e-12 {
            continue;
        }
        let k_val = 1.0 + u * u - 2.0 * u * cos_gamma;
        if k_val.abs() < 1e-12 {
            continue;
        }
        let v = (n[0] + n[1] * u + n[2] * u * u) / denominator;

        let x2 = c2 / k_val;
        if x2 <= 0.0 {
            continue;
        }
        let x = x2.sqrt();
        let camera = [bearings[0] * x, bearings[1] * (u * x), bearings[2] * (v * x)];

        if let Ok(candidate) = pose_from_points(world, &camera) {
            candidates.push(candidate);
        }
    }

    if candidates.is_empty() {
        return Err(PnpError::NoSolution);
    }
    Ok(candidates)
}

/// Rigid transform aligning model points with camera-frame points (Kabsch)
fn pose_from_points(world: &[Point3<f64>], camera: &[Vector3<f64>]) -> Result<Candidate, PnpError> {
    if world.len() != camera.len() || world.len() < 3 {
        return Err(PnpError::DegeneratePoints);
    }

    let count = world.len() as f64;
    let world_centroid = world.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / count;
    let camera_centroid = camera.iter().fold(Vector3::zeros(), |acc, p| acc + p) / count;

    let mut h = Matrix3::zeros();
    for (pw, pc) in world.iter().zip(camera) {
        h += (pc - camera_centroid) * (pw.coords - world_centroid).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u.ok_or(PnpError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(PnpError::SvdFailed)?;
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        rotation = u_fixed * v_t;
    }

    Ok(Candidate {
        rotation,
        translation: camera_centroid - rotation * world_centroid,
    })
}

/// Levenberg-Marquardt on the reprojection residuals.
///
/// Rotation updates are applied on the left as `exp(w) * R`, so the
/// parameters are `(w, t)` around the current estimate.
fn refine(initial: Candidate, world: &[Point3<f64>], image: &[Point2<f64>], k: &Matrix3<f64>) -> Candidate {
    let mut current = initial;
    let mut residual = residuals(&current, world, image, k);
    let mut cost = residual.norm_squared();
    let mut lambda = 1e-3;

    for _ in 0..MAX_ITERATIONS {
        if cost < CONVERGENCE {
            break;
        }

        let mut jacobian = DMatrix::zeros(residual.len(), 6);
        for param in 0..6 {
            let mut delta = [0.0; 6];
            delta[param] = JACOBIAN_STEP;
            let shifted = residuals(&apply_step(&current, &delta), world, image, k);
            jacobian.set_column(param, &((shifted - &residual) / JACOBIAN_STEP));
        }

        let jt = jacobian.transpose();
        let jtj = &jt * &jacobian;
        let gradient = -(&jt * &residual);

        let mut improved = false;
        while lambda < 1e12 {
            let mut damped = jtj.clone();
            for d in 0..6 {
                damped[(d, d)] += lambda * jtj[(d, d)].max(1e-9);
            }
            let Some(step) = damped.lu().solve(&gradient) else {
                lambda *= 10.0;
                continue;
            };

            let delta = [step[0], step[1], step[2], step[3], step[4], step[5]];
            let candidate = apply_step(&current, &delta);
            let candidate_residual = residuals(&candidate, world, image, k);
            let candidate_cost = candidate_residual.norm_squared();

            if candidate_cost.is_finite() && candidate_cost < cost {
                current = candidate;
                residual = candidate_residual;
                lambda = (lambda / 10.0).max(1e-12);
                improved = cost - candidate_cost > CONVERGENCE * cost.max(1.0) && step.norm() > CONVERGENCE;
                cost = candidate_cost;
                break;
            }
            lambda *= 10.0;
        }

        if !improved {
            break;
        }
    }

    current
}

fn apply_step(pose: &Candidate, delta: &[f64; 6]) -> Candidate {
    let rotation = Rotation3::new(Vector3::new(delta[0], delta[1], delta[2])).into_inner() * pose.rotation;
    Candidate {
        rotation,
        translation: pose.translation + Vector3::new(delta[3], delta[4], delta[5]),
    }
}

fn project(pose: &Candidate, point: &Point3<f64>, k: &Matrix3<f64>) -> Vector3<f64> {
    k * (pose.rotation * point.coords + pose.translation)
}

fn residuals(pose: &Candidate, world: &[Point3<f64>], image: &[Point2<f64>], k: &Matrix3<f64>) -> DVector<f64> {
    let mut residual = DVector::zeros(world.len() * 2);
    for (index, (pw, pi)) in world.iter().zip(image).enumerate() {
        let projected = project(pose, pw, k);
        residual[2 * index] = projected.x / projected.z - pi.x;
        residual[2 * index + 1] = projected.y / projected.z - pi.y;
    }
    residual
}

fn mean_reprojection_error(pose: &Candidate, world: &[Point3<f64>], image: &[Point2<f64>], k: &Matrix3<f64>) -> f64 {
    let total: f64 = world
        .iter()
        .zip(image)
        .map(|(pw, pi)| {
            let projected = project(pose, pw, k);
            let dx = projected.x / projected.z - pi.x;
            let dy = projected.y / projected.z - pi.y;
            (dx * dx + dy * dy).sqrt()
        })
        .sum();
    total / world.len() as f64
}

fn in_front(pose: &Candidate, world: &[Point3<f64>]) -> bool {
    world
        .iter()
        .all(|p| (pose.rotation * p.coords + pose.translation).z > 0.0)
}

/// Multiply two polynomials given lowest power first
fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

fn term(poly: &[f64], power: usize) -> f64 {
    poly.get(power).copied().unwrap_or(0.0)
}

/// Real roots of a polynomial given lowest power first.
///
/// Leading coefficients that vanish relative to the largest one are dropped
/// before the companion matrix is built, so a quartic that degenerates into
/// a cubic still yields its roots.
fn real_polynomial_roots(coefficients: &[f64]) -> Vec<f64> {
    let scale = coefficients.iter().fold(0.0_f64, |m, c| m.max(c.abs()));
    if scale == 0.0 {
        return Vec::new();
    }
    let Some(degree) = coefficients.iter().rposition(|c| c.abs() > 1e-12 * scale) else {
        return Vec::new();
    };
    if degree == 0 {
        return Vec::new();
    }

    let leading = coefficients[degree];
    let mut companion = DMatrix::<f64>::zeros(degree, degree);
    for column in 0..degree {
        companion[(0, column)] = -coefficients[degree - 1 - column] / leading;
    }
    for row in 1..degree {
        companion[(row, row - 1)] = 1.0;
    }

    let eigenvalues = Schur::new(companion).complex_eigenvalues();
    let mut roots: Vec<f64> = eigenvalues
        .iter()
        .filter(|value| value.im.abs() < 1e-8 * value.re.abs().max(1.0))
        .map(|value| value.re)
        .collect();
    roots.sort_by(|a, b| a.total_cmp(b));
    roots.dedup_by(|a, b| (*a - *b).abs() < 1e-10);
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn intrinsics() -> Matrix3<f64> {
        Matrix3::new(800.0, 0.0, 320.0, 0.0, 780.0, 240.0, 0.0, 0.0, 1.0)
    }

    fn project_all(rotation: &Rotation3<f64>, translation: &Vector3<f64>, world: &[Point3<f64>]) -> Vec<Point2<f64>> {
        let k = intrinsics();
        world
            .iter()
            .map(|p| {
                let projected = k * (rotation * p.coords + translation);
                Point2::new(projected.x / projected.z, projected.y / projected.z)
            })
            .collect()
    }

    fn model_points() -> Vec<Point3<f64>> {
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(80.0, 0.0, 10.0),
            Point3::new(0.0, 60.0, -20.0),
            Point3::new(-30.0, 20.0, 50.0),
            Point3::new(40.0, -50.0, 25.0),
            Point3::new(-60.0, -40.0, -10.0),
        ]
    }

    #[test]
    fn test_recovers_known_pose_from_four_points() {
        let rotation = Rotation3::from_euler_angles(0.2, -0.3, 0.4);
        let translation = Vector3::new(15.0, -10.0, 600.0);
        let world = &model_points()[..4];
        let image = project_all(&rotation, &translation, world);

        let solution = solve_pnp(world, &image, &intrinsics()).unwrap();

        assert_relative_eq!(solution.translation, translation, epsilon = 1e-4);
        assert_relative_eq!(solution.rotation_matrix(), rotation.into_inner(), epsilon = 1e-6);
        assert!(solution.reprojection_error < 1e-6);
    }

    #[test]
    fn test_more_points_are_used() {
        let rotation = Rotation3::from_euler_angles(-0.5, 0.1, 1.2);
        let translation = Vector3::new(-40.0, 25.0, 900.0);
        let world = model_points();
        let mut image = project_all(&rotation, &translation, &world);
        // Half a pixel of noise on one point
        image[5].x += 0.5;

        let solution = solve_pnp(&world, &image, &intrinsics()).unwrap();

        assert_relative_eq!(solution.rotation_matrix(), rotation.into_inner(), epsilon = 2e-2);
        assert!((solution.translation - translation).norm() < 10.0);
        assert!(solution.reprojection_error < 0.5);
    }

    #[test]
    fn test_rejects_bad_input() {
        let world = model_points();
        let image = vec![Point2::new(0.0, 0.0); 3];

        assert_eq!(
            solve_pnp(&world[..3], &image, &intrinsics()).unwrap_err(),
            PnpError::NotEnoughPoints(3)
        );
        assert_eq!(
            solve_pnp(&world, &image, &intrinsics()).unwrap_err(),
            PnpError::MismatchedLengths { points_2d: 3, points_3d: 6 }
        );

        let image = vec![Point2::new(0.0, 0.0); 6];
        assert_eq!(
            solve_pnp(&world, &image, &Matrix3::zeros()).unwrap_err(),
            PnpError::SingularIntrinsics
        );
    }

    #[test]
    fn test_polynomial_roots() {
        // (x - 1)(x - 2)(x + 3)(x - 0.5)
        let roots = real_polynomial_roots(&[-3.0, 9.5, -7.0, -0.5, 1.0]);
        assert_eq!(roots.len(), 4);
        for (root, expected) in roots.iter().zip([-3.0, 0.5, 1.0, 2.0]) {
            assert_relative_eq!(*root, expected, epsilon = 1e-9);
        }

        // Vanishing leading coefficient: x^2 - 1
        let roots = real_polynomial_roots(&[-1.0, 0.0, 1.0, 0.0, 1e-20]);
        assert_eq!(roots.len(), 2);

        // x^2 + 1 has no real roots
        assert!(real_polynomial_roots(&[1.0, 0.0, 1.0]).is_empty());
    }
}
