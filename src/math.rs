/// Rotation and matrix conversion utilities
///
/// The on-disk formats store 3x3 matrices as flat row-major arrays, while
/// cgmath matrices are column-major. Everything that crosses that boundary
/// goes through the helpers in this module.
use cgmath::{InnerSpace, Matrix, Matrix3, Quaternion, Rad, SquareMatrix, Vector3};

/// Rotations smaller than this are treated as the identity
const MIN_ROTATION_ANGLE: f64 = 1e-12;

/// Largest deviation of `R * R^T` from the identity accepted as a rotation
pub const ROTATION_TOLERANCE: f64 = 1e-4;

/// Build a matrix from nine row-major values (`[r00, r01, r02, r10, ...]`)
pub fn matrix_from_row_major(values: &[f64; 9]) -> Matrix3<f64> {
    // cgmath takes columns
    Matrix3::new(
        values[0], values[3], values[6],
        values[1], values[4], values[7],
        values[2], values[5], values[8],
    )
}

/// Flatten a matrix into nine row-major values
pub fn matrix_to_row_major(m: &Matrix3<f64>) -> [f64; 9] {
    [
        m[0][0], m[1][0], m[2][0],
        m[0][1], m[1][1], m[2][1],
        m[0][2], m[1][2], m[2][2],
    ]
}

/// Convert a rotation matrix into a unit quaternion
pub fn quaternion_from_matrix(m: &Matrix3<f64>) -> Quaternion<f64> {
    Quaternion::from(*m).normalize()
}

/// Convert a quaternion into a rotation matrix
pub fn matrix_from_quaternion(q: &Quaternion<f64>) -> Matrix3<f64> {
    Matrix3::from(q.normalize())
}

/// Convert a rotation vector (axis * angle, radians) into a rotation matrix
///
/// This is the Rodrigues formula; a zero vector yields the identity.
pub fn rotation_vector_to_matrix(rotation: Vector3<f64>) -> Matrix3<f64> {
    let angle = rotation.magnitude();
    if angle < MIN_ROTATION_ANGLE {
        return Matrix3::identity();
    }
    Matrix3::from_axis_angle(rotation / angle, Rad(angle))
}

/// Check that the matrix is orthonormal with determinant +1
pub fn is_rotation_matrix(m: &Matrix3<f64>) -> bool {
    let product = m * m.transpose();
    let identity = Matrix3::<f64>::identity();
    for c in 0..3 {
        for r in 0..3 {
            let deviation = (product[c][r] - identity[c][r]).abs();
            if deviation.is_nan() || deviation > ROTATION_TOLERANCE {
                return false;
            }
        }
    }
    m.determinant() > 0.0
}

/// Check that every entry of the matrix is a finite number
pub fn is_finite_matrix(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}
