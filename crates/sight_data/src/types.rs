//! Payload types
//!
//! Every payload implements `Data`. The built-in ones are plain values that
//! deserialize from the `value` entry of an application configuration.

use std::any::Any;

use serde::{Deserialize, Serialize};

/// Payload stored in an `Object`
pub trait Data: Any + Send + Sync + std::fmt::Debug {
    /// Registered type name, e.g. `"Integer"`
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// JSON view of the payload, used for logging and inspection
    fn to_value(&self) -> serde_json::Value;
}

/// Implements `Data` for a serializable type under a type name
#[macro_export]
macro_rules! impl_data {
    ($ty:ty, $name:expr) => {
        impl $crate::Data for $ty {
            fn type_name(&self) -> &'static str {
                $name
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }

            fn to_value(&self) -> ::serde_json::Value {
                ::serde_json::to_value(self).unwrap_or(::serde_json::Value::Null)
            }
        }
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// Scalars
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Boolean(pub bool);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Integer(pub i64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Float(pub f64);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Text(pub String);

impl_data!(Boolean, "Boolean");
impl_data!(Integer, "Integer");
impl_data!(Float, "Float");
impl_data!(Text, "Text");

// ─────────────────────────────────────────────────────────────────────────────
// Matrix4
// ─────────────────────────────────────────────────────────────────────────────

/// Row-major 4×4 transformation matrix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Matrix4 {
    pub coefficients: [f64; 16],
}

impl Default for Matrix4 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Matrix4 {
    #[rustfmt::skip]
    pub fn identity() -> Self {
        Self {
            coefficients: [
                1.0, 0.0, 0.0, 0.0,
                0.0, 1.0, 0.0, 0.0,
                0.0, 0.0, 1.0, 0.0,
                0.0, 0.0, 0.0, 1.0,
            ],
        }
    }

    /// Rotation of `angle` radians about the Z axis
    #[rustfmt::skip]
    pub fn rotation_z(angle: f64) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self {
            coefficients: [
                cos, -sin, 0.0, 0.0,
                sin,  cos, 0.0, 0.0,
                0.0,  0.0, 1.0, 0.0,
                0.0,  0.0, 0.0, 1.0,
            ],
        }
    }

    pub fn translation(x: f64, y: f64, z: f64) -> Self {
        let mut matrix = Self::identity();
        matrix.set(0, 3, x);
        matrix.set(1, 3, y);
        matrix.set(2, 3, z);
        matrix
    }

    /// Coefficient at `(row, col)`. Panics if either index is not below 4.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.coefficients[Self::index(row, col)]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.coefficients[Self::index(row, col)] = value;
    }

    fn index(row: usize, col: usize) -> usize {
        assert!(row < 4 && col < 4, "matrix index ({row}, {col}) out of range");
        row * 4 + col
    }

    /// `self × other`
    pub fn multiply(&self, other: &Matrix4) -> Matrix4 {
        let mut result = [0.0; 16];
        for row in 0..4 {
            for col in 0..4 {
                result[row * 4 + col] = (0..4).map(|k| self.get(row, k) * other.get(k, col)).sum();
            }
        }
        Matrix4 {
            coefficients: result,
        }
    }

    /// Apply to a point (w = 1)
    pub fn transform_point(&self, point: [f64; 3]) -> [f64; 3] {
        let [x, y, z] = point;
        let row = |r: usize| self.get(r, 0) * x + self.get(r, 1) * y + self.get(r, 2) * z + self.get(r, 3);
        [row(0), row(1), row(2)]
    }

    pub fn approx_eq(&self, other: &Matrix4, epsilon: f64) -> bool {
        self.coefficients
            .iter()
            .zip(other.coefficients.iter())
            .all(|(a, b)| (a - b).abs() <= epsilon)
    }
}

impl_data!(Matrix4, "Matrix4");

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_identity_is_neutral() {
        let m = Matrix4::translation(1.0, 2.0, 3.0);
        assert_eq!(m.multiply(&Matrix4::identity()), m);
        assert_eq!(Matrix4::identity().multiply(&m), m);
    }

    #[test]
    fn test_rotation_and_translation() {
        let rotated = Matrix4::rotation_z(FRAC_PI_2).transform_point([1.0, 0.0, 0.0]);
        assert!((rotated[0]).abs() < 1e-12);
        assert!((rotated[1] - 1.0).abs() < 1e-12);

        let moved = Matrix4::translation(1.0, 2.0, 3.0)
            .multiply(&Matrix4::rotation_z(FRAC_PI_2))
            .transform_point([1.0, 0.0, 0.0]);
        assert!((moved[0] - 1.0).abs() < 1e-12);
        assert!((moved[1] - 3.0).abs() < 1e-12);
        assert!((moved[2] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_four_quarter_turns_are_identity() {
        let quarter = Matrix4::rotation_z(FRAC_PI_2);
        let full = (0..4).fold(Matrix4::identity(), |acc, _| acc.multiply(&quarter));
        assert!(full.approx_eq(&Matrix4::identity(), 1e-12));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_column_past_the_row_end_panics() {
        Matrix4::identity().get(0, 5);
    }

    #[test]
    fn test_scalar_values_deserialize_transparently() {
        let value: Integer = serde_json::from_value(serde_json::json!(5)).unwrap();
        assert_eq!(value, Integer(5));
        assert_eq!(value.to_value(), serde_json::json!(5));
        assert_eq!(Text("a".into()).type_name(), "Text");
    }
}
