// Copyright 2025 Rangekv Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Distance metrics for vector search
//!
//! All metrics report a *distance* where smaller means closer: squared
//! Euclidean for L2, `1 - dot` for inner-product and cosine. Cosine is
//! inner-product over normalized vectors, so cosine indexes normalize at
//! insert and query time and reuse the IP kernel.

use crate::core::{Error, Result};

/// Supported distance metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetricType {
    /// Squared Euclidean distance
    L2 = 0,
    /// 1 - dot(a, b)
    InnerProduct = 1,
    /// 1 - cos(a, b); vectors are normalized and the IP kernel is reused
    Cosine = 2,
}

impl MetricType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(MetricType::L2),
            1 => Ok(MetricType::InnerProduct),
            2 => Ok(MetricType::Cosine),
            other => Err(Error::illegal(format!("unknown metric type {}", other))),
        }
    }

    /// Whether vectors must be normalized before insert/query
    pub fn normalizes(self) -> bool {
        self == MetricType::Cosine
    }
}

/// Squared L2 distance
#[inline]
pub fn l2_distance_sq(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f32;
    for i in 0..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

/// Dot product
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f32;
    for i in 0..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// Distance under the given metric (smaller = closer)
#[inline]
pub fn distance(metric: MetricType, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        MetricType::L2 => l2_distance_sq(a, b),
        MetricType::InnerProduct | MetricType::Cosine => 1.0 - dot(a, b),
    }
}

/// Normalize a vector in place to unit length. Zero vectors are left as-is.
pub fn normalize(v: &mut [f32]) {
    let norm_sq: f32 = v.iter().map(|x| x * x).sum();
    if norm_sq > 0.0 {
        let inv = 1.0 / norm_sq.sqrt();
        for x in v.iter_mut() {
            *x *= inv;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_squared() {
        assert_eq!(l2_distance_sq(&[1.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(l2_distance_sq(&[1.0, 0.0, 0.0, 0.0], &[0.0, 1.0, 0.0, 0.0]), 2.0);
    }

    #[test]
    fn test_ip_distance() {
        let d = distance(MetricType::InnerProduct, &[1.0, 0.0], &[1.0, 0.0]);
        assert_eq!(d, 0.0);
        let d = distance(MetricType::InnerProduct, &[1.0, 0.0], &[0.0, 1.0]);
        assert_eq!(d, 1.0);
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_metric_roundtrip() {
        for metric in [MetricType::L2, MetricType::InnerProduct, MetricType::Cosine] {
            assert_eq!(MetricType::from_u8(metric.as_u8()).unwrap(), metric);
        }
        assert!(MetricType::from_u8(9).is_err());
    }
}
