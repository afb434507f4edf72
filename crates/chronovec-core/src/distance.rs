//! Distance kernels over raw `f32` slices.
//!
//! Vectors live either in the memory-mapped store or in caller arrays; both
//! surface as `&[f32]`, so every call shape (view vs array, view vs view,
//! array vs array) routes through the same kernels and orders identically.

#[cfg(feature = "nightly-simd")]
use std::simd::prelude::*;

use crate::config::DistanceKind;

#[cfg(feature = "nightly-simd")]
const LANES: usize = 8;

/// Squared Euclidean distance. No sqrt: only ordering is consumed.
#[inline]
pub fn euclidean_sq(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(feature = "nightly-simd")]
    {
        let mut acc = f32x8::splat(0.0);
        let n = a.len();
        let head = n - n % LANES;
        for i in (0..head).step_by(LANES) {
            let va = f32x8::from_slice(&a[i..i + LANES]);
            let vb = f32x8::from_slice(&b[i..i + LANES]);
            let diff = va - vb;
            acc += diff * diff;
        }
        let mut sum = f64::from(acc.reduce_sum());
        for i in head..n {
            let diff = f64::from(a[i]) - f64::from(b[i]);
            sum += diff * diff;
        }
        sum
    }

    #[cfg(not(feature = "nightly-simd"))]
    {
        // Blocked accumulation; the optimizer vectorizes this on stable.
        let mut lanes = [0.0f32; 8];
        let mut chunks_a = a.chunks_exact(8);
        let mut chunks_b = b.chunks_exact(8);
        for (ca, cb) in chunks_a.by_ref().zip(chunks_b.by_ref()) {
            for j in 0..8 {
                let diff = ca[j] - cb[j];
                lanes[j] += diff * diff;
            }
        }
        let mut sum: f64 = lanes.iter().map(|&x| f64::from(x)).sum();
        for (x, y) in chunks_a.remainder().iter().zip(chunks_b.remainder()) {
            let diff = f64::from(*x) - f64::from(*y);
            sum += diff * diff;
        }
        sum
    }
}

/// Dot product.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(feature = "nightly-simd")]
    {
        let mut acc = f32x8::splat(0.0);
        let n = a.len();
        let head = n - n % LANES;
        for i in (0..head).step_by(LANES) {
            let va = f32x8::from_slice(&a[i..i + LANES]);
            let vb = f32x8::from_slice(&b[i..i + LANES]);
            acc += va * vb;
        }
        let mut sum = f64::from(acc.reduce_sum());
        for i in head..n {
            sum += f64::from(a[i]) * f64::from(b[i]);
        }
        sum
    }

    #[cfg(not(feature = "nightly-simd"))]
    {
        let mut lanes = [0.0f32; 8];
        let mut chunks_a = a.chunks_exact(8);
        let mut chunks_b = b.chunks_exact(8);
        for (ca, cb) in chunks_a.by_ref().zip(chunks_b.by_ref()) {
            for j in 0..8 {
                lanes[j] += ca[j] * cb[j];
            }
        }
        let mut sum: f64 = lanes.iter().map(|&x| f64::from(x)).sum();
        for (x, y) in chunks_a.remainder().iter().zip(chunks_b.remainder()) {
            sum += f64::from(*x) * f64::from(*y);
        }
        sum
    }
}

/// `1 - dot(a, b)`.
#[inline]
pub fn inner_product_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - dot(a, b)
}

/// Total, deterministic distance under `kind`. Cosine assumes both sides
/// were normalized (at insert and at query respectively).
#[inline]
pub fn distance(kind: DistanceKind, a: &[f32], b: &[f32]) -> f64 {
    match kind {
        DistanceKind::Euclidean => euclidean_sq(a, b),
        DistanceKind::InnerProduct | DistanceKind::Cosine => inner_product_distance(a, b),
    }
}

/// L2-normalize in place. Zero-norm vectors are left unchanged.
pub fn normalize_l2(v: &mut [f32]) {
    let norm_sq = dot(v, v);
    if norm_sq <= 0.0 {
        return;
    }
    let inv = (1.0 / norm_sq.sqrt()) as f32;
    for x in v.iter_mut() {
        *x *= inv;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn scalar_euclidean_sq(a: &[f32], b: &[f32]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| {
                let d = f64::from(*x) - f64::from(*y);
                d * d
            })
            .sum()
    }

    fn scalar_dot(a: &[f32], b: &[f32]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| f64::from(*x) * f64::from(*y))
            .sum()
    }

    #[test]
    fn euclidean_matches_scalar_reference() {
        let mut rng = rand::thread_rng();
        // Exercise non-multiple-of-8 dims to cover the tail path.
        for dim in [1, 3, 8, 13, 100, 768] {
            let a: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let b: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let fast = euclidean_sq(&a, &b);
            let slow = scalar_euclidean_sq(&a, &b);
            assert!((fast - slow).abs() < 1e-4, "dim {dim}: {fast} vs {slow}");
        }
    }

    #[test]
    fn dot_matches_scalar_reference() {
        let mut rng = rand::thread_rng();
        for dim in [1, 7, 16, 33, 512] {
            let a: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let b: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            assert!((dot(&a, &b) - scalar_dot(&a, &b)).abs() < 1e-4);
        }
    }

    #[test]
    fn euclidean_identity_is_zero() {
        let v = vec![0.25f32; 37];
        assert_eq!(euclidean_sq(&v, &v), 0.0);
    }

    #[test]
    fn normalize_produces_unit_norm() {
        let mut v = vec![3.0f32, 4.0, 0.0, 0.0];
        normalize_l2(&mut v);
        assert!((dot(&v, &v) - 1.0).abs() < 1e-6);
        assert!((f64::from(v[0]) - 0.6).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        let mut v = vec![0.0f32; 8];
        normalize_l2(&mut v);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn cosine_of_scaled_vector_is_near_zero() {
        let mut a = vec![2.0f32, 0.0, 0.0, 0.0];
        let mut q = vec![1.0f32, 0.0, 0.0, 0.0];
        normalize_l2(&mut a);
        normalize_l2(&mut q);
        let d = distance(DistanceKind::Cosine, &a, &q);
        assert!(d.abs() < 1e-6);
    }

    #[test]
    fn inner_product_orders_by_similarity() {
        let q = vec![1.0f32, 0.0];
        let close = vec![0.9f32, 0.1];
        let far = vec![0.1f32, 0.9];
        assert!(
            distance(DistanceKind::InnerProduct, &q, &close)
                < distance(DistanceKind::InnerProduct, &q, &far)
        );
    }
}
