//! Distance kernels over 128-byte descriptors.
//!
//! Every kernel has an AVX2 path (four aligned 256-bit loads per
//! descriptor) selected at runtime and a scalar path used as fallback and
//! as the reference implementation. All results are exact integers; the
//! largest possible squared L2 distance is `128 * 255^2`, well inside `u32`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bounding_box::BoundingBox;
use crate::descriptor::*;
use crate::error::{KdForestError, Result};

//////////////
// Dispatch //
//////////////

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn has_avx2() -> bool {
    is_x86_feature_detected!("avx2")
}

/// L1 (sum of absolute differences) distance between two descriptors
#[inline]
pub fn l1_distance(a: &U8Descriptor, b: &U8Descriptor) -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            return unsafe { l1_distance_avx2(a, b) };
        }
    }
    l1_distance_scalar(a, b)
}

/// Squared L2 distance between two descriptors
#[inline]
pub fn l2_distance_squared(a: &U8Descriptor, b: &U8Descriptor) -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            return unsafe { l2_distance_squared_avx2(a, b) };
        }
    }
    l2_distance_squared_scalar(a, b)
}

/// L1 lower bound between a descriptor and any point inside a box
///
/// Dimensions where the descriptor lies within `[min, max]` contribute 0,
/// all others the distance to the nearer bound.
#[inline]
pub fn l1_distance_bb(a: &U8Descriptor, bb: &BoundingBox) -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            return unsafe { l1_distance_bb_avx2(a, bb) };
        }
    }
    l1_distance_bb_scalar(a, bb)
}

/// Squared L2 lower bound between a descriptor and any point inside a box
#[inline]
pub fn l2_distance_squared_bb(a: &U8Descriptor, bb: &BoundingBox) -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            return unsafe { l2_distance_squared_bb_avx2(a, bb) };
        }
    }
    l2_distance_squared_bb_scalar(a, bb)
}

/// Elementwise envelope of two boxes
#[inline]
pub fn union(a: &BoundingBox, b: &BoundingBox) -> BoundingBox {
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            return unsafe { union_avx2(a, b) };
        }
    }
    union_scalar(a, b)
}

//////////
// AVX2 //
//////////

/// Sum the four u64 lanes produced by `vpsadbw`
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn hsum_epi64(v: std::arch::x86_64::__m256i) -> u32 {
    use std::arch::x86_64::*;

    let mut vals = [0u64; 4];
    _mm256_storeu_si256(vals.as_mut_ptr() as *mut __m256i, v);
    (vals[0] + vals[1] + vals[2] + vals[3]) as u32
}

/// Sum the eight i32 lanes produced by `vpmaddwd`
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn hsum_epi32(v: std::arch::x86_64::__m256i) -> u32 {
    use std::arch::x86_64::*;

    let mut vals = [0i32; 8];
    _mm256_storeu_si256(vals.as_mut_ptr() as *mut __m256i, v);
    vals.iter().map(|&x| x as u32).sum()
}

/// Squares of 32 byte-wide differences, widened and pair-summed into i32
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn square_accumulate(
    acc: std::arch::x86_64::__m256i,
    diff: std::arch::x86_64::__m256i,
) -> std::arch::x86_64::__m256i {
    use std::arch::x86_64::*;

    let zero = _mm256_setzero_si256();
    let lo = _mm256_unpacklo_epi8(diff, zero);
    let hi = _mm256_unpackhi_epi8(diff, zero);
    let acc = _mm256_add_epi32(acc, _mm256_madd_epi16(lo, lo));
    _mm256_add_epi32(acc, _mm256_madd_epi16(hi, hi))
}

/// Absolute difference of unsigned bytes
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn abs_diff_epu8(
    a: std::arch::x86_64::__m256i,
    b: std::arch::x86_64::__m256i,
) -> std::arch::x86_64::__m256i {
    use std::arch::x86_64::*;

    _mm256_or_si256(_mm256_subs_epu8(a, b), _mm256_subs_epu8(b, a))
}

/// Per-byte distance from `q` to the interval `[min, max]`
///
/// At most one of the two saturating differences is non-zero since
/// `min <= max`.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn outside_epu8(
    q: std::arch::x86_64::__m256i,
    min: std::arch::x86_64::__m256i,
    max: std::arch::x86_64::__m256i,
) -> std::arch::x86_64::__m256i {
    use std::arch::x86_64::*;

    _mm256_or_si256(_mm256_subs_epu8(min, q), _mm256_subs_epu8(q, max))
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn load_lane(desc: &U8Descriptor, lane: usize) -> std::arch::x86_64::__m256i {
    use std::arch::x86_64::*;

    // 32-byte alignment is guaranteed by the type
    _mm256_load_si256(desc.features.as_ptr().add(lane * SIMD_LANE_BYTES) as *const __m256i)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn l1_distance_avx2(a: &U8Descriptor, b: &U8Descriptor) -> u32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_si256();
    for lane in 0..SIMD_LANES_PER_DESCRIPTOR {
        let sad = _mm256_sad_epu8(load_lane(a, lane), load_lane(b, lane));
        acc = _mm256_add_epi64(acc, sad);
    }
    hsum_epi64(acc)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn l2_distance_squared_avx2(a: &U8Descriptor, b: &U8Descriptor) -> u32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_si256();
    for lane in 0..SIMD_LANES_PER_DESCRIPTOR {
        let diff = abs_diff_epu8(load_lane(a, lane), load_lane(b, lane));
        acc = square_accumulate(acc, diff);
    }
    hsum_epi32(acc)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn l1_distance_bb_avx2(a: &U8Descriptor, bb: &BoundingBox) -> u32 {
    use std::arch::x86_64::*;

    let zero = _mm256_setzero_si256();
    let mut acc = _mm256_setzero_si256();
    for lane in 0..SIMD_LANES_PER_DESCRIPTOR {
        let diff = outside_epu8(
            load_lane(a, lane),
            load_lane(&bb.min, lane),
            load_lane(&bb.max, lane),
        );
        acc = _mm256_add_epi64(acc, _mm256_sad_epu8(diff, zero));
    }
    hsum_epi64(acc)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn l2_distance_squared_bb_avx2(a: &U8Descriptor, bb: &BoundingBox) -> u32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_si256();
    for lane in 0..SIMD_LANES_PER_DESCRIPTOR {
        let diff = outside_epu8(
            load_lane(a, lane),
            load_lane(&bb.min, lane),
            load_lane(&bb.max, lane),
        );
        acc = square_accumulate(acc, diff);
    }
    hsum_epi32(acc)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn union_avx2(a: &BoundingBox, b: &BoundingBox) -> BoundingBox {
    use std::arch::x86_64::*;

    let mut out = BoundingBox::default();
    for lane in 0..SIMD_LANES_PER_DESCRIPTOR {
        let min = _mm256_min_epu8(load_lane(&a.min, lane), load_lane(&b.min, lane));
        let max = _mm256_max_epu8(load_lane(&a.max, lane), load_lane(&b.max, lane));
        let offset = lane * SIMD_LANE_BYTES;
        _mm256_store_si256(
            out.min.features.as_mut_ptr().add(offset) as *mut __m256i,
            min,
        );
        _mm256_store_si256(
            out.max.features.as_mut_ptr().add(offset) as *mut __m256i,
            max,
        );
    }
    out
}

////////////
// Scalar //
////////////

/// Scalar reference for [`l1_distance`]
pub fn l1_distance_scalar(a: &U8Descriptor, b: &U8Descriptor) -> u32 {
    a.features
        .iter()
        .zip(b.features.iter())
        .map(|(&x, &y)| x.abs_diff(y) as u32)
        .sum()
}

/// Scalar reference for [`l2_distance_squared`]
pub fn l2_distance_squared_scalar(a: &U8Descriptor, b: &U8Descriptor) -> u32 {
    a.features
        .iter()
        .zip(b.features.iter())
        .map(|(&x, &y)| {
            let d = x.abs_diff(y) as u32;
            d * d
        })
        .sum()
}

/// Distance from a value to the interval `[lo, hi]`
#[inline(always)]
fn outside(q: u8, lo: u8, hi: u8) -> u32 {
    if q < lo {
        (lo - q) as u32
    } else if q > hi {
        (q - hi) as u32
    } else {
        0
    }
}

/// Scalar reference for [`l1_distance_bb`]
pub fn l1_distance_bb_scalar(a: &U8Descriptor, bb: &BoundingBox) -> u32 {
    (0..DESCRIPTOR_DIM)
        .map(|d| outside(a[d], bb.min[d], bb.max[d]))
        .sum()
}

/// Scalar reference for [`l2_distance_squared_bb`]
pub fn l2_distance_squared_bb_scalar(a: &U8Descriptor, bb: &BoundingBox) -> u32 {
    (0..DESCRIPTOR_DIM)
        .map(|d| {
            let o = outside(a[d], bb.min[d], bb.max[d]);
            o * o
        })
        .sum()
}

/// Scalar reference for [`union`]
pub fn union_scalar(a: &BoundingBox, b: &BoundingBox) -> BoundingBox {
    let mut out = BoundingBox::default();
    for d in 0..DESCRIPTOR_DIM {
        out.min.features[d] = a.min[d].min(b.min[d]);
        out.max.features[d] = a.max[d].max(b.max[d]);
    }
    out
}

///////////////
// Self-test //
///////////////

/// Random box with `min <= max` on every dimension
fn random_box(rng: &mut StdRng) -> BoundingBox {
    let mut bb = BoundingBox::default();
    for d in 0..DESCRIPTOR_DIM {
        let x: u8 = rng.random();
        let y: u8 = rng.random();
        bb.min.features[d] = x.min(y);
        bb.max.features[d] = x.max(y);
    }
    bb
}

/// Verify the dispatched L2 kernels against the scalar reference
///
/// Covers descriptor-descriptor and descriptor-box distances on random
/// inputs plus the two extremes (all 0 vs all 255).
///
/// ### Params
///
/// * `trials` - Number of random pairs to check
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// `KernelMismatch` describing the first disagreement, if any
pub fn verify_l2_distance_simd(trials: usize, seed: u64) -> Result<()> {
    let check = |trial: usize, simd: u32, scalar: u32| {
        if simd == scalar {
            Ok(())
        } else {
            Err(KdForestError::KernelMismatch {
                trial,
                simd,
                scalar,
            })
        }
    };

    let lo = U8Descriptor::splat(0);
    let hi = U8Descriptor::splat(u8::MAX);
    check(
        0,
        l2_distance_squared(&lo, &hi),
        l2_distance_squared_scalar(&lo, &hi),
    )?;

    let mut rng = StdRng::seed_from_u64(seed);
    for trial in 0..trials {
        let mut a = U8Descriptor::default();
        let mut b = U8Descriptor::default();
        rng.fill(&mut a.features[..]);
        rng.fill(&mut b.features[..]);
        let bb = random_box(&mut rng);

        check(
            trial,
            l2_distance_squared(&a, &b),
            l2_distance_squared_scalar(&a, &b),
        )?;
        check(
            trial,
            l2_distance_squared_bb(&a, &bb),
            l2_distance_squared_bb_scalar(&a, &bb),
        )?;
    }

    Ok(())
}

///////////
// Tests //
///////////
