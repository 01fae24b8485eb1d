// Discrete Fourier transforms for the reference mesh.
//
// Unnormalized in both directions:
//   Forward: X_k = sum_j x_j e^{-2πi jk/n}
//   Inverse: x_j = sum_k X_k e^{+2πi jk/n}
// Normalization conventions (1/N on r2c) live in mesh.rs.
//
// Power-of-two lengths use an iterative radix-2 transform; other lengths
// fall back to a direct O(n²) sum. 3D transforms are separable and batch
// independent lines on the rayon pool.

use std::f64::consts::PI;

use rayon::prelude::*;

use crate::complex::Complex64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Inverse,
}

impl Direction {
    fn sign(self) -> f64 {
        match self {
            Direction::Forward => -1.0,
            Direction::Inverse => 1.0,
        }
    }
}

/// In-place 1D transform of `buf`.
pub fn fft_1d(buf: &mut [Complex64], dir: Direction) {
    let n = buf.len();
    if n <= 1 {
        return;
    }
    if n.is_power_of_two() {
        radix2(buf, dir.sign());
    } else {
        direct(buf, dir.sign());
    }
}

fn radix2(buf: &mut [Complex64], sign: f64) {
    let n = buf.len();

    // Bit-reversal permutation.
    let mut j = 0usize;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            buf.swap(i, j);
        }
    }

    let mut len = 2;
    while len <= n {
        let half = len / 2;
        let step = sign * 2.0 * PI / len as f64;
        for start in (0..n).step_by(len) {
            for k in 0..half {
                let w = Complex64::from_polar(step * k as f64);
                let u = buf[start + k];
                let v = buf[start + k + half] * w;
                buf[start + k] = u + v;
                buf[start + k + half] = u - v;
            }
        }
        len <<= 1;
    }
}

fn direct(buf: &mut [Complex64], sign: f64) {
    let n = buf.len();
    let input = buf.to_vec();
    let step = sign * 2.0 * PI / n as f64;
    for (k, out) in buf.iter_mut().enumerate() {
        let mut acc = Complex64::ZERO;
        for (j, x) in input.iter().enumerate() {
            // Reduce jk mod n before forming the angle to keep it small.
            let w = Complex64::from_polar(step * ((j * k) % n) as f64);
            acc += *x * w;
        }
        *out = acc;
    }
}

/// In-place separable 3D transform of a row-major `[n0, n1, n2]` grid.
pub fn fft_3d(data: &mut [Complex64], shape: [usize; 3], dir: Direction) {
    let [n0, n1, n2] = shape;
    debug_assert_eq!(data.len(), n0 * n1 * n2);

    // Axis 2: contiguous lines.
    data.par_chunks_mut(n2).for_each(|line| fft_1d(line, dir));

    // Axis 1: strided lines inside each slab.
    data.par_chunks_mut(n1 * n2).for_each(|slab| {
        let mut line = vec![Complex64::ZERO; n1];
        for i2 in 0..n2 {
            for (i1, v) in line.iter_mut().enumerate() {
                *v = slab[i1 * n2 + i2];
            }
            fft_1d(&mut line, dir);
            for (i1, v) in line.iter().enumerate() {
                slab[i1 * n2 + i2] = *v;
            }
        }
    });

    // Axis 0: lines span slabs, gather in parallel then scatter.
    let plane = n1 * n2;
    let lines: Vec<Vec<Complex64>> = {
        let src: &[Complex64] = data;
        (0..plane)
            .into_par_iter()
            .map(|col| {
                let mut line: Vec<Complex64> = (0..n0).map(|i0| src[i0 * plane + col]).collect();
                fft_1d(&mut line, dir);
                line
            })
            .collect()
    };
    for (col, line) in lines.into_iter().enumerate() {
        for (i0, v) in line.into_iter().enumerate() {
            data[i0 * plane + col] = v;
        }
    }
}
