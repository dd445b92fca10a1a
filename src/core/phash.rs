//! DCT based perceptual hash.
//!
//! The image is squashed to a 32x32 brightness grid (aspect ratio ignored),
//! transformed with an orthonormal 2D DCT-II, and the low-frequency 8x8 corner
//! is thresholded against its mean to produce 64 bits. Similar images end up
//! with hashes that are close in Hamming distance.

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, Luma};
use thiserror::Error;

use super::distance::HashValue;

/// Side length of the resampled brightness grid.
pub const GRID_SIZE: usize = 32;

/// Side length of the low-frequency block kept after the transform.
pub const BLOCK_SIZE: usize = 8;

/// Brightness grid indexed as `grid[x][y]`, values in `[0, 1]`.
pub type Grid = [[f64; GRID_SIZE]; GRID_SIZE];

/// Single channel brightness image with samples in `[0, 1]`.
pub type BrightnessImage = ImageBuffer<Luma<f32>, Vec<f32>>;

#[derive(Debug, Error, PartialEq)]
pub enum PHashError {
    #[error("Cannot hash an empty image ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("Expected {expected} brightness samples, got {actual}")]
    SampleCount { expected: usize, actual: usize },
}

/// Hash a decoded image. Colour is reduced to the average of the R, G and B
/// channels; alpha is ignored.
pub fn hash_image(image: &DynamicImage) -> Result<HashValue, PHashError> {
    let rgb = image.to_rgb32f();
    let brightness = BrightnessImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        Luma([(r + g + b) / 3.0])
    });
    hash_brightness(&brightness)
}

/// Hash a row-major buffer of brightness samples.
pub fn hash_samples(width: u32, height: u32, samples: Vec<f32>) -> Result<HashValue, PHashError> {
    let expected = width as usize * height as usize;
    if samples.len() != expected {
        return Err(PHashError::SampleCount {
            expected,
            actual: samples.len(),
        });
    }
    let image = BrightnessImage::from_raw(width, height, samples).ok_or(PHashError::SampleCount {
        expected,
        actual: 0,
    })?;
    hash_brightness(&image)
}

/// Hash a brightness image of any size.
pub fn hash_brightness(image: &BrightnessImage) -> Result<HashValue, PHashError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(PHashError::EmptyImage { width, height });
    }
    Ok(hash_grid(&resample(image)))
}

/// Stretch the image onto the fixed grid.
fn resample(image: &BrightnessImage) -> Grid {
    let side = GRID_SIZE as u32;
    let small = if image.dimensions() == (side, side) {
        image.clone()
    } else {
        imageops::resize(image, side, side, FilterType::Triangle)
    };

    let mut grid = [[0.0; GRID_SIZE]; GRID_SIZE];
    for (x, y, pixel) in small.enumerate_pixels() {
        grid[x as usize][y as usize] = f64::from(pixel[0].clamp(0.0, 1.0));
    }
    grid
}

/// Hash an already resampled brightness grid.
pub fn hash_grid(grid: &Grid) -> HashValue {
    let coefficients = dct2(grid);

    // The DC term dwarfs everything else, so it stays out of the mean.
    let mut sum = 0.0;
    for (x, column) in coefficients.iter().take(BLOCK_SIZE).enumerate() {
        for (y, value) in column.iter().take(BLOCK_SIZE).enumerate() {
            if x != 0 || y != 0 {
                sum += value;
            }
        }
    }
    let mean = sum / (BLOCK_SIZE * BLOCK_SIZE - 1) as f64;

    let mut hash: HashValue = 0;
    for i in 0..BLOCK_SIZE * BLOCK_SIZE {
        let (x, y) = (i % BLOCK_SIZE, i / BLOCK_SIZE);
        if coefficients[x][y] >= mean {
            hash |= 1 << i;
        }
    }
    hash
}

/// Orthonormal 2D DCT-II of the grid.
///
/// Computed separably (columns, then rows), which is algebraically the same as
/// the double sum over every input cell for each output coefficient.
pub fn dct2(grid: &Grid) -> Grid {
    let basis = basis();

    let mut partial = [[0.0; GRID_SIZE]; GRID_SIZE];
    for k1 in 0..GRID_SIZE {
        for n2 in 0..GRID_SIZE {
            partial[k1][n2] = (0..GRID_SIZE).map(|n1| grid[n1][n2] * basis[k1][n1]).sum();
        }
    }

    let mut out = [[0.0; GRID_SIZE]; GRID_SIZE];
    for k1 in 0..GRID_SIZE {
        for k2 in 0..GRID_SIZE {
            out[k1][k2] = (0..GRID_SIZE).map(|n2| partial[k1][n2] * basis[k2][n2]).sum();
        }
    }
    out
}

/// `basis[k][n] = norm(k) * cos(pi / 2N * (2n + 1) * k)`
fn basis() -> Grid {
    let n = GRID_SIZE as f64;
    let scale = std::f64::consts::PI / (2.0 * n);
    let first = 1.0 / n.sqrt();
    let rest = (2.0 / n).sqrt();

    let mut basis = [[0.0; GRID_SIZE]; GRID_SIZE];
    for (k, row) in basis.iter_mut().enumerate() {
        let norm = if k == 0 { first } else { rest };
        for (i, value) in row.iter_mut().enumerate() {
            *value = norm * (scale * (2 * i + 1) as f64 * k as f64).cos();
        }
    }
    basis
}
