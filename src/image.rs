use derive_more::{Deref, DerefMut};
use image::{DynamicImage, GenericImageView, ImageBuffer, Luma};
use log::*;
use ndarray::{Array2, ArrayView2, ArrayViewMut2};
use nshare::{MutNdarray2, RefNdarray2};
use std::f32;

/// The image type used throughout this crate.
///
/// This is a thin wrapper around a contiguous f32 buffer. The scale space
/// consists of many same-shaped buffers of this type, and the hot loops
/// (diffusion, filtering, descriptor sampling) all operate on the raw
/// samples, so a plain `ImageBuffer` with f32 subpixels is the right level
/// of abstraction. The image crate is still used for loading and for the
/// grayscale conversion of caller-supplied images.
#[derive(Debug, Clone, Deref, DerefMut)]
pub struct GrayFloatImage(pub ImageBuffer<Luma<f32>, Vec<f32>>);

impl GrayFloatImage {
    /// Create a unit float image from the image crate's `DynamicImage` type.
    ///
    /// Produces pixel values between 0 and 1 regardless of the source bit
    /// depth.
    pub fn from_dynamic(input_image: &DynamicImage) -> Self {
        Self(match input_image.grayscale() {
            DynamicImage::ImageLuma8(gray_image) => {
                info!(
                    "loaded a {} x {} 8-bit image",
                    input_image.width(),
                    input_image.height()
                );
                ImageBuffer::from_fn(gray_image.width(), gray_image.height(), |x, y| {
                    Luma([f32::from(gray_image[(x, y)][0]) / 255f32])
                })
            }
            DynamicImage::ImageLuma16(gray_image) => {
                info!(
                    "loaded a {} x {} 16-bit image",
                    input_image.width(),
                    input_image.height()
                );
                ImageBuffer::from_fn(gray_image.width(), gray_image.height(), |x, y| {
                    Luma([f32::from(gray_image[(x, y)][0]) / 65535f32])
                })
            }
            _ => unreachable!(),
        })
    }

    pub fn from_array2(arr: Array2<f32>) -> Self {
        Self(
            ImageBuffer::from_raw(arr.dim().1 as u32, arr.dim().0 as u32, arr.into_raw_vec())
                .expect("raw vector didn't have enough pixels for the image"),
        )
    }

    pub fn ref_array2(&self) -> ArrayView2<f32> {
        self.0.ref_ndarray2()
    }

    pub fn mut_array2(&mut self) -> ArrayViewMut2<f32> {
        self.0.mut_ndarray2()
    }

    pub fn zero_array(&self) -> Array2<f32> {
        Array2::zeros((self.height(), self.width()))
    }

    pub fn width(&self) -> usize {
        self.0.width() as usize
    }

    pub fn height(&self) -> usize {
        self.0.height() as usize
    }

    pub fn new(width: usize, height: usize) -> Self {
        Self(ImageBuffer::from_pixel(
            width as u32,
            height as u32,
            Luma([0.0]),
        ))
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.get_pixel(x as u32, y as u32)[0]
    }

    pub fn put(&mut self, x: usize, y: usize, pixel_value: f32) {
        self.put_pixel(x as u32, y as u32, Luma([pixel_value]));
    }

    /// Zero every sample, keeping the allocation.
    pub fn clear(&mut self) {
        for pixel in self.0.iter_mut() {
            *pixel = 0.0;
        }
    }

    /// `true` if every sample is a finite number.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    /// Multiply every sample in place.
    pub fn scale(&mut self, factor: f32) {
        for pixel in self.0.iter_mut() {
            *pixel *= factor;
        }
    }
}

/// Fill border with neighboring pixels. A way of preventing instability
/// around the image borders for things like derivatives.
///
/// # Arguments
/// * `output` - the image to operate upon.
/// * `half_width` - the number of pixels around the borders to operate on.
pub fn fill_border(output: &mut GrayFloatImage, half_width: usize) {
    for x in 0..output.width() {
        let plus = output.get(x, half_width);
        let minus = output.get(x, output.height() - half_width - 1);
        for y in 0..half_width {
            output.put(x, y, plus);
        }
        for y in (output.height() - half_width)..output.height() {
            output.put(x, y, minus);
        }
    }
    for y in 0..output.height() {
        let plus = output.get(half_width, y);
        let minus = output.get(output.width() - half_width - 1, y);
        for x in 0..half_width {
            output.put(x, y, plus);
        }
        for x in (output.width() - half_width)..output.width() {
            output.put(x, y, minus);
        }
    }
}

/// Horizontal image filter for variable kernel sizes.
///
/// # Arguments
/// * `image` - the input image.
/// * `kernel` - the kernel to apply.
/// # Return value
/// The filter result.
pub fn horizontal_filter(image: &GrayFloatImage, kernel: &[f32]) -> GrayFloatImage {
    // Cannot have an even-sized kernel
    debug_assert!(kernel.len() % 2 == 1);
    let half_width = kernel.len() / 2;
    let w = image.width();
    let h = image.height();
    let mut output = GrayFloatImage::new(w, h);
    let src: &[f32] = &image.0;
    let dst: &mut [f32] = &mut output.0;
    for y in 0..h {
        let row = &src[y * w..(y + 1) * w];
        let out_row = &mut dst[y * w..(y + 1) * w];
        for x in half_width..(w - half_width) {
            let mut acc = 0.0f32;
            for (k, &kernel_value) in kernel.iter().enumerate() {
                acc += kernel_value * row[x + k - half_width];
            }
            out_row[x] = acc;
        }
    }
    fill_border(&mut output, half_width);
    output
}

/// Vertical image filter for variable kernel sizes.
///
/// # Arguments
/// * `image` - the input image.
/// * `kernel` - the kernel to apply.
/// # Return value
/// The filter result.
pub fn vertical_filter(image: &GrayFloatImage, kernel: &[f32]) -> GrayFloatImage {
    // Cannot have an even-sized kernel
    debug_assert!(kernel.len() % 2 == 1);
    let half_width = kernel.len() / 2;
    let w = image.width();
    let h = image.height();
    let mut output = GrayFloatImage::new(w, h);
    let src: &[f32] = &image.0;
    let dst: &mut [f32] = &mut output.0;
    for y in half_width..(h - half_width) {
        let out_row = &mut dst[y * w..(y + 1) * w];
        for (k, &kernel_value) in kernel.iter().enumerate() {
            let src_row = &src[(y + k - half_width) * w..(y + k - half_width + 1) * w];
            for x in 0..w {
                out_row[x] += kernel_value * src_row[x];
            }
        }
    }
    fill_border(&mut output, half_width);
    output
}

/// Apply a separable filter: the horizontal kernel along rows, then the
/// vertical kernel along columns.
pub fn separable_filter(
    image: &GrayFloatImage,
    h_kernel: &[f32],
    v_kernel: &[f32],
) -> GrayFloatImage {
    let horizontal = horizontal_filter(image, h_kernel);
    vertical_filter(&horizontal, v_kernel)
}

/// The Gaussian function.
///
/// # Arguments
/// * `x` - the offset.
/// * `r` - sigma.
/// # Return value
/// The kernel value at x.
fn gaussian(x: f32, r: f32) -> f32 {
    ((2.0 * f32::consts::PI).sqrt() * r).recip() * (-x.powi(2) / (2.0 * r.powi(2))).exp()
}

/// Generate a Gaussian kernel.
///
/// # Arguments
/// * `r` - sigma.
/// * `kernel_size` - The size of the kernel.
/// # Return value
/// The kernel (a vector).
pub fn gaussian_kernel(r: f32, kernel_size: usize) -> Vec<f32> {
    let mut kernel = vec![0f32; kernel_size];
    let half_width = (kernel_size / 2) as i32;
    let mut sum = 0f32;
    for i in -half_width..=half_width {
        let val = gaussian(i as f32, r);
        kernel[(i + half_width) as usize] = val;
        sum += val;
    }
    for val in kernel.iter_mut() {
        *val /= sum;
    }
    kernel
}

/// Perform Gaussian blur on an image with a separable kernel.
///
/// # Arguments
/// * `image` - the input image.
/// * `r` - sigma.
/// # Return value
/// The resulting image after the filter was applied.
pub fn gaussian_blur(image: &GrayFloatImage, r: f32) -> GrayFloatImage {
    let kernel_size = (f32::ceil(r) as usize) * 2 + 1usize;
    let kernel = gaussian_kernel(r, kernel_size);
    separable_filter(image, &kernel, &kernel)
}

#[cfg(test)]
mod tests {
    use super::{gaussian_blur, gaussian_kernel, separable_filter, GrayFloatImage};

    #[test]
    fn gaussian_kernel_correct() {
        // test against known correct kernel
        let kernel = gaussian_kernel(3.0, 7);
        let known_correct_kernel = vec![
            0.1062_8852,
            0.1403_2133,
            0.1657_7007,
            0.1752_4014,
            0.1657_7007,
            0.1403_2133,
            0.1062_8852,
        ];
        for it in kernel.iter().zip(known_correct_kernel.iter()) {
            let (i, j) = it;
            assert!(f32::abs(*i - *j) < 0.0001);
        }
    }

    #[test]
    fn blur_preserves_constant() {
        let mut image = GrayFloatImage::new(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                image.put(x, y, 0.25);
            }
        }
        let blurred = gaussian_blur(&image, 1.5);
        for v in blurred.0.iter() {
            assert!((v - 0.25).abs() < 1e-5);
        }
    }

    #[test]
    fn identity_kernel_is_identity() {
        let mut image = GrayFloatImage::new(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                image.put(x, y, (x + 8 * y) as f32 / 64.0);
            }
        }
        let filtered = separable_filter(&image, &[0.0, 1.0, 0.0], &[0.0, 1.0, 0.0]);
        for y in 1..7 {
            for x in 1..7 {
                assert!((filtered.get(x, y) - image.get(x, y)).abs() < 1e-6);
            }
        }
    }
}
