use crate::image::{gaussian_blur, GrayFloatImage};
use log::*;

/// Compute an empirical value for the k contrast factor from the gradient
/// histogram of the seed image.
///
/// # Arguments
/// * `image` - Input image.
/// * `percentile` - Percentile of the image gradient histogram (0-1).
/// * `gradient_histogram_scale` - Sigma of the blur applied before taking
///   the gradient.
/// * `num_bins` - Number of histogram bins.
/// # Return value
/// The k contrast factor.
#[allow(non_snake_case)]
pub fn compute_contrast_factor(
    image: &GrayFloatImage,
    percentile: f64,
    gradient_histogram_scale: f64,
    num_bins: usize,
) -> f64 {
    let mut num_points: f64 = 0.0;
    let mut histogram = vec![0usize; num_bins];
    let smoothed = gaussian_blur(image, gradient_histogram_scale as f32);
    let Lx = crate::derivatives::simple_scharr_horizontal(&smoothed);
    let Ly = crate::derivatives::simple_scharr_vertical(&smoothed);
    let hmax = (1..smoothed.height() - 1)
        .flat_map(|y| (1..smoothed.width() - 1).map(move |x| (x, y)))
        .map(|(x, y)| Lx.get(x, y).powi(2) as f64 + Ly.get(x, y).powi(2) as f64)
        .map(float_ord::FloatOrd)
        .max()
        .unwrap()
        .0
        .sqrt();
    if hmax == 0.0 {
        // Gradient-free image. Any positive value works since the
        // conductivity never sees a non-zero gradient; keep the histogram
        // fallback value.
        return 0.03;
    }
    for y in 1..(smoothed.height() - 1) {
        for x in 1..(smoothed.width() - 1) {
            let modg = (Lx.get(x, y).powi(2) as f64 + Ly.get(x, y).powi(2) as f64).sqrt();
            if modg != 0.0 {
                let mut bin_number = f64::floor((num_bins as f64) * (modg / hmax)) as usize;
                if bin_number == num_bins {
                    bin_number -= 1;
                }
                histogram[bin_number] += 1;
                num_points += 1f64;
            }
        }
    }
    let threshold: usize = (num_points * percentile) as usize;
    let mut k: usize = 0;
    let mut num_elements: usize = 0;
    while num_elements < threshold && k < num_bins {
        num_elements += histogram[k];
        k += 1;
    }
    debug!(
        "hmax: {}, threshold: {}, num_elements: {}",
        hmax, threshold, num_elements
    );
    if num_elements >= threshold {
        hmax * (k as f64) / (num_bins as f64)
    } else {
        0.03
    }
}

#[cfg(test)]
mod tests {
    use super::compute_contrast_factor;
    use crate::GrayFloatImage;

    #[test]
    fn constant_image_falls_back() {
        let mut image = GrayFloatImage::new(32, 32);
        for y in 0..32 {
            for x in 0..32 {
                image.put(x, y, 0.5);
            }
        }
        let k = compute_contrast_factor(&image, 0.7, 1.0, 300);
        assert!((k - 0.03).abs() < 1e-12);
    }

    #[test]
    fn ramp_image_yields_positive_factor() {
        let mut image = GrayFloatImage::new(32, 32);
        for y in 0..32 {
            for x in 0..32 {
                image.put(x, y, x as f32 / 31.0);
            }
        }
        let k = compute_contrast_factor(&image, 0.7, 1.0, 300);
        assert!(k > 0.0);
        assert!(k.is_finite());
    }
}
