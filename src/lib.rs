mod contrast_factor;
mod derivatives;
mod descriptors;
mod detector_response;
mod evolution;
pub mod image;
mod nonlinear_diffusion;
mod scale_space_extrema;

use crate::image::gaussian_blur;
use cv_core::{nalgebra::Point2, ImagePoint};
use log::*;
use std::path::Path;
use std::time::Instant;

pub use crate::image::GrayFloatImage;
pub use crate::scale_space_extrema::suppress_by_distance;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Detector responses below this floor are never accepted, regardless of
/// the configured threshold.
pub const MIN_DETECTOR_THRESHOLD: f64 = 1e-5;

/// Descriptors are returned as one row-major matrix, one L2-unit row per
/// keypoint, 64 or 128 columns depending on [`Options::extended`].
pub type DescriptorMatrix = ndarray::Array2<f32>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(
        "input image is {got_width}x{got_height} but the engine was \
         configured for {expected_width}x{expected_height}"
    )]
    DimensionMismatch {
        expected_width: usize,
        expected_height: usize,
        got_width: usize,
        got_height: usize,
    },
    #[error("non-finite value in the scale space at evolution level {level}")]
    NumericalFailure { level: usize },
    #[error("keypoint {index} references evolution level {class_id} outside the scale space")]
    KeypointOutOfRange { index: usize, class_id: u32 },
    #[error("failed to load image")]
    Image(#[from] ::image::ImageError),
}

/// Conductivity function used to build the diffusion flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Diffusivity {
    /// Perona-Malik g1, favours high-contrast edges.
    PeronaMalikG1,
    /// Perona-Malik g2, favours wide regions over smaller ones.
    PeronaMalikG2,
    /// Weickert conductivity, sharper region boundaries.
    Weickert,
}

/// Descriptor family to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DescriptorFamily {
    /// Standard SURF grid without additional weighting.
    Surf,
    /// Modified SURF: overlapping cells with two Gaussian weightings.
    MSurf,
    /// Gauge-SURF: second-order responses in the local gradient frame.
    GSurf,
}

/// A point of interest in an image.
/// This pretty much follows from OpenCV conventions.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KeyPoint {
    /// The horizontal coordinate; +x faces right, sub-pixel.
    pub x: f32,
    /// The vertical coordinate; +y faces toward the bottom, sub-pixel.
    pub y: f32,
    /// The diameter of the keypoint, in pixel units.
    pub size: f32,
    /// The orientation angle in [0, 2*pi), 0 for upright runs.
    pub angle: f32,
    /// The magnitude of response from the detector.
    pub response: f32,
    /// The octave of the scale space level the keypoint was found in.
    pub octave: u32,
    /// The index of the owning evolution level.
    pub class_id: u32,
}

impl ImagePoint for KeyPoint {
    fn image_point(&self) -> Point2<f64> {
        Point2::new(self.x as f64, self.y as f64)
    }
}

/// Contains the configuration parameters of the engine.
///
/// The most important parameter to pay attention to is `dthreshold`.
/// [`Options::new`] can be used to set this threshold and let all other
/// parameters remain default; the helpers [`Options::sparse`] and
/// [`Options::dense`] pick common values. Image dimensions default to VGA
/// and usually need to be set explicitly.
#[derive(Debug, Copy, Clone)]
pub struct Options {
    /// Width every input image must have.
    pub img_width: usize,

    /// Height every input image must have.
    pub img_height: usize,

    /// Maximum octave evolution of the image 2^sigma (coarsest scale sigma units).
    pub omax: u32,

    /// Number of sublevels per scale level.
    pub nsublevels: u32,

    /// Base scale offset (sigma units).
    pub soffset: f64,

    /// Sigma of the Gaussian applied before derivative estimation.
    pub sderivatives: f64,

    /// Conductivity function for the diffusion flow.
    pub diffusivity: Diffusivity,

    /// Detector response threshold to accept a point.
    pub dthreshold: f64,

    /// Descriptor family to extract.
    pub descriptor: DescriptorFamily,

    /// Skip orientation estimation and emit angle 0 for every keypoint.
    pub upright: bool,

    /// Produce 128-dimensional descriptors instead of 64.
    pub extended: bool,

    /// Apply the iterative clipping normalisation after the L2 pass.
    pub use_clipping_normalization: bool,

    /// Number of clipping iterations.
    pub clipping_niter: usize,

    /// Clipping ratio; entries are clamped to `ratio / sqrt(D)`.
    pub clipping_ratio: f32,

    /// Percentile level for the contrast factor.
    pub kcontrast_percentile: f64,

    /// Number of bins for the contrast factor histogram.
    pub kcontrast_nbins: usize,
}

impl Options {
    /// This convenience constructor is provided for the very common case
    /// that the detector threshold needs to be modified.
    pub fn new(threshold: f64) -> Self {
        Self {
            dthreshold: threshold,
            ..Default::default()
        }
    }

    /// Options that sparsely detect features (threshold `0.01`).
    pub fn sparse() -> Self {
        Self::new(0.01)
    }

    /// Options that densely detect features (threshold `0.0001`).
    pub fn dense() -> Self {
        Self::new(0.0001)
    }

    pub(crate) fn effective_threshold(&self) -> f64 {
        self.dthreshold.max(MIN_DETECTOR_THRESHOLD)
    }

    pub(crate) fn descriptor_size(&self) -> usize {
        if self.extended {
            128
        } else {
            64
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.img_width < 3 || self.img_height < 3 {
            return Err(Error::InvalidConfig("image dimensions must be at least 3x3"));
        }
        if self.omax == 0 || self.nsublevels == 0 {
            return Err(Error::InvalidConfig(
                "omax and nsublevels must both be at least 1",
            ));
        }
        if self.omax * self.nsublevels < 3 {
            return Err(Error::InvalidConfig(
                "the scale space needs at least three evolution levels",
            ));
        }
        if !(self.soffset > 0.0) || !(self.sderivatives > 0.0) {
            return Err(Error::InvalidConfig("sigmas must be positive"));
        }
        if !(self.kcontrast_percentile > 0.0 && self.kcontrast_percentile <= 1.0) {
            return Err(Error::InvalidConfig(
                "kcontrast_percentile must lie in (0, 1]",
            ));
        }
        if self.kcontrast_nbins == 0 {
            return Err(Error::InvalidConfig(
                "the contrast histogram needs at least one bin",
            ));
        }
        // The coarsest derivative kernel must still fit inside the image.
        let max_esigma = self.soffset
            * f64::powf(
                2.0,
                f64::from(self.nsublevels - 1) / f64::from(self.nsublevels)
                    + f64::from(self.omax - 1),
            );
        let max_kernel = 2 * max_esigma.round() as usize + 1;
        if max_kernel > self.img_width.min(self.img_height) {
            return Err(Error::InvalidConfig(
                "the image is too small for the configured number of octaves",
            ));
        }
        Ok(())
    }
}

impl Default for Options {
    fn default() -> Options {
        Options {
            img_width: 640,
            img_height: 480,
            omax: 4,
            nsublevels: 4,
            soffset: 1.6f64,
            sderivatives: 1.0f64,
            diffusivity: Diffusivity::PeronaMalikG2,
            dthreshold: 0.001f64,
            descriptor: DescriptorFamily::MSurf,
            upright: false,
            extended: false,
            use_clipping_normalization: false,
            clipping_niter: 5,
            clipping_ratio: 1.6,
            kcontrast_percentile: 0.7f64,
            kcontrast_nbins: 300,
        }
    }
}

/// Lifecycle of the engine; advances with each completed stage and falls
/// back to `Configured` when a run fails or a new image comes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Configured,
    ScaleSpaceBuilt,
    Detected,
    Described,
}

/// The KAZE feature engine.
///
/// Owns every per-level buffer of the nonlinear scale space for its whole
/// lifetime; `new` allocates them once and failed or repeated runs only
/// zero them. Keypoints and descriptors are handed to the caller by value.
pub struct Kaze {
    options: Options,
    evolutions: Vec<evolution::EvolutionStep>,
    state: State,
}

impl Kaze {
    /// Validate the configuration and allocate the scale space.
    pub fn new(options: Options) -> Result<Self, Error> {
        options.validate()?;
        let start = Instant::now();
        let evolutions = evolution::allocate_evolutions(&options);
        info!(
            "allocated {} evolutions in {:?}",
            evolutions.len(),
            start.elapsed()
        );
        Ok(Self {
            options,
            evolutions,
            state: State::Configured,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Detect keypoints.
    ///
    /// Builds the nonlinear scale space for `image`, fills the detector
    /// response and returns the refined scale space extrema, ordered by
    /// (level, row-major pixel position) of discovery. Angles are zero; the
    /// orientation is estimated during descriptor extraction.
    pub fn detect(&mut self, image: &GrayFloatImage) -> Result<Vec<KeyPoint>, Error> {
        self.run(|engine| {
            engine.prepare_responses(image)?;
            let start = Instant::now();
            let keypoints =
                scale_space_extrema::detect_keypoints(&engine.options, &engine.evolutions);
            info!(
                "detected {} keypoints in {:?}",
                keypoints.len(),
                start.elapsed()
            );
            engine.state = State::Detected;
            Ok(keypoints)
        })
    }

    /// Compute descriptors for caller-supplied keypoints.
    ///
    /// Rebuilds the scale space for `image`. Unless the run is upright,
    /// each keypoint's dominant orientation is estimated and written back
    /// to its angle field. Row i of the result describes `keypoints[i]`.
    pub fn compute(
        &mut self,
        image: &GrayFloatImage,
        keypoints: &mut [KeyPoint],
    ) -> Result<DescriptorMatrix, Error> {
        for (index, keypoint) in keypoints.iter().enumerate() {
            if keypoint.class_id as usize >= self.evolutions.len() {
                return Err(Error::KeypointOutOfRange {
                    index,
                    class_id: keypoint.class_id,
                });
            }
        }
        self.run(|engine| {
            engine.prepare_responses(image)?;
            let start = Instant::now();
            let descriptors =
                descriptors::extract_descriptors(&engine.options, &engine.evolutions, keypoints);
            info!(
                "extracted {} descriptors in {:?}",
                descriptors.nrows(),
                start.elapsed()
            );
            engine.state = State::Described;
            Ok(descriptors)
        })
    }

    /// Detect keypoints and compute their descriptors in one pass over the
    /// scale space.
    pub fn detect_and_compute(
        &mut self,
        image: &GrayFloatImage,
    ) -> Result<(Vec<KeyPoint>, DescriptorMatrix), Error> {
        self.run(|engine| {
            engine.prepare_responses(image)?;
            let start = Instant::now();
            let mut keypoints =
                scale_space_extrema::detect_keypoints(&engine.options, &engine.evolutions);
            info!(
                "detected {} keypoints in {:?}",
                keypoints.len(),
                start.elapsed()
            );
            engine.state = State::Detected;
            let start = Instant::now();
            let descriptors = descriptors::extract_descriptors(
                &engine.options,
                &engine.evolutions,
                &mut keypoints,
            );
            info!(
                "extracted {} descriptors in {:?}",
                descriptors.nrows(),
                start.elapsed()
            );
            engine.state = State::Described;
            Ok((keypoints, descriptors))
        })
    }

    /// Convenience wrapper loading the image from disk first.
    pub fn detect_and_compute_path(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<(Vec<KeyPoint>, DescriptorMatrix), Error> {
        let image = GrayFloatImage::from_dynamic(&::image::open(path)?);
        self.detect_and_compute(&image)
    }

    /// Run one stage pipeline, falling back to a zeroed `Configured`
    /// engine when it fails.
    fn run<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, Error>) -> Result<T, Error> {
        match f(self) {
            Ok(value) => Ok(value),
            Err(error) => {
                self.reset();
                Err(error)
            }
        }
    }

    /// Zero every level buffer and return to `Configured`.
    fn reset(&mut self) {
        for evolution in &mut self.evolutions {
            evolution.clear();
        }
        self.state = State::Configured;
    }

    /// Build the scale space and the detector response for `image`.
    fn prepare_responses(&mut self, image: &GrayFloatImage) -> Result<(), Error> {
        self.build_scale_space(image)?;
        self.state = State::ScaleSpaceBuilt;
        let start = Instant::now();
        detector_response::detector_response(&mut self.evolutions);
        info!("computed detector response in {:?}", start.elapsed());
        Ok(())
    }

    /// Create the nonlinear scale space: selective blurring that respects
    /// image edges, advanced level to level with implicit AOS steps.
    fn build_scale_space(&mut self, image: &GrayFloatImage) -> Result<(), Error> {
        if image.width() != self.options.img_width || image.height() != self.options.img_height {
            return Err(Error::DimensionMismatch {
                expected_width: self.options.img_width,
                expected_height: self.options.img_height,
                got_width: image.width(),
                got_height: image.height(),
            });
        }
        let start = Instant::now();
        trace!("creating first evolution");
        self.evolutions[0].Lt = gaussian_blur(image, self.options.soffset as f32);
        self.evolutions[0].Lsmooth =
            gaussian_blur(&self.evolutions[0].Lt, self.options.sderivatives as f32);
        let contrast_factor = contrast_factor::compute_contrast_factor(
            &self.evolutions[0].Lt,
            self.options.kcontrast_percentile,
            self.options.sderivatives,
            self.options.kcontrast_nbins,
        );
        debug!(
            "contrast percentile={}, num bins={}, contrast factor={}",
            self.options.kcontrast_percentile, self.options.kcontrast_nbins, contrast_factor
        );
        for i in 1..self.evolutions.len() {
            trace!("creating evolution {}", i);
            let (built, rest) = self.evolutions.split_at_mut(i);
            let prev = &built[i - 1];
            let evolution = &mut rest[0];
            evolution.Lsmooth = gaussian_blur(&prev.Lt, self.options.sderivatives as f32);
            #[cfg(not(feature = "rayon"))]
            {
                evolution.Lx = derivatives::simple_scharr_horizontal(&evolution.Lsmooth);
                evolution.Ly = derivatives::simple_scharr_vertical(&evolution.Lsmooth);
            }
            #[cfg(feature = "rayon")]
            {
                (evolution.Lx, evolution.Ly) = rayon::join(
                    || derivatives::simple_scharr_horizontal(&evolution.Lsmooth),
                    || derivatives::simple_scharr_vertical(&evolution.Lsmooth),
                );
            }
            match self.options.diffusivity {
                Diffusivity::PeronaMalikG1 => nonlinear_diffusion::pm_g1(
                    &mut evolution.Lflow,
                    &evolution.Lx,
                    &evolution.Ly,
                    contrast_factor,
                ),
                Diffusivity::PeronaMalikG2 => nonlinear_diffusion::pm_g2(
                    &mut evolution.Lflow,
                    &evolution.Lx,
                    &evolution.Ly,
                    contrast_factor,
                ),
                Diffusivity::Weickert => nonlinear_diffusion::weickert(
                    &mut evolution.Lflow,
                    &evolution.Lx,
                    &evolution.Ly,
                    contrast_factor,
                ),
            }
            let step_size = (evolution.etime - prev.etime) as f32;
            nonlinear_diffusion::calculate_step(
                &mut evolution.Lt,
                &prev.Lt,
                &evolution.Lflow,
                step_size,
            );
            if !evolution.Lt.is_finite() {
                return Err(Error::NumericalFailure { level: i });
            }
            trace!("diffusion step finished with step size {}", step_size);
        }
        info!("created the nonlinear scale space in {:?}", start.elapsed());
        Ok(())
    }
}
