use crate::{GrayFloatImage, Options};
use log::*;

/// One level of the nonlinear scale space.
///
/// Every buffer shares the full image resolution; scale is emulated purely
/// by the growth of `esigma`, there is no decimation between octaves.
#[derive(Debug)]
#[allow(non_snake_case)]
pub struct EvolutionStep {
    /// Evolution time
    pub etime: f64,
    /// Evolution sigma. For linear diffusion t = sigma^2 / 2
    pub esigma: f64,
    /// Image octave
    pub octave: u32,
    /// Image sublevel in each octave
    pub sublevel: u32,
    /// Integer sigma. For computing the feature detector responses
    pub sigma_size: u32,
    /// Diffused image
    pub Lt: GrayFloatImage,
    /// Smoothed image
    pub Lsmooth: GrayFloatImage,
    /// First order spatial derivative
    pub Lx: GrayFloatImage,
    /// First order spatial derivatives
    pub Ly: GrayFloatImage,
    /// Second order spatial derivative
    pub Lxx: GrayFloatImage,
    /// Second order spatial derivatives
    pub Lyy: GrayFloatImage,
    /// Second order spatial derivatives
    pub Lxy: GrayFloatImage,
    /// Conductivity image
    pub Lflow: GrayFloatImage,
    /// Detector response
    pub Ldet: GrayFloatImage,
}

impl EvolutionStep {
    /// Construct a new EvolutionStep for a given octave and sublevel.
    fn new(octave: u32, sublevel: u32, options: &Options) -> EvolutionStep {
        let esigma = options.soffset
            * f64::powf(
                2.0f64,
                f64::from(sublevel) / f64::from(options.nsublevels) + f64::from(octave),
            );
        let etime = 0.5 * (esigma * esigma);
        let width = options.img_width;
        let height = options.img_height;
        EvolutionStep {
            etime,
            esigma,
            octave,
            sublevel,
            sigma_size: esigma.round() as u32,
            Lt: GrayFloatImage::new(width, height),
            Lsmooth: GrayFloatImage::new(width, height),
            Lx: GrayFloatImage::new(width, height),
            Ly: GrayFloatImage::new(width, height),
            Lxx: GrayFloatImage::new(width, height),
            Lyy: GrayFloatImage::new(width, height),
            Lxy: GrayFloatImage::new(width, height),
            Lflow: GrayFloatImage::new(width, height),
            Ldet: GrayFloatImage::new(width, height),
        }
    }

    /// Zero every buffer while keeping the allocations.
    pub fn clear(&mut self) {
        self.Lt.clear();
        self.Lsmooth.clear();
        self.Lx.clear();
        self.Ly.clear();
        self.Lxx.clear();
        self.Lyy.clear();
        self.Lxy.clear();
        self.Lflow.clear();
        self.Ldet.clear();
    }
}

/// Allocate the whole evolution array, ordered by `octave * nsublevels +
/// sublevel` so that scale adjacency reduces to index adjacency.
pub fn allocate_evolutions(options: &Options) -> Vec<EvolutionStep> {
    let evolutions: Vec<EvolutionStep> = (0..options.omax)
        .flat_map(|octave| {
            (0..options.nsublevels).map(move |sublevel| EvolutionStep::new(octave, sublevel, options))
        })
        .collect();
    for evolution in &evolutions {
        debug!(
            "allocated evolution octave={} sublevel={} esigma={} etime={}",
            evolution.octave, evolution.sublevel, evolution.esigma, evolution.etime
        );
    }
    evolutions
}

#[cfg(test)]
mod tests {
    use super::allocate_evolutions;
    use crate::Options;

    #[test]
    fn evolution_times_strictly_increase() {
        let options = Options {
            img_width: 32,
            img_height: 32,
            ..Options::default()
        };
        let evolutions = allocate_evolutions(&options);
        assert_eq!(
            evolutions.len(),
            (options.omax * options.nsublevels) as usize
        );
        for pair in evolutions.windows(2) {
            assert!(pair[1].etime > pair[0].etime);
        }
    }

    #[test]
    fn first_level_sigma_is_base_offset() {
        let options = Options {
            img_width: 32,
            img_height: 32,
            ..Options::default()
        };
        let evolutions = allocate_evolutions(&options);
        assert!((evolutions[0].esigma - options.soffset).abs() < 1e-12);
        assert_eq!(evolutions[0].sigma_size, 2);
    }
}
