use crate::{derivatives, evolution::EvolutionStep};
use ndarray::azip;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Fill the scale-normalised multiscale derivatives and the Hessian
/// determinant response of every evolution level.
///
/// Must run after the scale space is fully constructed; every level is
/// independent of the others.
pub fn detector_response(evolutions: &mut [EvolutionStep]) {
    #[cfg(not(feature = "rayon"))]
    for evolution in evolutions.iter_mut() {
        process_evolution(evolution);
    }
    #[cfg(feature = "rayon")]
    evolutions.par_iter_mut().for_each(process_evolution);
}

#[allow(non_snake_case, clippy::suspicious_operation_groupings)]
fn process_evolution(evolution: &mut EvolutionStep) {
    let sigma_size = evolution.sigma_size;
    // Second derivatives come from the raw first derivatives; the scale
    // normalisation is applied to all buffers afterwards.
    #[cfg(not(feature = "rayon"))]
    {
        evolution.Lx = derivatives::scharr_horizontal(&evolution.Lsmooth, sigma_size);
        evolution.Ly = derivatives::scharr_vertical(&evolution.Lsmooth, sigma_size);
        evolution.Lxx = derivatives::scharr_horizontal(&evolution.Lx, sigma_size);
        evolution.Lyy = derivatives::scharr_vertical(&evolution.Ly, sigma_size);
        evolution.Lxy = derivatives::scharr_vertical(&evolution.Lx, sigma_size);
    }
    #[cfg(feature = "rayon")]
    {
        (evolution.Lx, evolution.Ly) = rayon::join(
            || derivatives::scharr_horizontal(&evolution.Lsmooth, sigma_size),
            || derivatives::scharr_vertical(&evolution.Lsmooth, sigma_size),
        );
        (evolution.Lxx, (evolution.Lyy, evolution.Lxy)) = rayon::join(
            || derivatives::scharr_horizontal(&evolution.Lx, sigma_size),
            || {
                rayon::join(
                    || derivatives::scharr_vertical(&evolution.Ly, sigma_size),
                    || derivatives::scharr_vertical(&evolution.Lx, sigma_size),
                )
            },
        );
    }
    let sigma = sigma_size as f32;
    evolution.Lx.scale(sigma);
    evolution.Ly.scale(sigma);
    evolution.Lxx.scale(sigma * sigma);
    evolution.Lxy.scale(sigma * sigma);
    evolution.Lyy.scale(sigma * sigma);
    azip!((
        Ldet in evolution.Ldet.mut_array2(),
        &Lxx in evolution.Lxx.ref_array2(),
        &Lyy in evolution.Lyy.ref_array2(),
        &Lxy in evolution.Lxy.ref_array2(),
    ) {
        *Ldet = Lxx * Lyy - Lxy * Lxy;
    });
}
