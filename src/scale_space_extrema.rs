use crate::evolution::EvolutionStep;
use crate::image::GrayFloatImage;
use crate::{KeyPoint, Options};
use cv_core::nalgebra::{Matrix3, Vector3};
use log::*;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Detect keypoints in a fully-constructed nonlinear scale space.
///
/// Scans every interior scale level for 3x3x3 maxima of the Hessian
/// determinant, merges duplicates across adjacent levels and sub-pixel
/// refines the survivors.
pub fn detect_keypoints(options: &Options, evolutions: &[EvolutionStep]) -> Vec<KeyPoint> {
    let candidates = find_scale_space_extrema(options, evolutions);
    do_subpixel_refinement(options, evolutions, candidates)
}

fn find_scale_space_extrema(options: &Options, evolutions: &[EvolutionStep]) -> Vec<KeyPoint> {
    let interior = 1..evolutions.len() - 1;
    #[cfg(feature = "rayon")]
    let per_level: Vec<Vec<KeyPoint>> = interior
        .into_par_iter()
        .map(|level| find_level_extrema(options, evolutions, level))
        .collect();
    #[cfg(not(feature = "rayon"))]
    let per_level: Vec<Vec<KeyPoint>> = interior
        .map(|level| find_level_extrema(options, evolutions, level))
        .collect();
    let keypoints = merge_candidates(evolutions, per_level);
    debug!("extracted {} scale space extrema", keypoints.len());
    keypoints
}

/// Candidate search over one scale level. Candidates keep their integer
/// pixel position; the sublevel index rides in the angle field until
/// refinement replaces it.
fn find_level_extrema(
    options: &Options,
    evolutions: &[EvolutionStep],
    level: usize,
) -> Vec<KeyPoint> {
    let evolution = &evolutions[level];
    let threshold = options.effective_threshold() as f32;
    let w = evolution.Ldet.width();
    let h = evolution.Ldet.height();
    let mut candidates = Vec::new();
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let value = evolution.Ldet.get(x, y);
            if value <= threshold {
                continue;
            }
            // A maximum on its own level (centre excluded) that also tops
            // the full 3x3 patches one level down and up.
            if !is_neighbourhood_maximum(&evolution.Ldet, x, y, value, true)
                || !is_neighbourhood_maximum(&evolutions[level - 1].Ldet, x, y, value, false)
                || !is_neighbourhood_maximum(&evolutions[level + 1].Ldet, x, y, value, false)
            {
                continue;
            }
            candidates.push(KeyPoint {
                x: x as f32,
                y: y as f32,
                size: evolution.esigma as f32,
                // Sublevel stashed here for the scale interpolation.
                angle: evolution.sublevel as f32,
                response: value.abs(),
                octave: evolution.octave,
                class_id: level as u32,
            });
        }
    }
    candidates
}

/// `true` when no sample of the 3x3 patch around `(x, y)` exceeds `value`.
fn is_neighbourhood_maximum(
    response: &GrayFloatImage,
    x: usize,
    y: usize,
    value: f32,
    exclude_centre: bool,
) -> bool {
    for ny in y - 1..=y + 1 {
        for nx in x - 1..=x + 1 {
            if exclude_centre && nx == x && ny == y {
                continue;
            }
            if response.get(nx, ny) > value {
                return false;
            }
        }
    }
    true
}

/// Serial merge of the per-level candidate lists.
///
/// Two candidates no more than one level apart and closer than the
/// candidate level's `sigma_size` are the same feature; the higher
/// response wins and ties keep the earlier point, so the outcome does not
/// depend on how the per-level scans were scheduled.
fn merge_candidates(
    evolutions: &[EvolutionStep],
    per_level: Vec<Vec<KeyPoint>>,
) -> Vec<KeyPoint> {
    enum Verdict {
        Insert,
        Replace(usize),
        Drop,
    }
    let mut keypoints: Vec<KeyPoint> = Vec::new();
    for candidates in per_level {
        for candidate in candidates {
            let sigma_size = evolutions[candidate.class_id as usize].sigma_size as f32;
            let radius_sq = sigma_size * sigma_size;
            let mut verdict = Verdict::Insert;
            for (k, prev) in keypoints.iter().enumerate() {
                let level_gap =
                    (i64::from(prev.class_id) - i64::from(candidate.class_id)).abs();
                if level_gap > 1 {
                    continue;
                }
                let dist = (candidate.x - prev.x) * (candidate.x - prev.x)
                    + (candidate.y - prev.y) * (candidate.y - prev.y);
                if dist < radius_sq {
                    verdict = if candidate.response > prev.response {
                        Verdict::Replace(k)
                    } else {
                        Verdict::Drop
                    };
                    break;
                }
            }
            match verdict {
                Verdict::Insert => keypoints.push(candidate),
                Verdict::Replace(k) => keypoints[k] = candidate,
                Verdict::Drop => {}
            }
        }
    }
    keypoints
}

/// Fit a quadratic to the response in (x, y, scale) around every candidate
/// and move the keypoint to its apex. Candidates whose apex lands further
/// than one sample away in any dimension are unstable and get dropped, as
/// do those with a degenerate local Hessian.
fn do_subpixel_refinement(
    options: &Options,
    evolutions: &[EvolutionStep],
    candidates: Vec<KeyPoint>,
) -> Vec<KeyPoint> {
    let in_count = candidates.len();
    let mut result = Vec::with_capacity(in_count);
    for mut keypoint in candidates {
        let level = keypoint.class_id as usize;
        let x = keypoint.x as usize;
        let y = keypoint.y as usize;
        let ldet = &evolutions[level].Ldet;
        let ldet_m = &evolutions[level - 1].Ldet;
        let ldet_p = &evolutions[level + 1].Ldet;
        let value = ldet.get(x, y);

        let d_x = 0.5 * (ldet.get(x + 1, y) - ldet.get(x - 1, y));
        let d_y = 0.5 * (ldet.get(x, y + 1) - ldet.get(x, y - 1));
        let d_s = 0.5 * (ldet_p.get(x, y) - ldet_m.get(x, y));

        let d_xx = ldet.get(x + 1, y) + ldet.get(x - 1, y) - 2.0 * value;
        let d_yy = ldet.get(x, y + 1) + ldet.get(x, y - 1) - 2.0 * value;
        let d_ss = ldet_p.get(x, y) + ldet_m.get(x, y) - 2.0 * value;
        let d_xy = 0.25 * (ldet.get(x + 1, y + 1) + ldet.get(x - 1, y - 1))
            - 0.25 * (ldet.get(x + 1, y - 1) + ldet.get(x - 1, y + 1));
        let d_xs = 0.25 * (ldet_p.get(x + 1, y) + ldet_m.get(x - 1, y))
            - 0.25 * (ldet_p.get(x - 1, y) + ldet_m.get(x + 1, y));
        let d_ys = 0.25 * (ldet_p.get(x, y + 1) + ldet_m.get(x, y - 1))
            - 0.25 * (ldet_p.get(x, y - 1) + ldet_m.get(x, y + 1));

        let hessian = Matrix3::new(d_xx, d_xy, d_xs, d_xy, d_yy, d_ys, d_xs, d_ys, d_ss);
        let gradient = Vector3::new(-d_x, -d_y, -d_s);
        let delta = match hessian.lu().solve(&gradient) {
            Some(delta) => delta,
            None => continue,
        };
        if delta[0].abs() <= 1.0 && delta[1].abs() <= 1.0 && delta[2].abs() <= 1.0 {
            keypoint.x += delta[0];
            keypoint.y += delta[1];
            // The angle field has carried the sublevel index up to here.
            let dsc = keypoint.octave as f32
                + (keypoint.angle + delta[2]) / options.nsublevels as f32;
            keypoint.size = 2.0 * options.soffset as f32 * f32::powf(2.0, dsc);
            keypoint.angle = 0.0;
            result.push(keypoint);
        }
    }
    debug!("{}/{} remain after subpixel refinement", result.len(), in_count);
    result
}

/// Suppress keypoints closer to each other than `min_dist` pixels, keeping
/// the stronger response of each offending pair.
pub fn suppress_by_distance(keypoints: Vec<KeyPoint>, min_dist: f32) -> Vec<KeyPoint> {
    let mut to_delete = vec![false; keypoints.len()];
    for i in 0..keypoints.len() {
        for j in i + 1..keypoints.len() {
            let dx = keypoints[i].x - keypoints[j].x;
            let dy = keypoints[i].y - keypoints[j].y;
            if (dx * dx + dy * dy).sqrt() < min_dist {
                if keypoints[i].response.abs() >= keypoints[j].response.abs() {
                    to_delete[j] = true;
                } else {
                    to_delete[i] = true;
                    break;
                }
            }
        }
    }
    keypoints
        .into_iter()
        .zip(to_delete)
        .filter_map(|(keypoint, delete)| if delete { None } else { Some(keypoint) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{is_neighbourhood_maximum, suppress_by_distance};
    use crate::{GrayFloatImage, KeyPoint};

    fn keypoint(x: f32, y: f32, response: f32) -> KeyPoint {
        KeyPoint {
            x,
            y,
            size: 3.2,
            angle: 0.0,
            response,
            octave: 0,
            class_id: 1,
        }
    }

    #[test]
    fn neighbourhood_maximum_respects_centre_flag() {
        let mut img = GrayFloatImage::new(5, 5);
        img.put(2, 2, 1.0);
        img.put(3, 2, 0.5);
        assert!(is_neighbourhood_maximum(&img, 2, 2, 1.0, true));
        // The centre sample only disqualifies a lower probe value when it
        // is part of the patch.
        assert!(is_neighbourhood_maximum(&img, 2, 2, 0.99, true));
        assert!(!is_neighbourhood_maximum(&img, 2, 2, 0.99, false));
        assert!(!is_neighbourhood_maximum(&img, 3, 2, 0.5, false));
    }

    #[test]
    fn distance_suppression_keeps_stronger_point() {
        let keypoints = vec![
            keypoint(10.0, 10.0, 0.5),
            keypoint(11.0, 10.0, 0.9),
            keypoint(40.0, 40.0, 0.1),
        ];
        let survivors = suppress_by_distance(keypoints, 4.0);
        assert_eq!(survivors.len(), 2);
        assert!((survivors[0].response - 0.9).abs() < 1e-6);
        assert!((survivors[1].response - 0.1).abs() < 1e-6);
    }
}
