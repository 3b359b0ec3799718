//! Per-layer rate allocation over codeblock truncation points.
//!
//! Quality layers are built by thresholding the rate-distortion slope of
//! every candidate coding pass: for a threshold T, each codeblock commits
//! the passes whose slope (distortion decrease per byte) is at least T.
//! The threshold for a layer is found by bisection between the tile's
//! extreme slopes, with each probe trial-encoding all packets up to the
//! layer and testing whether they fit the layer's cumulative byte budget
//! (or, in fixed-quality mode, whether the accumulated distortion
//! decrease reaches the target). The accepted threshold is then applied
//! with `finalize` set, fixing each codeblock's committed pass count
//! before the real packet encode.

use log::{debug, trace};

use crate::coding_parameters::CodingParameters;
use crate::constants::{RATE_BISECTION_EPSILON, RATE_BISECTION_ITERATIONS};
use crate::error::Tier2Error;
use crate::packet::{EncodeMode, encode_packets};
use crate::tile::{LayerContribution, Tile};

/// Outcome of allocating all layers of one tile.
#[derive(Debug, Clone)]
pub struct RateAllocation {
    /// Accepted slope threshold per layer (0.0 = unconstrained layer).
    pub thresholds: Vec<f64>,
    /// Distortion decrease committed per layer.
    pub layer_distortion: Vec<f64>,
}

/// Smallest and largest rate-distortion slope over every candidate pass
/// of the tile. `None` when no codeblock has any pass.
fn slope_bounds(tile: &Tile) -> Option<(f64, f64)> {
    let mut min = f64::MAX;
    let mut max = 0.0f64;
    let mut any = false;

    for_each_codeblock(tile, |cblk| {
        for passno in 0..cblk.passes.len() {
            let (prev_rate, prev_dist) = if passno == 0 {
                (0u32, 0.0)
            } else {
                (
                    cblk.passes[passno - 1].rate,
                    cblk.passes[passno - 1].distortion,
                )
            };
            let pass = cblk.passes[passno];
            let dr = f64::from(pass.rate.saturating_sub(prev_rate));
            if dr == 0.0 {
                continue;
            }
            let slope = (pass.distortion - prev_dist) / dr;
            min = min.min(slope);
            max = max.max(slope);
            any = true;
        }
    });

    any.then_some((min, max))
}

/// Total distortion decrease available in the tile.
fn total_distortion(tile: &Tile) -> f64 {
    let mut total = 0.0;
    for_each_codeblock(tile, |cblk| {
        if let Some(last) = cblk.passes.last() {
            total += last.distortion;
        }
    });
    total
}

fn for_each_codeblock(tile: &Tile, mut f: impl FnMut(&crate::tile::Codeblock)) {
    for comp in &tile.components {
        for res in &comp.resolutions {
            for band in res.bands.iter().filter(|b| !b.is_empty()) {
                for prc in band.precincts.iter().filter(|p| !p.is_empty()) {
                    for cblk in &prc.codeblocks {
                        f(cblk);
                    }
                }
            }
        }
    }
}

/// Fix layer `layno` of every codeblock against a slope threshold: commit
/// the passes beyond the already-committed count whose slope, measured
/// from the last committed pass, is at least `threshold`. Returns the
/// distortion decrease the layer gathers. With `finalize` the committed
/// pass counts advance; trials leave them untouched.
pub fn make_layer(tile: &mut Tile, layno: u32, threshold: f64, finalize: bool) -> f64 {
    let mut layer_distortion = 0.0f64;
    let num_layers = tile.num_layers as usize;

    for comp in &mut tile.components {
        for res in &mut comp.resolutions {
            for band in res.bands.iter_mut().filter(|b| !b.is_empty()) {
                for prc in band.precincts.iter_mut().filter(|p| !p.is_empty()) {
                    for cblk in prc.codeblocks.iter_mut() {
                        if cblk.layers.len() < num_layers {
                            cblk.layers
                                .resize(num_layers, LayerContribution::default());
                        }

                        let committed = cblk.num_passes_in_layers as usize;
                        let mut n = committed;
                        for passno in committed..cblk.passes.len() {
                            let (last_rate, last_dist) = if n == 0 {
                                (0u32, 0.0)
                            } else {
                                (cblk.passes[n - 1].rate, cblk.passes[n - 1].distortion)
                            };
                            let pass = cblk.passes[passno];
                            let dr = f64::from(pass.rate.saturating_sub(last_rate));
                            let dd = pass.distortion - last_dist;
                            if dr == 0.0 {
                                if dd != 0.0 {
                                    n = passno + 1;
                                }
                                continue;
                            }
                            if threshold - (dd / dr) < f64::EPSILON {
                                n = passno + 1;
                            }
                        }

                        let num_passes = (n - committed) as u32;
                        let contribution = if num_passes == 0 {
                            LayerContribution::default()
                        } else {
                            let start = if committed == 0 {
                                0
                            } else {
                                cblk.passes[committed - 1].rate
                            };
                            let base_dist = if committed == 0 {
                                0.0
                            } else {
                                cblk.passes[committed - 1].distortion
                            };
                            LayerContribution {
                                num_passes,
                                start,
                                len: cblk.passes[n - 1].rate - start,
                                distortion: cblk.passes[n - 1].distortion - base_dist,
                            }
                        };
                        layer_distortion += contribution.distortion;
                        cblk.layers[layno as usize] = contribution;
                        if finalize {
                            cblk.num_passes_in_layers = n as u32;
                        }
                    }
                }
            }
        }
    }

    layer_distortion
}

/// Allocate every layer of the tile. `dest_capacity` bounds the trial
/// buffers (normally the size of the final destination). After this
/// returns, a `FinalPass` encode emits the committed layers.
pub fn rate_allocate(
    tile: &mut Tile,
    params: &CodingParameters,
    dest_capacity: usize,
) -> Result<RateAllocation, Tier2Error> {
    params.validate()?;

    let bounds = slope_bounds(tile);
    let total_disto = total_distortion(tile);
    let mut cumulative_disto = 0.0f64;
    let mut thresholds = Vec::with_capacity(params.num_layers as usize);
    let mut layer_distortion = Vec::with_capacity(params.num_layers as usize);

    for layno in 0..params.num_layers {
        let rate_target = params.layer_rates.get(layno as usize).copied().unwrap_or(0.0);
        let disto_ratio = params
            .layer_distortion_ratios
            .get(layno as usize)
            .copied()
            .unwrap_or(0.0);
        let unconstrained = if params.fixed_quality {
            disto_ratio <= 0.0
        } else {
            rate_target <= 0.0
        };

        let Some((min_slope, max_slope)) = bounds else {
            let d = make_layer(tile, layno, 0.0, true);
            cumulative_disto += d;
            thresholds.push(0.0);
            layer_distortion.push(d);
            continue;
        };

        if unconstrained {
            // No target: commit everything that is left.
            let d = make_layer(tile, layno, 0.0, true);
            cumulative_disto += d;
            thresholds.push(0.0);
            layer_distortion.push(d);
            trace!("layer {layno}: unconstrained, distortion {d}");
            continue;
        }

        let max_len = (rate_target.max(0.0) as usize).min(dest_capacity);
        let mut scratch = if params.fixed_quality {
            Vec::new()
        } else {
            vec![0u8; max_len]
        };

        let mut lo = min_slope;
        let mut hi = max_slope;
        let mut stable = None;
        for _ in 0..RATE_BISECTION_ITERATIONS {
            let thresh = (lo + hi) / 2.0;
            let d = make_layer(tile, layno, thresh, false);

            if params.fixed_quality {
                let achieved = cumulative_disto + d;
                let target = total_disto * disto_ratio;
                if achieved < target {
                    hi = thresh;
                } else {
                    lo = thresh;
                    stable = Some(thresh);
                }
            } else {
                let fits = encode_packets(
                    tile,
                    params,
                    &mut scratch,
                    EncodeMode::ThresholdCalc,
                    Some(layno + 1),
                    None,
                )?;
                if fits.is_some() {
                    hi = thresh;
                    stable = Some(thresh);
                } else {
                    lo = thresh;
                }
            }

            if (hi - lo).abs() <= thresh.abs() * RATE_BISECTION_EPSILON {
                break;
            }
        }

        let good = stable.unwrap_or(hi);
        let d = make_layer(tile, layno, good, true);
        cumulative_disto += d;
        thresholds.push(good);
        layer_distortion.push(d);
        debug!("layer {layno}: threshold {good}, distortion {d}");
    }

    Ok(RateAllocation {
        thresholds,
        layer_distortion,
    })
}
