use argus_core::{Field, Progress};
use rayon::prelude::*;

use crate::{Error, Result};

/// Configuration for [`bp2d`].
///
/// The smoothness term is truncated linear,
/// `V(l1, l2) = min(rate * |l1 - l2|, cap)`, which is what makes the
/// linear-time message update possible.
#[derive(Clone, Copy)]
pub struct Bp2dParams {
    pub labels: usize,
    pub smooth_rate: f32,
    pub smooth_cap: f32,
    /// Resolution levels for the coarse-to-fine schedule; clamped to what
    /// the grid size allows.
    pub levels: usize,
    /// Message iterations per level.
    pub iters: usize,
}

impl Default for Bp2dParams {
    fn default() -> Self {
        Self {
            labels: 16,
            smooth_rate: 1.0,
            smooth_cap: 4.0,
            levels: 5,
            iters: 10,
        }
    }
}

// Incoming-message directions, indexed by where the message came from.
const FROM_LEFT: usize = 0;
const FROM_RIGHT: usize = 1;
const FROM_UP: usize = 2;
const FROM_DOWN: usize = 3;

struct BpLevel {
    width: usize,
    height: usize,
    labels: usize,
    data: Vec<f32>,
    // One buffer per incoming direction, width*height*labels each.
    msg: [Vec<f32>; 4],
}

impl BpLevel {
    #[inline]
    fn idx(&self, x: usize, y: usize) -> usize {
        (y * self.width + x) * self.labels
    }
}

/// Min-sum loopy belief propagation on a 4-connected grid, after
/// Felzenszwalb & Huttenlocher's "Efficient Belief Propagation for Early
/// Vision".
///
/// `data_cost(x, y, label)` gives the cost of assigning `label` at a node;
/// the solver returns the labelling approximately minimising the sum of the
/// data costs and the pairwise truncated-linear smoothness over all
/// neighbouring pairs. Data costs are evaluated once per node/label and
/// cached, coarser levels sum the costs of their children, and each level's
/// converged messages seed the next finer one.
pub fn bp2d(
    width: usize,
    height: usize,
    params: &Bp2dParams,
    data_cost: &(dyn Fn(usize, usize, usize) -> f32 + Sync),
    prog: &mut Progress,
) -> Result<Field<u32>> {
    if width == 0 || height == 0 || params.labels == 0 {
        return Err(Error::InvalidParameter(
            "bp2d needs a non-empty grid and at least one label".into(),
        ));
    }

    // Cap the hierarchy so the coarsest grid keeps both dimensions >= 1.
    let mut max_levels = 1;
    let (mut w, mut h) = (width, height);
    while w >= 2 && h >= 2 && max_levels < params.levels {
        w = w.div_ceil(2);
        h = h.div_ceil(2);
        max_levels += 1;
    }
    let n_levels = max_levels;
    let labels = params.labels;

    // Data cost pyramid: level 0 from the closure, coarser levels sum their
    // 2x2 children so a coarse node stands in for the block it covers.
    let mut levels: Vec<BpLevel> = Vec::with_capacity(n_levels);
    {
        let mut data0 = vec![0.0f32; width * height * labels];
        data0
            .par_chunks_mut(labels)
            .enumerate()
            .for_each(|(i, costs)| {
                let x = i % width;
                let y = i / width;
                for (l, c) in costs.iter_mut().enumerate() {
                    *c = data_cost(x, y, l);
                }
            });
        levels.push(BpLevel {
            width,
            height,
            labels,
            data: data0,
            msg: std::array::from_fn(|_| vec![0.0; width * height * labels]),
        });
    }
    for l in 1..n_levels {
        let fw = levels[l - 1].width;
        let fh = levels[l - 1].height;
        let cw = fw.div_ceil(2);
        let ch = fh.div_ceil(2);
        let mut data = vec![0.0f32; cw * ch * labels];
        for fy in 0..fh {
            for fx in 0..fw {
                let src = levels[l - 1].idx(fx, fy);
                let dst = ((fy / 2) * cw + fx / 2) * labels;
                for lab in 0..labels {
                    data[dst + lab] += levels[l - 1].data[src + lab];
                }
            }
        }
        levels.push(BpLevel {
            width: cw,
            height: ch,
            labels,
            data,
            msg: std::array::from_fn(|_| vec![0.0; cw * ch * labels]),
        });
    }

    prog.push();
    let total_rounds = (n_levels * params.iters) as u64;
    let mut done = 0u64;
    for l in (0..n_levels).rev() {
        // Seed from the parent level: children inherit the parent message.
        if l + 1 < n_levels {
            let (fine, coarse) = {
                let (lo, hi) = levels.split_at_mut(l + 1);
                (&mut lo[l], &hi[0])
            };
            for y in 0..fine.height {
                for x in 0..fine.width {
                    let src = coarse.idx(x / 2, y / 2);
                    let dst = fine.idx(x, y);
                    for dir in 0..4 {
                        fine.msg[dir][dst..dst + labels]
                            .copy_from_slice(&coarse.msg[dir][src..src + labels]);
                    }
                }
            }
        }

        let lvl = &mut levels[l];
        for t in 0..params.iters {
            sweep(lvl, t, params.smooth_rate, params.smooth_cap);
            done += 1;
            prog.report(done, total_rounds);
        }
    }
    prog.pop();

    // Read the labelling off the finest level.
    let lvl = &levels[0];
    let mut out = Field::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let base = lvl.idx(x, y);
            let mut best = 0u32;
            let mut best_cost = f32::INFINITY;
            for lab in 0..labels {
                let mut c = lvl.data[base + lab];
                for dir in 0..4 {
                    c += lvl.msg[dir][base + lab];
                }
                if c < best_cost {
                    best_cost = c;
                    best = lab as u32;
                }
            }
            out.set(x, y, best);
        }
    }
    Ok(out)
}

/// One checkerboard half-sweep: nodes with (x + y + t) even send to their
/// four neighbours.
fn sweep(lvl: &mut BpLevel, t: usize, rate: f32, cap: f32) {
    let labels = lvl.labels;
    let mut h = vec![0.0f32; labels];
    let mut out = vec![0.0f32; labels];

    for y in 0..lvl.height {
        for x in 0..lvl.width {
            if (x + y + t) % 2 != 0 {
                continue;
            }
            let base = lvl.idx(x, y);

            // Four outgoing messages. A message sent towards a neighbour is
            // stored in that neighbour's incoming slot, and must exclude
            // what that same neighbour told us last sweep.
            for (dx, dy, store_as, skip) in [
                (-1i64, 0i64, FROM_RIGHT, FROM_LEFT),
                (1, 0, FROM_LEFT, FROM_RIGHT),
                (0, -1, FROM_DOWN, FROM_UP),
                (0, 1, FROM_UP, FROM_DOWN),
            ] {
                let tx = x as i64 + dx;
                let ty = y as i64 + dy;
                if tx < 0 || ty < 0 || tx >= lvl.width as i64 || ty >= lvl.height as i64 {
                    continue;
                }

                for lab in 0..labels {
                    let mut v = lvl.data[base + lab];
                    for dir in 0..4 {
                        if dir != skip {
                            v += lvl.msg[dir][base + lab];
                        }
                    }
                    h[lab] = v;
                }

                min_convolve(&mut h, &mut out, rate, cap);

                let tbase = lvl.idx(tx as usize, ty as usize);
                lvl.msg[store_as][tbase..tbase + labels].copy_from_slice(&out);
            }
        }
    }
}

/// Linear-time message update for the truncated linear model: two
/// propagation passes, a truncation against the global minimum plus the cap,
/// then zero-mean normalisation so messages stay bounded.
fn min_convolve(h: &mut [f32], out: &mut [f32], rate: f32, cap: f32) {
    let labels = h.len();
    for l in 1..labels {
        h[l] = h[l].min(h[l - 1] + rate);
    }
    for l in (0..labels - 1).rev() {
        h[l] = h[l].min(h[l + 1] + rate);
    }

    let floor = h.iter().copied().fold(f32::INFINITY, f32::min) + cap;
    let mut sum = 0.0;
    for l in 0..labels {
        out[l] = h[l].min(floor);
        sum += out[l];
    }
    let mean = sum / labels as f32;
    for v in out.iter_mut() {
        *v -= mean;
    }
}
