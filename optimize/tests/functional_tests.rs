use argus_core::Progress;
use argus_optimize::*;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn test_lm_exponential_fit() {
    // Fit y = a * exp(b * t) to noiseless samples; LM should recover the
    // generating parameters from a rough start.
    let (a_true, b_true) = (2.0f64, -0.7f64);
    let ts: Vec<f64> = (0..20).map(|i| i as f64 * 0.25).collect();
    let ys: Vec<f64> = ts.iter().map(|t| a_true * (b_true * t).exp()).collect();

    let ts_c = ts.clone();
    let ys_c = ys.clone();
    let f = move |p: &DVector<f64>, e: &mut DVector<f64>| {
        for (i, (t, y)) in ts_c.iter().zip(&ys_c).enumerate() {
            e[i] = p[0] * (p[1] * t).exp() - y;
        }
    };

    let mut p = DVector::from_vec(vec![1.0, -0.1]);
    let res = levenberg_marquardt(&mut p, ts.len(), &f, None, None, &LmOptions::default()).unwrap();
    assert!(res < 1e-6, "residual {}", res);
    assert!((p[0] - a_true).abs() < 1e-4);
    assert!((p[1] - b_true).abs() < 1e-4);
}

#[test]
fn test_sparse_lm_recovers_shared_offsets() {
    // Two A blocks ("cameras") and thirty B blocks ("points"). Each
    // observation is the sum of a per-A offset and a per-B value plus the
    // pair index mixing them, so neither list can be solved alone.
    let mut rng = StdRng::seed_from_u64(11);
    let a_true: Vec<f64> = (0..2).map(|_| rng.random_range(-2.0..2.0)).collect();
    let b_true: Vec<f64> = (0..30).map(|_| rng.random_range(-5.0..5.0)).collect();

    let mut slm = SparseLm::new(1, 1, 2);
    let mut a_idx = Vec::new();
    for a in &a_true {
        a_idx.push(
            slm.add_block_a(DVector::from_vec(vec![a + rng.random_range(-1.0..1.0)]))
                .unwrap(),
        );
    }
    let mut b_idx = Vec::new();
    for b in &b_true {
        b_idx.push(
            slm.add_block_b(DVector::from_vec(vec![b + rng.random_range(-1.0..1.0)]))
                .unwrap(),
        );
    }

    for (ai, a) in a_true.iter().enumerate() {
        for (bi, b) in b_true.iter().enumerate() {
            // Two independent mixings pin down both unknowns per pair.
            let m = DVector::from_vec(vec![a + b, a - 2.0 * b]);
            slm.add_term(
                a_idx[ai],
                b_idx[bi],
                m,
                Box::new(|a, b, m, err| {
                    err[0] = a[0] + b[0] - m[0];
                    err[1] = a[0] - 2.0 * b[0] - m[1];
                }),
            )
            .unwrap();
        }
    }

    let res = slm.run(&mut Progress::silent()).unwrap();
    assert!(res < 1e-5, "residual {}", res);
    for (ai, a) in a_true.iter().enumerate() {
        assert!((slm.block_a(a_idx[ai])[0] - a).abs() < 1e-4);
    }
    for (bi, b) in b_true.iter().enumerate() {
        assert!((slm.block_b(b_idx[bi])[0] - b).abs() < 1e-4);
    }
}

#[test]
fn test_sparse_lm_covariance_downweights_bad_term() {
    // One contradictory observation with a huge covariance should barely
    // perturb the answer.
    let mut slm = SparseLm::new(1, 1, 1);
    let a = slm.add_block_a(DVector::from_vec(vec![0.0])).unwrap();
    let good = slm.add_block_b(DVector::from_vec(vec![0.0])).unwrap();
    let bad = slm.add_block_b(DVector::from_vec(vec![0.0])).unwrap();

    let term = || -> TermFn {
        Box::new(|a: &DVector<f64>, b: &DVector<f64>, m: &DVector<f64>, e: &mut DVector<f64>| {
            e[0] = a[0] + b[0] - m[0];
        })
    };
    slm.add_term(a, good, DVector::from_vec(vec![1.0]), term())
        .unwrap();
    slm.add_term(a, bad, DVector::from_vec(vec![100.0]), term())
        .unwrap();
    slm.set_covariance(a, bad, DMatrix::from_element(1, 1, 1e6))
        .unwrap();

    let res = slm.run(&mut Progress::silent()).unwrap();
    // The bad term keeps the residual large but the good constraint is met.
    assert!((slm.block_a(a)[0] + slm.block_b(good)[0] - 1.0).abs() < 1e-2);
    assert!(res.is_finite());
}

#[test]
fn test_multigrid_matches_direct_solve() {
    // 8x8 diagonally dominant system small enough to solve densely too.
    let n = 8usize;
    let mut mg = Multigrid2d::new(n, n)
        .unwrap()
        .with_tolerance(1e-6)
        .with_max_iters(4096);
    let mut rng = StdRng::seed_from_u64(3);
    let rhs: Vec<f32> = (0..n * n).map(|_| rng.random_range(-1.0..1.0)).collect();
    for y in 0..n {
        for x in 0..n {
            mg.set_equation(x, y, 5.0, [-1.0, -1.0, -1.0, -1.0], rhs[y * n + x]);
        }
    }
    let res = mg.run(&mut Progress::silent()).unwrap();
    assert!(res < 1e-5, "residual {}", res);

    // Dense reference.
    let mut a = DMatrix::<f64>::zeros(n * n, n * n);
    let mut b = DVector::<f64>::zeros(n * n);
    for y in 0..n {
        for x in 0..n {
            let i = y * n + x;
            a[(i, i)] = 5.0;
            if x > 0 {
                a[(i, i - 1)] = -1.0;
            }
            if x + 1 < n {
                a[(i, i + 1)] = -1.0;
            }
            if y > 0 {
                a[(i, i - n)] = -1.0;
            }
            if y + 1 < n {
                a[(i, i + n)] = -1.0;
            }
            b[i] = rhs[i] as f64;
        }
    }
    let x_ref = a.lu().solve(&b).unwrap();
    for y in 0..n {
        for x in 0..n {
            let got = *mg.solution().get(x, y) as f64;
            assert!(
                (got - x_ref[y * n + x]).abs() < 1e-3,
                "({}, {}): {} vs {}",
                x,
                y,
                got,
                x_ref[y * n + x]
            );
        }
    }
}

#[test]
fn test_bp2d_denoises_step_edge() {
    // Noisy two-region labelling; BP should snap to the clean step.
    let mut rng = StdRng::seed_from_u64(7);
    let (w, h) = (24usize, 16usize);
    let clean = |x: usize| if x < w / 2 { 2usize } else { 9 };
    let noisy: Vec<usize> = (0..w * h)
        .map(|i| {
            let x = i % w;
            if rng.random_range(0..10) == 0 {
                rng.random_range(0..12)
            } else {
                clean(x)
            }
        })
        .collect();

    let params = Bp2dParams {
        labels: 12,
        smooth_rate: 1.0,
        smooth_cap: 6.0,
        levels: 3,
        iters: 12,
    };
    let cost = |x: usize, y: usize, l: usize| {
        let obs = noisy[y * w + x];
        (l as f32 - obs as f32).abs().min(4.0)
    };
    let out = bp2d(w, h, &params, &cost, &mut Progress::silent()).unwrap();

    let mut wrong = 0;
    for y in 0..h {
        for x in 0..w {
            // Skip the column either side of the edge, where either answer
            // is defensible.
            if x == w / 2 - 1 || x == w / 2 {
                continue;
            }
            if *out.get(x, y) as usize != clean(x) {
                wrong += 1;
            }
        }
    }
    assert!(wrong <= 4, "{} pixels off the clean labelling", wrong);
}
