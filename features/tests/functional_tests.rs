use argus_core::{Field, Progress};
use argus_features::{Mser, Sift};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn blob_scene(seed: u64, w: usize, h: usize, count: usize) -> (Field<f32>, Vec<(f32, f32)>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centres = Vec::new();
    while centres.len() < count {
        let cx = rng.random_range(12.0..(w as f32 - 12.0));
        let cy = rng.random_range(12.0..(h as f32 - 12.0));
        if centres
            .iter()
            .all(|&(x, y): &(f32, f32)| (x - cx).hypot(y - cy) > 16.0)
        {
            centres.push((cx, cy));
        }
    }
    let img = Field::from_fn(w, h, |x, y| {
        let mut v = 0.0f32;
        for &(cx, cy) in &centres {
            let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
            v += (-d2 / (2.0 * 9.0)).exp();
        }
        v.min(1.0)
    });
    (img, centres)
}

#[test]
fn sift_finds_every_blob() {
    let (img, centres) = blob_scene(7, 128, 96, 5);
    let kps = Sift::new().detect(&img, &mut Progress::silent()).unwrap();
    for &(cx, cy) in &centres {
        assert!(
            kps.iter()
                .any(|kp| (kp.x - cx).abs() < 5.0 && (kp.y - cy).abs() < 5.0),
            "no keypoint near ({}, {})",
            cx,
            cy
        );
    }
}

#[test]
fn sift_keypoints_survive_translation() {
    let (img, _) = blob_scene(11, 96, 96, 3);
    let shifted = Field::from_fn(96, 96, |x, y| {
        *img.get_clamped(x as i64 - 5, y as i64 - 3)
    });

    let a = Sift::new().detect(&img, &mut Progress::silent()).unwrap();
    let b = Sift::new().detect(&shifted, &mut Progress::silent()).unwrap();

    let mut matched = 0;
    for kp in &a {
        if b.iter()
            .any(|q| (q.x - kp.x - 5.0).abs() < 2.0 && (q.y - kp.y - 3.0).abs() < 2.0)
        {
            matched += 1;
        }
    }
    assert!(
        matched * 2 >= a.len(),
        "only {} of {} keypoints found again",
        matched,
        a.len()
    );
}

#[test]
fn mser_regions_are_connected_and_within_bbox() {
    let img = Field::from_fn(64, 64, |x, y| {
        let in_a = (8..20).contains(&x) && (8..24).contains(&y);
        let in_b = (36..56).contains(&x) && (30..44).contains(&y);
        if in_a || in_b {
            0.1
        } else {
            0.85
        }
    });
    let regions = Mser::new().detect(&img, &mut Progress::silent()).unwrap();
    assert_eq!(regions.len(), 2);
    for r in &regions {
        assert_eq!(r.pixels.len(), r.area);
        for &(x, y) in &r.pixels {
            assert!(x >= r.bbox.0 && x <= r.bbox.2);
            assert!(y >= r.bbox.1 && y <= r.bbox.3);
        }
    }
    let mut areas: Vec<usize> = regions.iter().map(|r| r.area).collect();
    areas.sort_unstable();
    assert_eq!(areas, vec![12 * 16, 20 * 14]);
}

#[test]
fn mser_ignores_smooth_noise() {
    let mut rng = StdRng::seed_from_u64(3);
    let img = Field::from_fn(64, 64, |_, _| 0.5 + rng.random_range(-0.01..0.01f32));
    let regions = Mser::new().detect(&img, &mut Progress::silent()).unwrap();
    assert!(regions.is_empty());
}
