use argus_core::{Field, Progress};

use crate::{Error, Result};

/// A maximally stable extremal region: the connected set of pixels at or
/// below `level` that stayed near-constant in area over a band of
/// thresholds.
#[derive(Debug, Clone)]
pub struct MserRegion {
    pub pixels: Vec<(usize, usize)>,
    /// Inclusive bounding box (x0, y0, x1, y1).
    pub bbox: (usize, usize, usize, usize),
    /// Quantised threshold at which the region was extracted.
    pub level: u8,
    pub area: usize,
}

/// MSER detector over the intensity component tree.
///
/// Thresholding from dark to light while tracking connected components
/// with union-find gives each component an area-versus-level history; the
/// stable stretches of that history are the regions. Dark-on-light regions
/// come out directly; invert the image for light-on-dark.
pub struct Mser {
    /// Half-width, in quantised levels, of the stability test band.
    pub delta: u8,
    pub min_area: usize,
    /// Cap as a fraction of the image area.
    pub max_area_ratio: f32,
    /// Upper bound on `(area(l + delta) - area(l - delta)) / area(l)`.
    pub max_variation: f32,
    /// Minimum relative area growth between nested reported regions.
    pub min_diversity: f32,
}

impl Default for Mser {
    fn default() -> Self {
        Self {
            delta: 5,
            min_area: 25,
            max_area_ratio: 0.25,
            max_variation: 0.25,
            min_diversity: 0.2,
        }
    }
}

const UNSET: u32 = u32::MAX;
const NEVER: u16 = 256;

struct Comp {
    /// Pixels in join order. The first `area(l)` entries are exactly the
    /// region at threshold l, because pixels join in level order.
    pixels: Vec<u32>,
    /// (level, area) at each level where the component changed.
    history: Vec<(u8, u32)>,
    /// Level at which this component was absorbed into a larger one.
    death: u16,
}

impl Comp {
    /// Area at a threshold, by step lookup; zero before birth.
    fn area_at(&self, level: i32) -> u32 {
        let mut area = 0;
        for &(l, a) in &self.history {
            if l as i32 <= level {
                area = a;
            } else {
                break;
            }
        }
        area
    }

    fn birth(&self) -> u8 {
        self.history[0].0
    }
}

impl Mser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delta(mut self, delta: u8) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_area_range(mut self, min_area: usize, max_area_ratio: f32) -> Self {
        self.min_area = min_area;
        self.max_area_ratio = max_area_ratio;
        self
    }

    pub fn with_max_variation(mut self, max_variation: f32) -> Self {
        self.max_variation = max_variation;
        self
    }

    pub fn detect(&self, image: &Field<f32>, prog: &mut Progress) -> Result<Vec<MserRegion>> {
        if image.is_empty() {
            return Err(Error::InvalidParameter("empty image".into()));
        }
        if self.delta == 0 {
            return Err(Error::InvalidParameter("delta must be at least 1".into()));
        }
        let width = image.width();
        let height = image.height();
        let n = width * height;
        let max_area = ((n as f32) * self.max_area_ratio) as usize;

        // Quantise and bucket by level.
        let levels: Vec<u8> = image
            .as_slice()
            .iter()
            .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect();
        let mut buckets: Vec<Vec<u32>> = vec![Vec::new(); 256];
        for (i, &l) in levels.iter().enumerate() {
            buckets[l as usize].push(i as u32);
        }

        prog.push();

        // Flood from dark to light, growing the component tree.
        let mut parent: Vec<u32> = vec![UNSET; n];
        let mut comp_of: Vec<u32> = vec![UNSET; n];
        let mut comps: Vec<Comp> = Vec::new();
        let mut touched: Vec<u32> = Vec::new();

        for level in 0u16..256 {
            prog.report(level as u64, 256);
            touched.clear();
            for &p in &buckets[level as usize] {
                parent[p as usize] = p;
                comp_of[p as usize] = comps.len() as u32;
                touched.push(comps.len() as u32);
                comps.push(Comp {
                    pixels: vec![p],
                    history: Vec::new(),
                    death: NEVER,
                });

                let (x, y) = (p as usize % width, p as usize / width);
                let mut try_join = |q: usize| {
                    if parent[q] != UNSET {
                        union(p as usize, q, level, &mut parent, &mut comp_of, &mut comps, &mut touched);
                    }
                };
                if x > 0 {
                    try_join(p as usize - 1);
                }
                if x + 1 < width {
                    try_join(p as usize + 1);
                }
                if y > 0 {
                    try_join(p as usize - width);
                }
                if y + 1 < height {
                    try_join(p as usize + width);
                }
            }

            // Snapshot every component that changed at this level.
            for &c in &touched {
                let comp = &mut comps[c as usize];
                if comp.death != NEVER {
                    continue;
                }
                let area = comp.pixels.len() as u32;
                match comp.history.last_mut() {
                    Some(last) if last.0 as u16 == level => last.1 = area,
                    _ => comp.history.push((level as u8, area)),
                }
            }
        }

        // Scan each component's history band for stable levels.
        let mut regions = Vec::new();
        let delta = self.delta as i32;
        for comp in &comps {
            if comp.history.is_empty() {
                continue;
            }
            let birth = comp.birth() as i32;
            let death = comp.death as i32;
            let mut last_accepted_area = 0u32;
            for level in birth..death.min(256) {
                if level + delta >= death {
                    break;
                }
                let area = comp.area_at(level);
                if (area as usize) < self.min_area || area as usize > max_area {
                    continue;
                }
                let grown = comp.area_at(level + delta);
                let shrunk = comp.area_at(level - delta);
                let variation = (grown - shrunk) as f32 / area as f32;
                if variation > self.max_variation {
                    continue;
                }
                // Nested near-duplicates on the same branch add nothing.
                if last_accepted_area > 0 {
                    let diversity =
                        (area - last_accepted_area) as f32 / area as f32;
                    if diversity < self.min_diversity {
                        continue;
                    }
                }
                last_accepted_area = area;
                regions.push(extract_region(comp, level as u8, area, width));
            }
        }

        prog.pop();
        tracing::debug!(count = regions.len(), "MSER regions detected");
        Ok(regions)
    }
}

fn find(parent: &mut [u32], mut p: usize) -> usize {
    while parent[p] as usize != p {
        let gp = parent[parent[p] as usize];
        parent[p] = gp;
        p = gp as usize;
    }
    p
}

fn union(
    p: usize,
    q: usize,
    level: u16,
    parent: &mut [u32],
    comp_of: &mut [u32],
    comps: &mut [Comp],
    touched: &mut Vec<u32>,
) {
    let ra = find(parent, p);
    let rb = find(parent, q);
    if ra == rb {
        return;
    }
    let ca = comp_of[ra] as usize;
    let cb = comp_of[rb] as usize;
    // The larger component survives; the smaller branch of the tree ends
    // here.
    let (winner_root, win, loser_root, lose) = if comps[ca].pixels.len() >= comps[cb].pixels.len()
    {
        (ra, ca, rb, cb)
    } else {
        (rb, cb, ra, ca)
    };

    let mut moved = std::mem::take(&mut comps[lose].pixels);
    comps[win].pixels.append(&mut moved);
    comps[lose].death = level;
    parent[loser_root] = winner_root as u32;
    comp_of[winner_root] = win as u32;
    touched.push(win as u32);
}

fn extract_region(comp: &Comp, level: u8, area: u32, width: usize) -> MserRegion {
    let pixels: Vec<(usize, usize)> = comp.pixels[..area as usize]
        .iter()
        .map(|&p| (p as usize % width, p as usize / width))
        .collect();
    let mut bbox = (usize::MAX, usize::MAX, 0usize, 0usize);
    for &(x, y) in &pixels {
        bbox.0 = bbox.0.min(x);
        bbox.1 = bbox.1.min(y);
        bbox.2 = bbox.2.max(x);
        bbox.3 = bbox.3.max(y);
    }
    MserRegion {
        area: pixels.len(),
        pixels,
        bbox,
        level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dark_square_image() -> Field<f32> {
        Field::from_fn(40, 40, |x, y| {
            if (10..20).contains(&x) && (12..22).contains(&y) {
                0.1
            } else {
                0.9
            }
        })
    }

    #[test]
    fn test_detects_dark_square() {
        let img = dark_square_image();
        let regions = Mser::new().detect(&img, &mut Progress::silent()).unwrap();
        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        assert_eq!(r.area, 100);
        assert_eq!(r.bbox, (10, 12, 19, 21));
    }

    #[test]
    fn test_light_square_needs_inversion() {
        let img = dark_square_image().map(|v| 1.0 - v);
        let direct = Mser::new().detect(&img, &mut Progress::silent()).unwrap();
        assert!(direct.is_empty());
        let inverted = Mser::new()
            .detect(&img.map(|v| 1.0 - v), &mut Progress::silent())
            .unwrap();
        assert_eq!(inverted.len(), 1);
    }

    #[test]
    fn test_min_area_filters_specks() {
        let mut img = Field::filled(32, 32, 0.9f32);
        img.set(5, 5, 0.05);
        img.set(20, 11, 0.05);
        let regions = Mser::new().detect(&img, &mut Progress::silent()).unwrap();
        assert!(regions.is_empty());
    }

    #[test]
    fn test_nested_regions_respect_diversity() {
        // A dark core inside a mid-dark ring: two stable nested regions
        // with clearly different areas.
        let img = Field::from_fn(48, 48, |x, y| {
            let dx = x as i64 - 24;
            let dy = y as i64 - 24;
            let d2 = dx * dx + dy * dy;
            if d2 <= 25 {
                0.05
            } else if d2 <= 196 {
                0.4
            } else {
                0.95
            }
        });
        let regions = Mser::new().detect(&img, &mut Progress::silent()).unwrap();
        assert_eq!(regions.len(), 2);
        let mut areas: Vec<usize> = regions.iter().map(|r| r.area).collect();
        areas.sort_unstable();
        // Core of radius 5, outer disc of radius 14.
        assert!(areas[0] > 60 && areas[0] < 100);
        assert!(areas[1] > 550 && areas[1] < 650);
    }

    #[test]
    fn test_gradient_image_is_unstable() {
        let img = Field::from_fn(32, 32, |x, _| x as f32 / 31.0);
        let regions = Mser::new().detect(&img, &mut Progress::silent()).unwrap();
        assert!(regions.is_empty());
    }
}
