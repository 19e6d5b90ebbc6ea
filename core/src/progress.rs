use std::time::Instant;

/// Hierarchical progress reporter handed to long-running algorithms.
///
/// An algorithm calls [`report`](Progress::report) with how many of its work
/// units are done. Before handing control to a sub-algorithm it calls
/// [`push`](Progress::push), and [`pop`](Progress::pop) afterwards, so nested
/// solvers compose into a single 0..1 figure without knowing about each
/// other. An optional observer fires on every report; a console front-end
/// prints from it, a test samples it.
pub struct Progress {
    levels: Vec<(u64, u64)>,
    started: Instant,
    observer: Option<Box<dyn FnMut(&[(u64, u64)]) + Send>>,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            levels: vec![(0, 1)],
            started: Instant::now(),
            observer: None,
        }
    }

    /// A reporter nobody watches. Call sites that don't care pass this
    /// instead of threading an `Option` everywhere.
    pub fn silent() -> Self {
        Self::new()
    }

    pub fn with_observer(observer: impl FnMut(&[(u64, u64)]) + Send + 'static) -> Self {
        Self {
            levels: vec![(0, 1)],
            started: Instant::now(),
            observer: Some(Box::new(observer)),
        }
    }

    /// Enters a sub-task.
    pub fn push(&mut self) {
        self.levels.push((0, 1));
    }

    /// Leaves a sub-task. At the base level this is a no-op.
    pub fn pop(&mut self) {
        if self.levels.len() > 1 {
            self.levels.pop();
        }
    }

    /// Records `x` of `y` work units done at the current depth.
    /// `x` is clamped to `y`, and `y == 0` is treated as 1.
    pub fn report(&mut self, x: u64, y: u64) {
        let y = y.max(1);
        let x = x.min(y);
        if let Some(level) = self.levels.last_mut() {
            *level = (x, y);
        }
        if let Some(obs) = self.observer.as_mut() {
            obs(&self.levels);
        }
    }

    /// Increments the done count at the current depth by one.
    pub fn next(&mut self) {
        let (x, y) = self.levels.last().copied().unwrap_or((0, 1));
        self.report(x + 1, y);
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// The (done, total) pair at one level of the stack, or `None` past the
    /// current depth.
    pub fn part(&self, index: usize) -> Option<(u64, u64)> {
        self.levels.get(index).copied()
    }

    /// Folds the level stack into a single completion fraction in 0..1.
    /// Each level contributes its own fraction plus a `1/y` share for the
    /// partially complete unit the level below is working on.
    pub fn fraction(&self) -> f32 {
        let mut frac = 0.0f64;
        for &(x, y) in self.levels.iter().rev() {
            frac = (x as f64 + frac) / y as f64;
        }
        frac.clamp(0.0, 1.0) as f32
    }

    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Predicted seconds remaining, or `None` before any progress is made.
    pub fn remaining(&self) -> Option<f64> {
        let frac = self.fraction() as f64;
        if frac <= 0.0 {
            return None;
        }
        let done = self.elapsed();
        Some(done / frac - done)
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_flat_fraction() {
        let mut p = Progress::silent();
        p.report(1, 4);
        assert!((p.fraction() - 0.25).abs() < 1e-6);
        p.report(4, 4);
        assert!((p.fraction() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_nested_fraction() {
        let mut p = Progress::silent();
        p.report(1, 2);
        p.push();
        p.report(1, 2);
        // Half done plus half of the remaining half.
        assert!((p.fraction() - 0.75).abs() < 1e-6);
        p.pop();
        assert_eq!(p.depth(), 1);
    }

    #[test]
    fn test_pop_at_base_is_noop() {
        let mut p = Progress::silent();
        p.pop();
        p.pop();
        assert_eq!(p.depth(), 1);
    }

    #[test]
    fn test_report_clamps() {
        let mut p = Progress::silent();
        p.report(10, 4);
        assert_eq!(p.part(0), Some((4, 4)));
        p.report(0, 0);
        assert_eq!(p.part(0), Some((0, 1)));
    }

    #[test]
    fn test_part_past_depth_is_none() {
        let mut p = Progress::silent();
        assert_eq!(p.part(1), None);
        p.push();
        p.report(2, 5);
        assert_eq!(p.part(1), Some((2, 5)));
        p.pop();
        assert_eq!(p.part(1), None);
    }

    #[test]
    fn test_observer_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut p = Progress::with_observer(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        p.report(1, 3);
        p.next();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
