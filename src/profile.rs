//! Execution-time profiler
//!
//! Collects run durations into summary statistics and a linear histogram.
//!
//! Author: Moroya Sakamoto

use core::fmt::{self, Write};

use crate::config::{PROFILE_BINS, PROFILE_MAX_SECS, PROFILE_MIN_SECS};
use crate::error::SchedError;
use crate::timer::{duration_secs, Duration};

/// Width of profile banner lines
const PAGE_WIDTH: usize = 80;

/// Banner line padded with dashes to the page width
pub(crate) fn write_banner<W: Write>(w: &mut W, title: &str) -> fmt::Result {
    writeln!(w, "{title:-<width$}", width = PAGE_WIDTH)
}

/// Render into a fresh string
pub(crate) fn render(f: impl FnOnce(&mut String) -> fmt::Result) -> String {
    let mut out = String::new();
    // writing to a String cannot fail
    let _ = f(&mut out);
    out
}

/// Summary of the recorded samples, all times in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileSummary {
    pub runs: u64,
    pub mean: f64,
    /// Sample standard deviation (None for a single run)
    pub std_dev: Option<f64>,
    pub max: f64,
}

/// Duration histogram with running statistics
#[derive(Debug, Clone)]
pub struct Profiler {
    bins: Vec<u64>,
    min: f64,
    max: f64,
    bin_width: f64,
    runs: u64,
    sum: f64,
    sum_sq: f64,
    longest: f64,
}

impl Default for Profiler {
    fn default() -> Self {
        let width = (PROFILE_MAX_SECS - PROFILE_MIN_SECS) / PROFILE_BINS as f64;
        Self {
            bins: vec![0; PROFILE_BINS],
            min: PROFILE_MIN_SECS,
            max: PROFILE_MAX_SECS,
            bin_width: width,
            runs: 0,
            sum: 0.0,
            sum_sq: 0.0,
            longest: 0.0,
        }
    }
}

impl Profiler {
    /// Profiler with `count` bins spanning `min..max` seconds
    pub fn with_bins(count: usize, min: f64, max: f64) -> Result<Self, SchedError> {
        let mut profiler = Self::default();
        profiler.set_bins(count, min, max)?;
        Ok(profiler)
    }

    /// Re-bin; clears all samples.
    pub fn set_bins(&mut self, count: usize, min: f64, max: f64) -> Result<(), SchedError> {
        if count < 1 || !(min >= 0.0) || !(max >= 0.0) || min >= max {
            return Err(SchedError::InvalidHistogram {
                bins: count,
                min,
                max,
            });
        }
        self.bins = vec![0; count];
        self.min = min;
        self.max = max;
        self.bin_width = (max - min) / count as f64;
        self.clear();
        Ok(())
    }

    /// Record one run duration
    pub fn record(&mut self, elapsed: Duration) {
        self.record_secs(duration_secs(elapsed));
    }

    /// Record one run duration given in seconds
    pub fn record_secs(&mut self, secs: f64) {
        self.runs += 1;
        self.sum += secs;
        self.sum_sq += secs * secs;
        if secs > self.longest {
            self.longest = secs;
        }
        let last = self.bins.len() - 1;
        let bin = ((secs - self.min) / self.bin_width).max(0.0) as usize;
        self.bins[bin.min(last)] += 1;
    }

    /// Drop all samples, keep the binning
    pub fn clear(&mut self) {
        self.runs = 0;
        self.sum = 0.0;
        self.sum_sq = 0.0;
        self.longest = 0.0;
        self.bins.iter_mut().for_each(|b| *b = 0);
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Histogram span in seconds
    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    /// Statistics, or None if nothing was recorded
    pub fn summary(&self) -> Option<ProfileSummary> {
        if self.runs == 0 {
            return None;
        }
        let n = self.runs as f64;
        let mean = self.sum / n;
        let std_dev = (self.runs > 1)
            .then(|| ((self.sum_sq - n * mean * mean) / (n - 1.0)).max(0.0).sqrt());
        Some(ProfileSummary {
            runs: self.runs,
            mean,
            std_dev,
            max: self.longest,
        })
    }

    /// (bin centre in seconds, count) pairs
    pub fn histogram(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.bins
            .iter()
            .enumerate()
            .map(|(i, &count)| (self.min + self.bin_width * (i as f64 + 0.5), count))
    }

    /// Render the summary block
    pub fn write_profile<W: Write>(&self, w: &mut W) -> fmt::Result {
        let Some(s) = self.summary() else {
            return writeln!(w, "Did not run\n");
        };
        writeln!(w, "Number of runs:     {}", s.runs)?;
        writeln!(w, "Average duration:   {:.6} sec", s.mean)?;
        if let Some(sd) = s.std_dev {
            writeln!(w, "Standard deviation: {sd:.6} sec")?;
        }
        writeln!(w, "Maximum duration:   {:.6} sec", s.max)?;
        writeln!(w)
    }

    /// Render the histogram table
    pub fn write_histogram<W: Write>(&self, w: &mut W) -> fmt::Result {
        for (centre, count) in self.histogram() {
            writeln!(w, "{centre:12.6} {count:12}")?;
        }
        Ok(())
    }
}
