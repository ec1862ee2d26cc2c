use std::{
    collections::VecDeque,
    f32::consts::PI,
    fmt,
    sync::{Arc, Mutex},
};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{Result, SessionConfig, WavtapError};

/// Caller-facing result of a frequency query.
///
/// `values`, `frequencies` and `labels` always have the same length, fixed by
/// the presentation that produced the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    /// Normalised [0, 1] intensity of each band.
    pub values: Vec<f32>,
    /// Reference frequency of each band in Hz.
    pub frequencies: Vec<f32>,
    pub labels: Vec<String>,
}

impl AnalysisSnapshot {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the index and value of the most intense band, if any.
    pub fn peak(&self) -> Option<(usize, f32)> {
        self.values
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (index, value)| match best {
                Some((_, top)) if top >= value => best,
                _ => Some((index, value)),
            })
    }
}

/// Point in the output route from which spectral magnitudes are read.
///
/// Every frame rendered by the device is mixed down to mono and appended to a
/// sliding window of `fft_size` samples. Reading the spectrum does not affect
/// audible output. Clones share the same window.
///
/// The window and the transform state sit behind separate locks, so a
/// running analysis never holds up the render thread pushing samples.
#[derive(Clone)]
pub struct AnalysisTap {
    fft_size: usize,
    window: Arc<Mutex<SampleWindow>>,
    analysis: Arc<Mutex<Analysis>>,
}

impl AnalysisTap {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            fft_size: config.fft_size,
            window: Arc::new(Mutex::new(SampleWindow::new(config.fft_size))),
            analysis: Arc::new(Mutex::new(Analysis::new(
                config.fft_size,
                config.bin_count(),
                config.smoothing_time_constant,
            ))),
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Appends mono samples to the analysis window, evicting the oldest ones.
    pub fn push_samples(&self, samples: &[f32]) {
        // A poisoned tap only loses analysis data; output keeps flowing.
        if let Ok(mut window) = self.window.lock() {
            window.push(samples);
        }
    }

    /// Returns the current magnitude spectrum in decibels, `fft_size / 2`
    /// values.
    ///
    /// The transform and smoothing only advance when samples arrived since
    /// the previous read; otherwise the previous spectrum is returned as is.
    /// Silent bins report negative infinity.
    pub fn float_frequency_data(&self) -> Result<Vec<f32>> {
        let mut analysis = self
            .analysis
            .lock()
            .map_err(|_| WavtapError::State("analysis tap has been poisoned"))?;

        {
            let window = self
                .window
                .lock()
                .map_err(|_| WavtapError::State("analysis tap has been poisoned"))?;
            if analysis.generation == Some(window.generation) {
                return Ok(analysis.decibels.clone());
            }
            analysis.load(&window);
        }

        analysis.transform()?;
        Ok(analysis.decibels.clone())
    }
}

impl fmt::Debug for AnalysisTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisTap")
            .field("fft_size", &self.fft_size)
            .finish()
    }
}

struct SampleWindow {
    capacity: usize,
    samples: VecDeque<f32>,
    /// Bumped by every non-empty push.
    generation: u64,
}

impl SampleWindow {
    fn new(capacity: usize) -> Self {
        let mut samples = VecDeque::with_capacity(capacity);
        samples.resize(capacity, 0.0);

        Self {
            capacity,
            samples,
            generation: 0,
        }
    }

    fn push(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }

        let skip = samples.len().saturating_sub(self.capacity);
        for sample in &samples[skip..] {
            if self.samples.len() == self.capacity {
                self.samples.pop_front();
            }
            self.samples.push_back(*sample);
        }
        self.generation = self.generation.wrapping_add(1);
    }
}

struct Analysis {
    smoothing: f32,
    smoothed: Vec<f32>,
    decibels: Vec<f32>,
    /// Window generation the current `decibels` were computed from.
    generation: Option<u64>,
    fft: FftResources,
}

impl Analysis {
    fn new(fft_size: usize, bins: usize, smoothing: f32) -> Self {
        Self {
            smoothing,
            smoothed: vec![0.0; bins],
            decibels: Vec::with_capacity(bins),
            generation: None,
            fft: FftResources::new(fft_size),
        }
    }

    /// Copies the windowed samples into the transform input.
    fn load(&mut self, window: &SampleWindow) {
        let fft = &mut self.fft;
        for (index, sample) in window.samples.iter().enumerate() {
            fft.input[index] = *sample * fft.blackman[index];
        }
        self.generation = Some(window.generation);
    }

    fn transform(&mut self) -> Result<()> {
        let fft = &mut self.fft;
        let scale = 1.0 / fft.input.len() as f32;

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let tau = self.smoothing;
        self.decibels.clear();
        for (previous, bin) in self.smoothed.iter_mut().zip(fft.spectrum.iter()) {
            let magnitude = bin.norm() * scale;
            *previous = tau * *previous + (1.0 - tau) * magnitude;
            self.decibels.push(20.0 * previous.log10());
        }

        Ok(())
    }
}

struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
    blackman: Vec<f32>,
}

impl FftResources {
    fn new(size: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(size);

        Self {
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            blackman: (0..size).map(|index| blackman_value(index, size)).collect(),
            plan,
        }
    }
}

fn blackman_value(index: usize, len: usize) -> f32 {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;

    let phase = 2.0 * PI * index as f32 / len as f32;
    A0 - A1 * phase.cos() + A2 * (2.0 * phase).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tap(fft_size: usize) -> AnalysisTap {
        AnalysisTap::new(&SessionConfig {
            sample_rate: 8_000,
            fft_size,
            smoothing_time_constant: 0.0,
        })
    }

    fn sine(frequency: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * frequency * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn silence_reports_negative_infinity() {
        let tap = tap(256);
        let spectrum = tap.float_frequency_data().unwrap();

        assert_eq!(spectrum.len(), 128);
        assert!(spectrum.iter().all(|db| *db == f32::NEG_INFINITY));
    }

    #[test]
    fn sine_peaks_at_its_bin() {
        let tap = tap(256);
        // 1000 Hz at 8 kHz with 256 bins of 31.25 Hz lands exactly on bin 32.
        tap.push_samples(&sine(1000.0, 8_000.0, 512));

        let spectrum = tap.float_frequency_data().unwrap();
        let (peak, _) = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();

        assert_eq!(peak, 32);
    }

    #[test]
    fn window_keeps_only_latest_samples() {
        let tap = tap(64);
        tap.push_samples(&sine(1000.0, 8_000.0, 64));
        tap.push_samples(&[0.0; 64]);

        let spectrum = tap.float_frequency_data().unwrap();
        assert!(spectrum.iter().all(|db| *db == f32::NEG_INFINITY));
    }

    #[test]
    fn smoothing_advances_only_with_new_samples() {
        let tap = AnalysisTap::new(&SessionConfig {
            sample_rate: 8_000,
            fft_size: 256,
            smoothing_time_constant: 0.5,
        });
        tap.push_samples(&sine(1000.0, 8_000.0, 256));

        let first = tap.float_frequency_data().unwrap();
        let repeated = tap.float_frequency_data().unwrap();
        assert_eq!(first, repeated);

        // 256 samples hold a whole number of periods, so the window is unchanged
        // but counts as new audio.
        tap.push_samples(&sine(1000.0, 8_000.0, 256));
        let blended = tap.float_frequency_data().unwrap();

        // Half of the steady magnitude first, three quarters after the blend.
        approx::assert_abs_diff_eq!(blended[32] - first[32], 20.0 * 1.5_f32.log10(), epsilon = 1e-3);
    }

    #[test]
    fn empty_pushes_do_not_count_as_new_audio() {
        let tap = AnalysisTap::new(&SessionConfig {
            sample_rate: 8_000,
            fft_size: 256,
            smoothing_time_constant: 0.5,
        });
        tap.push_samples(&sine(1000.0, 8_000.0, 256));

        let first = tap.float_frequency_data().unwrap();
        tap.push_samples(&[]);
        assert_eq!(tap.float_frequency_data().unwrap(), first);
    }

    #[test]
    fn pushing_does_not_wait_for_a_running_analysis() {
        let tap = tap(256);
        let _analysis = tap.analysis.lock().unwrap();

        let writer = tap.clone();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            writer.push_samples(&[0.5; 64]);
            let _ = done_tx.send(());
        });

        assert!(done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .is_ok());
        assert_eq!(tap.window.lock().unwrap().generation, 1);
    }

    #[test]
    fn snapshot_peak_picks_first_maximum() {
        let snapshot = AnalysisSnapshot {
            values: vec![0.1, 0.7, 0.7, 0.2],
            frequencies: vec![1.0, 2.0, 3.0, 4.0],
            labels: vec!["a".into(), "b".into(), "c".into(), "d".into()],
        };

        assert_eq!(snapshot.peak(), Some((1, 0.7)));
        assert_eq!(AnalysisSnapshot::default().peak(), None);
    }
}
