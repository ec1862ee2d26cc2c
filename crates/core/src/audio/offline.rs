use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};

use super::{
    decode::decode_off_thread,
    render::{Renderer, SharedRenderer},
    AudioBackend, AudioDevice, MixerRoute, RouteEventSender, RouteId, SampleBuffer,
};
use crate::{AnalysisTap, Result, WavtapError};

const RENDER_QUANTUM: usize = 128;

/// Deterministic backend whose clock only moves when the caller renders.
///
/// Clones share the device opened through any of them, so a test or an
/// offline job can keep a handle while the session owns the device.
#[derive(Debug, Clone)]
pub struct OfflineBackend {
    control: Arc<Mutex<OfflineControl>>,
}

#[derive(Debug)]
struct OfflineControl {
    channels: usize,
    start_suspended: bool,
    open_failure: Option<String>,
    resume_failure: Option<String>,
    opened: usize,
    suspended: bool,
    renderer: Option<SharedRenderer>,
}

impl Default for OfflineBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineBackend {
    /// Creates a running stereo backend.
    pub fn new() -> Self {
        Self {
            control: Arc::new(Mutex::new(OfflineControl {
                channels: 2,
                start_suspended: false,
                open_failure: None,
                resume_failure: None,
                opened: 0,
                suspended: false,
                renderer: None,
            })),
        }
    }

    pub fn with_channels(self, channels: usize) -> Self {
        self.configure(|control| control.channels = channels.max(1))
    }

    /// Devices open suspended and need a resume before their clock runs.
    pub fn suspended(self) -> Self {
        self.configure(|control| control.start_suspended = true)
    }

    /// Opening a device fails with `reason`.
    pub fn unavailable(self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.configure(move |control| control.open_failure = Some(reason))
    }

    /// Devices open suspended and refuse to resume.
    pub fn resume_fails(self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.configure(move |control| {
            control.start_suspended = true;
            control.resume_failure = Some(reason);
        })
    }

    /// Number of devices opened through this backend.
    pub fn open_count(&self) -> usize {
        self.lock().map(|control| control.opened).unwrap_or(0)
    }

    /// Renders `seconds` of output, rounded to whole frames, and discards it.
    pub fn advance(&self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() {
            return Err(WavtapError::invalid_input(format!(
                "cannot advance the offline clock by {seconds} seconds"
            )));
        }

        let Some((renderer, channels)) = self.running_renderer()? else {
            return Ok(());
        };
        let mut renderer = renderer.lock().map_err(poisoned)?;

        let mut remaining = (seconds.max(0.0) * renderer.sample_rate() as f64).round() as u64;
        let mut scratch = vec![0.0; RENDER_QUANTUM * channels];
        while remaining > 0 {
            let frames = remaining.min(RENDER_QUANTUM as u64) as usize;
            renderer.render(&mut scratch[..frames * channels], channels);
            remaining -= frames as u64;
        }

        Ok(())
    }

    /// Renders `frames` frames and returns the interleaved output. A suspended
    /// device renders nothing.
    pub fn render_frames(&self, frames: usize) -> Result<Vec<f32>> {
        let Some((renderer, channels)) = self.running_renderer()? else {
            return Ok(Vec::new());
        };

        let len = frames.checked_mul(channels).ok_or_else(|| {
            WavtapError::invalid_input(format!("cannot render {frames} frames at once"))
        })?;
        let mut output = vec![0.0; len];
        let mut renderer = renderer.lock().map_err(poisoned)?;
        for quantum in output.chunks_mut(RENDER_QUANTUM * channels) {
            renderer.render(quantum, channels);
        }

        Ok(output)
    }

    /// Current clock of the opened device.
    pub fn clock(&self) -> Result<f64> {
        let renderer = self.renderer()?;
        let clock = renderer.lock().map_err(poisoned)?.clock();
        Ok(clock)
    }

    /// Renderer and channel count of the opened device, or `None` while it
    /// is suspended.
    fn running_renderer(&self) -> Result<Option<(SharedRenderer, usize)>> {
        let control = self.lock()?;
        let renderer = control
            .renderer
            .clone()
            .ok_or(WavtapError::State("offline device has not been opened"))?;

        Ok((!control.suspended).then_some((renderer, control.channels)))
    }

    fn renderer(&self) -> Result<SharedRenderer> {
        self.lock()?
            .renderer
            .clone()
            .ok_or(WavtapError::State("offline device has not been opened"))
    }

    fn configure(self, apply: impl FnOnce(&mut OfflineControl)) -> Self {
        if let Ok(mut control) = self.control.lock() {
            apply(&mut control);
        }
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, OfflineControl>> {
        self.control.lock().map_err(poisoned)
    }
}

impl AudioBackend for OfflineBackend {
    type Device = OfflineDevice;

    fn open(
        &self,
        sample_rate: u32,
        tap: AnalysisTap,
        events: RouteEventSender,
    ) -> Result<Self::Device> {
        let mut control = self.lock()?;
        if let Some(reason) = &control.open_failure {
            return Err(WavtapError::device(reason.clone()));
        }

        let renderer = Renderer::new(sample_rate, tap, events).shared();
        control.renderer = Some(renderer.clone());
        control.suspended = control.start_suspended;
        control.opened += 1;

        Ok(OfflineDevice {
            control: self.control.clone(),
            renderer,
            sample_rate,
            next_route: 0,
        })
    }
}

/// Device handle produced by [`OfflineBackend`].
#[derive(Debug)]
pub struct OfflineDevice {
    control: Arc<Mutex<OfflineControl>>,
    renderer: SharedRenderer,
    sample_rate: u32,
    next_route: u64,
}

impl AudioDevice for OfflineDevice {
    type Route = MixerRoute;

    fn is_suspended(&self) -> bool {
        self.control
            .lock()
            .map(|control| control.suspended)
            .unwrap_or(true)
    }

    fn resume(&mut self) -> BoxFuture<'_, Result<()>> {
        let result = self.control.lock().map_err(poisoned).and_then(|mut control| {
            match &control.resume_failure {
                Some(reason) => Err(WavtapError::device(reason.clone())),
                None => {
                    control.suspended = false;
                    Ok(())
                }
            }
        });
        futures::future::ready(result).boxed()
    }

    fn decode(&self, bytes: Bytes) -> BoxFuture<'static, Result<SampleBuffer>> {
        decode_off_thread(bytes, self.sample_rate).boxed()
    }

    fn clock(&self) -> f64 {
        self.renderer
            .lock()
            .map(|renderer| renderer.clock())
            .unwrap_or(0.0)
    }

    fn create_route(&mut self, buffer: Arc<SampleBuffer>) -> Result<Self::Route> {
        self.next_route += 1;
        Ok(MixerRoute::new(
            RouteId(self.next_route),
            buffer,
            self.renderer.clone(),
        ))
    }
}

impl Drop for OfflineDevice {
    fn drop(&mut self) {
        if let Ok(mut control) = self.control.lock() {
            let owned = control
                .renderer
                .as_ref()
                .is_some_and(|renderer| Arc::ptr_eq(renderer, &self.renderer));
            if owned {
                control.renderer = None;
            }
        }
    }
}

fn poisoned<T>(_: T) -> WavtapError {
    WavtapError::device("offline device has been poisoned")
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{audio::OutputRoute, SessionConfig};

    fn open(backend: &OfflineBackend) -> OfflineDevice {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tap = AnalysisTap::new(&SessionConfig::with_sample_rate(100));
        backend.open(100, tap, tx).unwrap()
    }

    #[test]
    fn clock_follows_rendered_frames() {
        let backend = OfflineBackend::new();
        let device = open(&backend);

        backend.advance(1.5).unwrap();
        assert!((device.clock() - 1.5).abs() < 1e-9);
        assert!((backend.clock().unwrap() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn suspended_devices_hold_their_clock() {
        let backend = OfflineBackend::new().suspended();
        let mut device = open(&backend);
        assert!(device.is_suspended());

        assert!(backend.render_frames(50).unwrap().is_empty());
        assert_eq!(device.clock(), 0.0);

        futures::executor::block_on(device.resume()).unwrap();
        backend.advance(0.5).unwrap();
        assert!((device.clock() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn long_advances_render_in_quanta() {
        let backend = OfflineBackend::new();
        let device = open(&backend);

        backend.advance(3_600.0).unwrap();
        assert!((device.clock() - 3_600.0).abs() < 1e-6);
    }

    #[test]
    fn non_finite_advances_are_rejected() {
        let backend = OfflineBackend::new();
        let device = open(&backend);

        for seconds in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let err = backend.advance(seconds).unwrap_err();
            assert!(matches!(err, WavtapError::InvalidInput(_)));
        }
        assert_eq!(device.clock(), 0.0);
    }

    #[test]
    fn suspended_devices_ignore_advances() {
        let backend = OfflineBackend::new().suspended();
        let device = open(&backend);

        backend.advance(1.0).unwrap();
        assert_eq!(device.clock(), 0.0);
    }

    #[test]
    fn routes_render_into_output() {
        let backend = OfflineBackend::new().with_channels(1);
        let mut device = open(&backend);
        let buffer = Arc::new(SampleBuffer::new(100, vec![vec![0.25; 10]]).unwrap());

        let mut route = device.create_route(buffer).unwrap();
        route.start(0.0).unwrap();
        let output = backend.render_frames(12).unwrap();

        assert_eq!(&output[..10], &[0.25; 10]);
        assert_eq!(&output[10..], &[0.0, 0.0]);
    }

    #[test]
    fn unavailable_backends_fail_to_open() {
        let backend = OfflineBackend::new().unavailable("no sound card");
        let (tx, _rx) = mpsc::unbounded_channel();
        let tap = AnalysisTap::new(&SessionConfig::default());

        let err = backend.open(44_100, tap, tx).unwrap_err();
        assert!(matches!(err, WavtapError::Device(_)));
        assert_eq!(backend.open_count(), 0);
    }

    #[test]
    fn dropping_the_device_releases_the_renderer() {
        let backend = OfflineBackend::new();
        drop(open(&backend));

        assert!(matches!(backend.advance(1.0), Err(WavtapError::State(_))));
    }
}
