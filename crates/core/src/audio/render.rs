use std::sync::{Arc, Mutex, MutexGuard};

use super::{OutputRoute, RouteEvent, RouteEventSender, RouteId, SampleBuffer};
use crate::{AnalysisTap, Result, WavtapError};

pub(crate) type SharedRenderer = Arc<Mutex<Renderer>>;

/// Rendering context shared by the device and its routes.
///
/// Holds at most one active route. Every rendered frame advances the clock
/// and is mirrored into the analysis tap, silence included.
#[derive(Debug)]
pub(crate) struct Renderer {
    sample_rate: u32,
    frames_rendered: u64,
    active: Option<ActiveRoute>,
    tap: AnalysisTap,
    events: RouteEventSender,
    mono: Vec<f32>,
}

impl Renderer {
    pub(crate) fn new(sample_rate: u32, tap: AnalysisTap, events: RouteEventSender) -> Self {
        Self {
            sample_rate,
            frames_rendered: 0,
            active: None,
            tap,
            events,
            mono: Vec::new(),
        }
    }

    pub(crate) fn shared(self) -> SharedRenderer {
        Arc::new(Mutex::new(self))
    }

    pub(crate) fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub(crate) fn clock(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    pub(crate) fn active_route(&self) -> Option<RouteId> {
        self.active.as_ref().map(|route| route.id)
    }

    fn attach(&mut self, id: RouteId, buffer: Arc<SampleBuffer>, offset: f64) {
        let start = (offset.max(0.0) * self.sample_rate as f64).round() as usize;
        let cursor = start.min(buffer.frames());
        self.active = Some(ActiveRoute { id, buffer, cursor });
    }

    fn detach(&mut self, id: RouteId) -> bool {
        if self.active_route() == Some(id) {
            self.active = None;
            true
        } else {
            false
        }
    }

    /// Fills `out` with interleaved frames of `channels` samples.
    pub(crate) fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        self.mono.clear();

        for frame in out.chunks_mut(channels) {
            let mixed = match self.active.as_mut() {
                Some(route) => route.next_frame(frame),
                None => {
                    frame.fill(0.0);
                    0.0
                }
            };
            self.mono.push(mixed);

            if self.active.as_ref().is_some_and(ActiveRoute::is_finished) {
                if let Some(route) = self.active.take() {
                    tracing::debug!(route = %route.id, "route reached end of buffer");
                    let _ = self.events.send(RouteEvent::Ended(route.id));
                }
            }
        }

        self.frames_rendered += self.mono.len() as u64;
        self.tap.push_samples(&self.mono);
    }
}

#[derive(Debug)]
struct ActiveRoute {
    id: RouteId,
    buffer: Arc<SampleBuffer>,
    cursor: usize,
}

impl ActiveRoute {
    fn is_finished(&self) -> bool {
        self.cursor >= self.buffer.frames()
    }

    /// Writes the next buffer frame into `frame` and returns its mono mix.
    fn next_frame(&mut self, frame: &mut [f32]) -> f32 {
        if self.is_finished() {
            frame.fill(0.0);
            return 0.0;
        }

        let sources = self.buffer.channels();
        let index = self.cursor;
        self.cursor += 1;

        let mixed = sources.iter().map(|channel| channel[index]).sum::<f32>() / sources.len() as f32;

        if frame.len() == 1 {
            frame[0] = mixed;
        } else if sources.len() == 1 {
            frame.fill(sources[0][index]);
        } else {
            for (channel, out) in frame.iter_mut().enumerate() {
                *out = sources.get(channel).map(|source| source[index]).unwrap_or(0.0);
            }
        }

        mixed
    }
}

/// [`OutputRoute`] that plays through a shared [`Renderer`].
#[derive(Debug)]
pub struct MixerRoute {
    id: RouteId,
    buffer: Arc<SampleBuffer>,
    renderer: SharedRenderer,
    started: bool,
}

impl MixerRoute {
    pub(crate) fn new(id: RouteId, buffer: Arc<SampleBuffer>, renderer: SharedRenderer) -> Self {
        Self {
            id,
            buffer,
            renderer,
            started: false,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Renderer>> {
        self.renderer
            .lock()
            .map_err(|_| WavtapError::device("renderer has been poisoned"))
    }
}

impl OutputRoute for MixerRoute {
    fn id(&self) -> RouteId {
        self.id
    }

    fn start(&mut self, offset: f64) -> Result<()> {
        if self.started {
            return Err(WavtapError::State("output route already started"));
        }

        let mut renderer = self.lock()?;
        renderer.attach(self.id, self.buffer.clone(), offset);
        drop(renderer);

        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        if !self.started {
            return;
        }
        if let Ok(mut renderer) = self.renderer.lock() {
            if renderer.detach(self.id) {
                tracing::debug!(route = %self.id, "route stopped");
            }
        }
    }
}

impl Drop for MixerRoute {
    fn drop(&mut self) {
        self.stop();
    }
}
