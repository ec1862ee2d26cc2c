use std::sync::Arc;

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample, Stream, StreamConfig};
use futures::{future::BoxFuture, FutureExt};

use super::{
    decode::decode_off_thread,
    render::{Renderer, SharedRenderer},
    AudioBackend, AudioDevice, MixerRoute, RouteEventSender, RouteId, SampleBuffer,
};
use crate::{AnalysisTap, Result, WavtapError};

/// Backend that plays through the host's default output device.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    type Device = CpalDevice;

    fn open(
        &self,
        sample_rate: u32,
        tap: AnalysisTap,
        events: RouteEventSender,
    ) -> Result<Self::Device> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| WavtapError::device("no output device available"))?;

        let default = device
            .default_output_config()
            .map_err(|e| WavtapError::device(format!("failed to query output config: {e}")))?;

        let config = StreamConfig {
            channels: default.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let renderer = Renderer::new(sample_rate, tap, events).shared();

        let stream = match default.sample_format() {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, renderer.clone())?,
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, renderer.clone())?,
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, renderer.clone())?,
            format => {
                return Err(WavtapError::device(format!(
                    "unsupported sample format: {format:?}"
                )))
            }
        };

        // Streams may start running on some hosts; keep the clock halted until resume.
        stream
            .pause()
            .map_err(|e| WavtapError::device(format!("failed to pause output stream: {e}")))?;

        tracing::info!(
            device = %device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "opened output device"
        );

        Ok(CpalDevice {
            stream,
            renderer,
            sample_rate,
            suspended: true,
            next_route: 0,
        })
    }
}

fn build_stream<T>(device: &cpal::Device, config: &StreamConfig, renderer: SharedRenderer) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                match renderer.try_lock() {
                    Ok(mut renderer) => renderer.render(&mut scratch, channels),
                    Err(_) => scratch.fill(0.0),
                }
                for (out, sample) in data.iter_mut().zip(&scratch) {
                    *out = T::from_sample(*sample);
                }
            },
            move |err| {
                tracing::warn!(error = %err, "audio output stream error");
            },
            None,
        )
        .map_err(|e| WavtapError::device(format!("failed to build output stream: {e}")))
}

/// Open host output stream. Dropping it halts output.
pub struct CpalDevice {
    stream: Stream,
    renderer: SharedRenderer,
    sample_rate: u32,
    suspended: bool,
    next_route: u64,
}

impl AudioDevice for CpalDevice {
    type Route = MixerRoute;

    fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn resume(&mut self) -> BoxFuture<'_, Result<()>> {
        let result = self
            .stream
            .play()
            .map_err(|e| WavtapError::device(format!("failed to resume output stream: {e}")));
        if result.is_ok() {
            self.suspended = false;
        }
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

impl std::fmt::Debug for CpalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalDevice")
            .field("sample_rate", &self.sample_rate)
            .field("suspended", &self.suspended)
            .finish()
    }
}
