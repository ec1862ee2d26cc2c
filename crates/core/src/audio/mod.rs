//! Audio device backends.
//!
//! A backend opens a device at a fixed sample rate. The device decodes
//! encoded assets into [`SampleBuffer`]s, reports a monotonic clock, and
//! creates [`OutputRoute`]s that play a buffer through the session's
//! [`AnalysisTap`] to the output. Completion of a route is reported as a
//! [`RouteEvent`] on the channel handed to [`AudioBackend::open`].

mod decode;
mod offline;
mod render;

#[cfg(feature = "cpal-output")]
mod cpal_output;

use std::{fmt, sync::Arc};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::{AnalysisTap, Result, WavtapError};

#[cfg(feature = "cpal-output")]
pub use cpal_output::{CpalBackend, CpalDevice};
pub use decode::decode_audio;
pub use offline::{OfflineBackend, OfflineDevice};
pub use render::MixerRoute;

/// Sending half of the route completion channel.
pub type RouteEventSender = mpsc::UnboundedSender<RouteEvent>;
/// Receiving half of the route completion channel.
pub type RouteEventReceiver = mpsc::UnboundedReceiver<RouteEvent>;

/// Creates a connection between audio devices and the session that owns them.
pub trait AudioBackend {
    type Device: AudioDevice;

    /// Opens an output device rendering at `sample_rate`. Everything the
    /// device renders must be fed to `tap`.
    fn open(
        &self,
        sample_rate: u32,
        tap: AnalysisTap,
        events: RouteEventSender,
    ) -> Result<Self::Device>;
}

/// An open output device.
pub trait AudioDevice {
    type Route: OutputRoute;

    /// Whether the device clock is halted until [`AudioDevice::resume`].
    fn is_suspended(&self) -> bool;

    fn resume(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Decodes an encoded asset into samples at the device sample rate.
    fn decode(&self, bytes: Bytes) -> BoxFuture<'static, Result<SampleBuffer>>;

    /// Seconds of audio rendered since the device was opened.
    fn clock(&self) -> f64;

    /// Creates an unstarted route that will play `buffer`.
    fn create_route(&mut self, buffer: Arc<SampleBuffer>) -> Result<Self::Route>;
}

/// A live connection from decoded samples to the device output.
///
/// Dropping a route stops it.
pub trait OutputRoute {
    fn id(&self) -> RouteId;

    /// Begins playback `offset` seconds into the buffer. A route can only be
    /// started once.
    fn start(&mut self, offset: f64) -> Result<()>;

    /// Halts playback. Safe to call repeatedly and on unstarted routes.
    /// Stopping never produces a [`RouteEvent::Ended`].
    fn stop(&mut self);
}

/// Identifies a single output route on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(pub u64);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route-{}", self.0)
    }
}

/// Notification emitted by the device rendering context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteEvent {
    /// The route played its buffer to the end.
    Ended(RouteId),
}

/// Immutable decoded audio, stored planar.
#[derive(Clone, PartialEq)]
pub struct SampleBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl SampleBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self> {
        if sample_rate == 0 {
            return Err(WavtapError::decode("sample buffer requires a positive sample rate"));
        }
        let Some(first) = channels.first() else {
            return Err(WavtapError::decode("sample buffer requires at least one channel"));
        };
        if channels.iter().any(|channel| channel.len() != first.len()) {
            return Err(WavtapError::decode("sample buffer channels differ in length"));
        }

        Ok(Self {
            sample_rate,
            channels,
        })
    }

    /// Builds a buffer from interleaved samples. A trailing partial frame is
    /// discarded.
    pub fn from_interleaved(sample_rate: u32, channel_count: usize, samples: &[f32]) -> Result<Self> {
        if channel_count == 0 {
            return Err(WavtapError::decode("sample buffer requires at least one channel"));
        }

        let frames = samples.len() / channel_count;
        let mut channels = vec![Vec::with_capacity(frames); channel_count];
        for frame in samples.chunks_exact(channel_count) {
            for (channel, sample) in channels.iter_mut().zip(frame) {
                channel.push(*sample);
            }
        }

        Self::new(sample_rate, channels)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub(crate) fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }
}

impl fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels.len())
            .field("frames", &self.frames())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deinterleaves_frames() {
        let buffer = SampleBuffer::from_interleaved(4, 2, &[0.1, -0.1, 0.2, -0.2, 0.3]).unwrap();

        assert_eq!(buffer.channel_count(), 2);
        assert_eq!(buffer.frames(), 2);
        assert_eq!(buffer.channel(1), Some(&[-0.1, -0.2][..]));
        assert!((buffer.duration() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_ragged_channels() {
        let err = SampleBuffer::new(8, vec![vec![0.0; 4], vec![0.0; 3]]).unwrap_err();
        assert!(matches!(err, WavtapError::Decode(_)));
    }
}
