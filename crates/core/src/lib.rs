//! Core library for Wavtap.
//!
//! A [`PlaybackSession`] loads one audio asset, plays it through an
//! [`AudioBackend`] with play/pause/stop transport, and exposes frequency
//! snapshots of what is currently audible. The [`timeline`] module drives
//! repeated snapshots from a render loop.

pub mod analysis;
pub mod assets;
pub mod audio;
pub mod config;
pub mod error;
pub mod mapping;
pub mod session;
pub mod timeline;

pub use analysis::{AnalysisSnapshot, AnalysisTap};
pub use assets::AudioSource;
#[cfg(feature = "cpal-output")]
pub use audio::CpalBackend;
pub use audio::{
    AudioBackend, AudioDevice, OfflineBackend, OutputRoute, RouteEvent, RouteId, SampleBuffer,
};
pub use config::{AppConfig, FrameConfig, SessionConfig};
pub use error::{Result, WavtapError};
pub use mapping::{BandMapper, NoteBandMapper, Presentation};
pub use session::{PlaybackSession, TransportState};
pub use timeline::{FrameHandle, FrameSource, IntervalFrameSource, ManualFrameSource};
