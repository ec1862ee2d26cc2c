use std::{fmt, sync::Arc};

use tokio::sync::mpsc;

use crate::{
    audio::{
        AudioBackend, AudioDevice, OutputRoute, RouteEvent, RouteEventReceiver, RouteEventSender,
        SampleBuffer,
    },
    mapping::{DEFAULT_MAX_DECIBELS, DEFAULT_MIN_DECIBELS},
    AnalysisSnapshot, AnalysisTap, AudioSource, BandMapper, NoteBandMapper, Presentation, Result,
    SessionConfig, WavtapError,
};

type RouteOf<B> = <<B as AudioBackend>::Device as AudioDevice>::Route;

/// Playback lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No buffer has been loaded yet.
    Idle,
    /// A buffer is loaded and positioned at its start.
    Loaded,
    Playing,
    /// Playback halted; the next `play` resumes from the paused position.
    Paused,
}

struct Connection<D> {
    device: D,
    tap: AnalysisTap,
}

/// Loads one audio asset at a time, plays it through an exclusively owned
/// device, and answers frequency queries from the device's analysis tap.
///
/// Positions are derived from the device clock: while playing, the current
/// time is `clock - start_reference`, where `start_reference` is the clock
/// value that corresponds to the start of the buffer for the current run.
pub struct PlaybackSession<B: AudioBackend, M: BandMapper = NoteBandMapper> {
    config: SessionConfig,
    backend: B,
    mapper: M,
    route: Option<RouteOf<B>>,
    connection: Option<Connection<B::Device>>,
    buffer: Option<Arc<SampleBuffer>>,
    transport: TransportState,
    start_reference: f64,
    paused_offset: f64,
    events_tx: RouteEventSender,
    events: RouteEventReceiver,
}

impl<B: AudioBackend> PlaybackSession<B> {
    /// Creates an unconnected session that maps bands with [`NoteBandMapper`].
    pub fn new(config: SessionConfig, backend: B) -> Result<Self> {
        Self::with_mapper(config, backend, NoteBandMapper)
    }
}

impl<B: AudioBackend, M: BandMapper> PlaybackSession<B, M> {
    pub fn with_mapper(config: SessionConfig, backend: B, mapper: M) -> Result<Self> {
        config.validate()?;
        let (events_tx, events) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            backend,
            mapper,
            route: None,
            connection: None,
            buffer: None,
            transport: TransportState::Idle,
            start_reference: 0.0,
            paused_offset: 0.0,
            events_tx,
            events,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn tap(&self) -> Option<&AnalysisTap> {
        self.connection.as_ref().map(|connection| &connection.tap)
    }

    /// Duration of the loaded buffer in seconds.
    pub fn duration(&self) -> Option<f64> {
        self.buffer.as_ref().map(|buffer| buffer.duration())
    }

    pub fn state(&mut self) -> TransportState {
        self.poll_events();
        self.transport
    }

    /// Logical playback position in seconds.
    pub fn current_time(&mut self) -> f64 {
        self.poll_events();
        match self.transport {
            TransportState::Playing => self.elapsed(),
            _ => self.paused_offset,
        }
    }

    /// Opens the device and its analysis tap. Does nothing when already
    /// connected. On failure no device is retained.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        let tap = AnalysisTap::new(&self.config);
        let mut device = self.backend.open(
            self.config.sample_rate,
            tap.clone(),
            self.events_tx.clone(),
        )?;

        if device.is_suspended() {
            device.resume().await?;
        }

        tracing::debug!(sample_rate = self.config.sample_rate, "session connected");
        self.connection = Some(Connection { device, tap });
        Ok(())
    }

    /// Resolves, decodes and stores `source`, replacing any loaded buffer.
    ///
    /// Connects first when needed. The previous buffer keeps playing until the
    /// new one has decoded; it is then stopped and the transport is reset to
    /// [`TransportState::Loaded`]. On failure the session is left as it was,
    /// including dropping a connection opened by this call.
    pub async fn load_file<S>(&mut self, source: S) -> Result<()>
    where
        S: TryInto<AudioSource>,
        WavtapError: From<S::Error>,
    {
        let source = source.try_into()?;
        let kind = source.kind();
        let bytes = source.into_bytes().await?;

        let connected_here = self.connection.is_none();
        self.connect().await?;

        let decoded = match self.connection.as_ref() {
            Some(connection) => connection.device.decode(bytes).await,
            None => Err(WavtapError::State("not connected, call connect first")),
        };

        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                if connected_here {
                    self.connection = None;
                }
                return Err(err);
            }
        };

        self.release_route();
        tracing::debug!(
            source = kind,
            duration = decoded.duration(),
            channels = decoded.channel_count(),
            "audio buffer loaded"
        );
        self.buffer = Some(Arc::new(decoded));
        self.paused_offset = 0.0;
        self.transport = TransportState::Loaded;
        Ok(())
    }

    /// Starts or resumes playback. Does nothing while already playing.
    pub fn play(&mut self) -> Result<()> {
        self.poll_events();
        if self.transport == TransportState::Playing {
            return Ok(());
        }

        let buffer = self
            .buffer
            .clone()
            .ok_or(WavtapError::State("no audio buffer loaded, call load_file first"))?;

        self.release_route();
        let connection = self
            .connection
            .as_mut()
            .ok_or(WavtapError::State("not connected, call connect first"))?;

        let offset = self.paused_offset;
        let mut route = connection.device.create_route(buffer)?;
        route.start(offset)?;
        self.start_reference = connection.device.clock() - offset;

        tracing::debug!(route = %route.id(), offset, "playback started");
        self.route = Some(route);
        self.transport = TransportState::Playing;
        Ok(())
    }

    /// Halts playback and remembers the position. Does nothing unless playing.
    pub fn pause(&mut self) {
        self.poll_events();
        if self.transport != TransportState::Playing {
            return;
        }

        let elapsed = self.elapsed();
        self.release_route();
        self.paused_offset = elapsed;
        self.transport = TransportState::Paused;
        tracing::debug!(offset = elapsed, "playback paused");
    }

    /// Halts playback and rewinds to the start. Safe in every state.
    pub fn stop(&mut self) {
        self.poll_events();
        self.release_route();
        self.paused_offset = 0.0;
        self.transport = if self.buffer.is_some() {
            TransportState::Loaded
        } else {
            TransportState::Idle
        };
        tracing::debug!(state = ?self.transport, "playback stopped");
    }

    /// Applies every pending route event.
    pub fn poll_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.apply(event);
        }
    }

    /// Reads the current spectrum and reduces it to the bands of
    /// `presentation`, scaling `[min_level, max_level]` dB to `[0, 1]`.
    pub fn get_frequencies(
        &self,
        presentation: Presentation,
        min_level: f32,
        max_level: f32,
    ) -> Result<AnalysisSnapshot> {
        let tap = self
            .tap()
            .ok_or(WavtapError::State("not connected, call connect first"))?;

        self.mapper
            .map(tap, self.config.sample_rate, presentation, min_level, max_level)
    }

    /// [`PlaybackSession::get_frequencies`] with raw bins and the default
    /// -100 dB to -30 dB range.
    pub fn get_default_frequencies(&self) -> Result<AnalysisSnapshot> {
        self.get_frequencies(
            Presentation::default(),
            DEFAULT_MIN_DECIBELS,
            DEFAULT_MAX_DECIBELS,
        )
    }

    fn apply(&mut self, event: RouteEvent) {
        match event {
            RouteEvent::Ended(id) => {
                let current = self.route.as_ref().map(OutputRoute::id);
                if self.transport != TransportState::Playing || current != Some(id) {
                    tracing::trace!(route = %id, "ignoring event from a released route");
                    return;
                }

                self.route = None;
                self.paused_offset = 0.0;
                self.transport = TransportState::Loaded;
                tracing::debug!(route = %id, "playback reached the end of the buffer");
            }
        }
    }

    fn elapsed(&self) -> f64 {
        let Some(connection) = self.connection.as_ref() else {
            return self.paused_offset;
        };

        let elapsed = connection.device.clock() - self.start_reference;
        let duration = self.duration().unwrap_or(0.0);
        elapsed.clamp(0.0, duration)
    }

    fn release_route(&mut self) {
        if let Some(mut route) = self.route.take() {
            route.stop();
        }
    }
}

impl<B: AudioBackend, M: BandMapper> Drop for PlaybackSession<B, M> {
    fn drop(&mut self) {
        self.release_route();
    }
}

impl<B: AudioBackend, M: BandMapper> fmt::Debug for PlaybackSession<B, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("sample_rate", &self.config.sample_rate)
            .field("connected", &self.connection.is_some())
            .field("buffer", &self.buffer)
            .field("transport", &self.transport)
            .field("start_reference", &self.start_reference)
            .field("paused_offset", &self.paused_offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{f32::consts::PI, io::Cursor};

    use approx::assert_abs_diff_eq;
    use serde_json::json;

    use super::*;
    use crate::OfflineBackend;

    const RATE: u32 = 44_100;
    const SAMPLE_PERIOD: f64 = 1.0 / RATE as f64;

    fn tone(seconds: f32, frequency: f32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let frames = (seconds * RATE as f32) as usize;
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames {
                let value = 0.5 * (2.0 * PI * frequency * i as f32 / RATE as f32).sin();
                writer.write_sample((value * i16::MAX as f32) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }

        cursor.into_inner()
    }

    fn session(backend: &OfflineBackend) -> PlaybackSession<OfflineBackend> {
        PlaybackSession::new(SessionConfig::with_sample_rate(RATE), backend.clone()).unwrap()
    }

    async fn loaded(backend: &OfflineBackend) -> PlaybackSession<OfflineBackend> {
        let mut session = session(backend);
        session.load_file(tone(2.0, 220.0)).await.unwrap();
        session
    }

    #[tokio::test]
    async fn load_then_play_starts_at_zero() {
        let backend = OfflineBackend::new();
        let mut session = loaded(&backend).await;

        assert_eq!(session.state(), TransportState::Loaded);
        assert_abs_diff_eq!(session.duration().unwrap(), 2.0, epsilon = SAMPLE_PERIOD);

        session.play().unwrap();
        assert_eq!(session.state(), TransportState::Playing);
        assert_eq!(session.current_time(), 0.0);
    }

    #[tokio::test]
    async fn resume_recomputes_start_reference() {
        let backend = OfflineBackend::new();
        let mut session = loaded(&backend).await;

        backend.advance(10.0).unwrap();
        session.play().unwrap();
        backend.advance(1.5).unwrap();
        assert_abs_diff_eq!(session.current_time(), 1.5, epsilon = SAMPLE_PERIOD);

        session.pause();
        assert_eq!(session.state(), TransportState::Paused);
        assert_abs_diff_eq!(session.paused_offset, 1.5, epsilon = SAMPLE_PERIOD);

        backend.advance(8.5).unwrap();
        assert_abs_diff_eq!(backend.clock().unwrap(), 20.0, epsilon = SAMPLE_PERIOD);
        session.play().unwrap();

        assert_abs_diff_eq!(session.start_reference, 18.5, epsilon = SAMPLE_PERIOD);
        assert_abs_diff_eq!(session.current_time(), 1.5, epsilon = SAMPLE_PERIOD);
    }

    #[tokio::test]
    async fn play_pause_play_resumes_at_reported_offset() {
        let backend = OfflineBackend::new();
        let mut session = loaded(&backend).await;

        session.play().unwrap();
        backend.advance(0.731).unwrap();
        session.pause();
        let reported = session.current_time();

        backend.advance(3.0).unwrap();
        assert_eq!(session.current_time(), reported);

        session.play().unwrap();
        assert_abs_diff_eq!(session.current_time(), reported, epsilon = SAMPLE_PERIOD);

        backend.advance(0.25).unwrap();
        assert_abs_diff_eq!(session.current_time(), reported + 0.25, epsilon = SAMPLE_PERIOD);
    }

    #[tokio::test]
    async fn resumed_output_continues_the_buffer() {
        let backend = OfflineBackend::new().with_channels(1);
        let mut session = session(&backend);
        let samples: Vec<f32> = (0..8).map(|i| i as f32 / 8.0).collect();
        let buffer = SampleBuffer::new(8, vec![samples.clone()]).unwrap();
        session.config.sample_rate = 8;
        session.connect().await.unwrap();
        session.buffer = Some(Arc::new(buffer));
        session.transport = TransportState::Loaded;

        session.play().unwrap();
        let first = backend.render_frames(3).unwrap();
        session.pause();
        let silent = backend.render_frames(2).unwrap();
        session.play().unwrap();
        let rest = backend.render_frames(5).unwrap();

        assert_eq!(first, samples[..3].to_vec());
        assert_eq!(silent, vec![0.0, 0.0]);
        assert_eq!(rest, samples[3..].to_vec());
    }

    #[tokio::test]
    async fn stop_rewinds_from_every_state() {
        let backend = OfflineBackend::new();

        let mut idle = session(&backend);
        idle.stop();
        assert_eq!(idle.state(), TransportState::Idle);
        assert_eq!(idle.current_time(), 0.0);

        let mut session = loaded(&backend).await;
        session.stop();
        assert_eq!(session.state(), TransportState::Loaded);

        session.play().unwrap();
        backend.advance(0.5).unwrap();
        session.stop();
        assert_eq!(session.state(), TransportState::Loaded);
        assert_eq!(session.current_time(), 0.0);

        session.play().unwrap();
        backend.advance(0.5).unwrap();
        session.pause();
        session.stop();
        assert_eq!(session.state(), TransportState::Loaded);
        assert_eq!(session.current_time(), 0.0);

        session.play().unwrap();
        assert_eq!(session.current_time(), 0.0);
    }

    #[tokio::test]
    async fn redundant_transport_calls_are_no_ops() {
        let backend = OfflineBackend::new();
        let mut session = loaded(&backend).await;

        session.pause();
        assert_eq!(session.state(), TransportState::Loaded);
        assert_eq!(session.paused_offset, 0.0);

        session.play().unwrap();
        let route = session.route.as_ref().map(OutputRoute::id);
        let reference = session.start_reference;
        backend.advance(0.5).unwrap();

        session.play().unwrap();
        assert_eq!(session.route.as_ref().map(OutputRoute::id), route);
        assert_eq!(session.start_reference, reference);

        session.pause();
        let offset = session.paused_offset;
        session.pause();
        assert_eq!(session.state(), TransportState::Paused);
        assert_eq!(session.paused_offset, offset);
    }

    #[tokio::test]
    async fn play_requires_a_buffer() {
        let backend = OfflineBackend::new();
        let mut session = session(&backend);

        assert!(matches!(session.play(), Err(WavtapError::State(_))));
        session.connect().await.unwrap();
        assert!(matches!(session.play(), Err(WavtapError::State(_))));
        assert_eq!(session.state(), TransportState::Idle);
    }

    #[tokio::test]
    async fn natural_completion_returns_to_loaded() {
        let backend = OfflineBackend::new();
        let mut session = loaded(&backend).await;

        session.play().unwrap();
        backend.advance(2.5).unwrap();

        assert_eq!(session.state(), TransportState::Loaded);
        assert_eq!(session.current_time(), 0.0);
        assert!(session.route.is_none());

        session.play().unwrap();
        assert_eq!(session.current_time(), 0.0);
    }

    #[tokio::test]
    async fn pausing_is_not_mistaken_for_completion() {
        let backend = OfflineBackend::new();
        let mut session = loaded(&backend).await;

        session.play().unwrap();
        backend.advance(1.0).unwrap();
        session.pause();
        backend.advance(5.0).unwrap();

        assert_eq!(session.state(), TransportState::Paused);
        assert_abs_diff_eq!(session.current_time(), 1.0, epsilon = SAMPLE_PERIOD);
    }

    #[tokio::test]
    async fn frequencies_require_a_connection() {
        let backend = OfflineBackend::new();
        let mut session = session(&backend);

        let err = session.get_default_frequencies().unwrap_err();
        assert!(matches!(err, WavtapError::State(_)));

        session.connect().await.unwrap();
        let cases = [
            (Presentation::Frequency, 4096),
            (Presentation::Music, 96),
            (Presentation::Voice, 72),
        ];
        for (presentation, bands) in cases {
            let snapshot = session.get_frequencies(presentation, -100.0, -30.0).unwrap();
            assert_eq!(snapshot.len(), bands);
            assert_eq!(snapshot.labels.len(), bands);
            assert_eq!(snapshot.frequencies.len(), bands);
        }
    }

    #[tokio::test]
    async fn silence_reads_as_zero_intensity() {
        let backend = OfflineBackend::new();
        let mut session = session(&backend);
        session.connect().await.unwrap();
        backend.advance(0.2).unwrap();

        let snapshot = session.get_default_frequencies().unwrap();
        assert!(snapshot.values.iter().all(|value| *value == 0.0));
    }

    #[tokio::test]
    async fn tone_peaks_at_its_note() {
        let backend = OfflineBackend::new();
        let mut session = session(&backend);
        session.load_file(tone(1.0, 440.0)).await.unwrap();
        session.play().unwrap();
        backend.advance(0.5).unwrap();

        let snapshot = session.get_frequencies(Presentation::Music, -100.0, 0.0).unwrap();
        let (peak, value) = snapshot.peak().unwrap();

        assert_eq!(snapshot.labels[peak], "A4");
        assert!(value > 0.5);
    }

    #[tokio::test]
    async fn repeated_queries_without_new_audio_agree() {
        let backend = OfflineBackend::new();
        let mut session = session(&backend);
        session.load_file(tone(1.0, 440.0)).await.unwrap();
        session.play().unwrap();
        backend.advance(0.5).unwrap();

        let first = session.get_frequencies(Presentation::Frequency, -100.0, -30.0).unwrap();
        let second = session.get_frequencies(Presentation::Frequency, -100.0, -30.0).unwrap();
        assert_eq!(first, second);

        backend.advance(0.1).unwrap();
        let later = session.get_frequencies(Presentation::Frequency, -100.0, -30.0).unwrap();
        assert_eq!(later.len(), first.len());
        assert_eq!(
            session.get_frequencies(Presentation::Frequency, -100.0, -30.0).unwrap(),
            later
        );
    }

    #[tokio::test]
    async fn unsupported_sources_leave_state_untouched() {
        let backend = OfflineBackend::new();
        let mut session = session(&backend);

        let err = session.load_file(json!({ "not": "audio" })).await.unwrap_err();
        assert!(matches!(err, WavtapError::InvalidInput(_)));
        assert_eq!(session.state(), TransportState::Idle);
        assert!(!session.is_connected());
        assert_eq!(backend.open_count(), 0);
    }

    #[tokio::test]
    async fn decode_failures_keep_the_previous_buffer() {
        let backend = OfflineBackend::new();
        let mut session = loaded(&backend).await;
        session.play().unwrap();

        let err = session
            .load_file(b"not an audio file".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, WavtapError::Decode(_)));
        assert_eq!(session.state(), TransportState::Playing);
        assert_abs_diff_eq!(session.duration().unwrap(), 2.0, epsilon = SAMPLE_PERIOD);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn failed_first_load_drops_its_connection() {
        let backend = OfflineBackend::new();
        let mut session = session(&backend);

        let err = session.load_file(vec![0_u8; 64]).await.unwrap_err();
        assert!(matches!(err, WavtapError::Decode(_)));
        assert!(!session.is_connected());
        assert_eq!(session.state(), TransportState::Idle);
    }

    #[tokio::test]
    async fn loading_while_playing_stops_the_old_route() {
        let backend = OfflineBackend::new();
        let mut session = loaded(&backend).await;
        session.play().unwrap();
        backend.advance(0.5).unwrap();

        session.load_file(tone(1.0, 880.0)).await.unwrap();

        assert_eq!(session.state(), TransportState::Loaded);
        assert_eq!(session.current_time(), 0.0);
        assert!(backend.render_frames(256).unwrap().iter().all(|s| *s == 0.0));
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let backend = OfflineBackend::new();
        let mut session = session(&backend);

        session.connect().await.unwrap();
        session.connect().await.unwrap();
        session.load_file(tone(0.1, 220.0)).await.unwrap();

        assert_eq!(backend.open_count(), 1);
    }

    #[tokio::test]
    async fn suspended_devices_are_resumed() {
        let backend = OfflineBackend::new().suspended();
        let mut session = session(&backend);
        session.connect().await.unwrap();

        backend.advance(0.5).unwrap();
        assert_abs_diff_eq!(backend.clock().unwrap(), 0.5, epsilon = SAMPLE_PERIOD);
    }

    #[tokio::test]
    async fn device_failures_leave_no_connection() {
        let unavailable = OfflineBackend::new().unavailable("no output device");
        let mut first = session(&unavailable);
        let err = first.connect().await.unwrap_err();
        assert!(matches!(err, WavtapError::Device(_)));
        assert!(!first.is_connected());

        let stuck = OfflineBackend::new().resume_fails("device stayed suspended");
        let mut second = session(&stuck);
        let err = second.load_file(tone(0.1, 220.0)).await.unwrap_err();
        assert!(matches!(err, WavtapError::Device(_)));
        assert!(!second.is_connected());
        assert!(matches!(stuck.advance(0.1), Err(WavtapError::State(_))));
    }

    #[tokio::test]
    async fn dropping_the_session_releases_the_device() {
        let backend = OfflineBackend::new();
        let mut session = loaded(&backend).await;
        session.play().unwrap();
        drop(session);

        assert!(matches!(backend.advance(0.1), Err(WavtapError::State(_))));
    }
}
