use std::io::Cursor;

use bytes::Bytes;
use symphonia::core::{
    audio::SampleBuffer as PacketBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::SampleBuffer;
use crate::{Result, WavtapError};

const RESAMPLE_CHUNK: usize = 1024;

/// Decodes an encoded asset and resamples it to `sample_rate`.
///
/// Container and codec are detected from the bytes. Every format enabled on
/// the `symphonia` dependency is accepted.
pub fn decode_audio(data: Bytes, sample_rate: u32) -> Result<SampleBuffer> {
    let cursor = Cursor::new(data);
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| WavtapError::decode(format!("unrecognised audio format: {e}")))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| WavtapError::decode("no audio track found"))?;

    let track_id = track.id;
    let source_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| WavtapError::decode("audio track has no sample rate"))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| WavtapError::decode(format!("failed to create decoder: {e}")))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut channel_count = 0;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(WavtapError::decode(format!("failed to read packet: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!(error = e, "skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(WavtapError::decode(format!("failed to decode packet: {e}"))),
        };

        let spec = *decoded.spec();
        channel_count = spec.channels.count();
        let mut packet_buffer = PacketBuffer::<f32>::new(decoded.capacity() as u64, spec);
        packet_buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(packet_buffer.samples());
    }

    if channel_count == 0 || samples.is_empty() {
        return Err(WavtapError::decode("asset contains no audio frames"));
    }

    let decoded = SampleBuffer::from_interleaved(source_rate, channel_count, &samples)?;
    tracing::debug!(
        source_rate,
        channels = channel_count,
        frames = decoded.frames(),
        "decoded audio asset"
    );

    resample(decoded, sample_rate)
}

/// Runs [`decode_audio`] on the blocking pool.
pub(crate) async fn decode_off_thread(bytes: Bytes, sample_rate: u32) -> Result<SampleBuffer> {
    tokio::task::spawn_blocking(move || decode_audio(bytes, sample_rate))
        .await
        .map_err(|e| WavtapError::decode(format!("decoder task failed: {e}")))?
}

/// Band-limited sinc resampling onto the device rate; matching rates pass
/// through untouched.
fn resample(buffer: SampleBuffer, target_rate: u32) -> Result<SampleBuffer> {
    if buffer.sample_rate() == target_rate {
        return Ok(buffer);
    }

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = target_rate as f64 / buffer.sample_rate() as f64;
    let channel_count = buffer.channel_count();
    let mut resampler =
        SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, channel_count)
            .map_err(|e| WavtapError::decode(format!("failed to create resampler: {e}")))?;

    let frames = buffer.frames();
    let expected = (frames as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output = vec![Vec::with_capacity(expected + delay); channel_count];

    let mut position = 0;
    while position < frames {
        let end = (position + RESAMPLE_CHUNK).min(frames);
        let chunk: Vec<&[f32]> = buffer
            .channels()
            .iter()
            .map(|channel| &channel[position..end])
            .collect();

        let processed = if end - position == RESAMPLE_CHUNK {
            resampler.process(chunk.as_slice(), None)
        } else {
            resampler.process_partial(Some(chunk.as_slice()), None)
        }
        .map_err(|e| WavtapError::decode(format!("resampling failed: {e}")))?;

        append_frames(&mut output, processed);
        position = end;
    }

    // Flush the filter tail so the delayed output covers the whole asset.
    while output.first().map(Vec::len).unwrap_or(0) < expected + delay {
        let processed = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(|e| WavtapError::decode(format!("resampling failed: {e}")))?;
        if processed.first().map_or(true, Vec::is_empty) {
            break;
        }
        append_frames(&mut output, processed);
    }

    for channel in &mut output {
        channel.drain(..delay.min(channel.len()));
        channel.truncate(expected);
    }

    tracing::debug!(
        from = buffer.sample_rate(),
        to = target_rate,
        frames = expected,
        "resampled audio asset"
    );
    SampleBuffer::new(target_rate, output)
}

fn append_frames(output: &mut [Vec<f32>], processed: Vec<Vec<f32>>) {
    for (channel, samples) in output.iter_mut().zip(processed) {
        channel.extend(samples);
    }
}
