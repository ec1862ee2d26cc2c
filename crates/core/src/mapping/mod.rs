use std::{fmt, str::FromStr, sync::OnceLock};

use serde::{Deserialize, Serialize};

use crate::{AnalysisSnapshot, AnalysisTap, Result, WavtapError};

pub const DEFAULT_MIN_DECIBELS: f32 = -100.0;
pub const DEFAULT_MAX_DECIBELS: f32 = -30.0;

static OCTAVE_8_FREQUENCIES: [f32; 12] = [
    4186.01, 4434.92, 4698.63, 4978.03, 5274.04, 5587.65, 5919.91, 6271.93, 6644.88, 7040.0,
    7458.62, 7902.13,
];
static NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];
const VOICE_RANGE_HZ: (f32, f32) = (32.0, 2000.0);

/// Grouping scheme used to reduce raw magnitudes to a band set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presentation {
    /// One band per raw transform bin.
    #[default]
    Frequency,
    /// Equal-tempered notes C1 through B8.
    Music,
    /// The notes that fall inside the range of the human voice.
    Voice,
}

impl Presentation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Frequency => "frequency",
            Self::Music => "music",
            Self::Voice => "voice",
        }
    }
}

impl fmt::Display for Presentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Presentation {
    type Err = WavtapError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "frequency" => Ok(Self::Frequency),
            "music" => Ok(Self::Music),
            "voice" => Ok(Self::Voice),
            other => Err(WavtapError::invalid_input(format!(
                "unknown presentation `{other}`, expected frequency, music or voice"
            ))),
        }
    }
}

/// Converts the tap's raw spectrum into named, normalised bands.
pub trait BandMapper {
    fn map(
        &self,
        tap: &AnalysisTap,
        sample_rate: u32,
        presentation: Presentation,
        min_level: f32,
        max_level: f32,
    ) -> Result<AnalysisSnapshot>;
}

/// Default mapper: raw bins for [`Presentation::Frequency`], peak-per-note
/// aggregation for [`Presentation::Music`] and [`Presentation::Voice`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoteBandMapper;

impl BandMapper for NoteBandMapper {
    fn map(
        &self,
        tap: &AnalysisTap,
        sample_rate: u32,
        presentation: Presentation,
        min_level: f32,
        max_level: f32,
    ) -> Result<AnalysisSnapshot> {
        let spectrum = tap.float_frequency_data()?;
        Ok(map_spectrum(
            &spectrum,
            sample_rate,
            presentation,
            min_level,
            max_level,
        ))
    }
}

/// Reduces a decibel spectrum covering `[0, nyquist)` to the bands of
/// `presentation`.
pub fn map_spectrum(
    spectrum: &[f32],
    sample_rate: u32,
    presentation: Presentation,
    min_level: f32,
    max_level: f32,
) -> AnalysisSnapshot {
    let nyquist = sample_rate as f32 / 2.0;
    let step = if spectrum.is_empty() {
        0.0
    } else {
        nyquist / spectrum.len() as f32
    };

    let (levels, frequencies, labels) = match presentation {
        Presentation::Frequency => {
            let frequencies: Vec<f32> = (0..spectrum.len()).map(|i| i as f32 * step).collect();
            let labels = frequencies.iter().map(|f| format!("{f:.2} Hz")).collect();
            (spectrum.to_vec(), frequencies, labels)
        }
        Presentation::Music | Presentation::Voice => {
            let notes = if presentation == Presentation::Voice {
                voice_notes()
            } else {
                music_notes()
            };
            let mut levels = vec![min_level; band_count(presentation, spectrum.len())];

            for (index, level) in spectrum.iter().enumerate() {
                let frequency = index as f32 * step;
                if let Some(band) = notes.iter().rposition(|note| frequency > note.frequency) {
                    levels[band] = levels[band].max(*level);
                }
            }

            (
                levels,
                notes.iter().map(|note| note.frequency).collect(),
                notes.iter().map(|note| note.label.clone()).collect(),
            )
        }
    };

    AnalysisSnapshot {
        values: levels
            .into_iter()
            .map(|level| normalise(level, min_level, max_level))
            .collect(),
        frequencies,
        labels,
    }
}

fn normalise(level: f32, min_level: f32, max_level: f32) -> f32 {
    let range = max_level - min_level;
    if range <= f32::EPSILON {
        return if level >= max_level { 1.0 } else { 0.0 };
    }

    let scaled = (level - min_level) / range;
    if scaled.is_nan() {
        0.0
    } else {
        scaled.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone)]
struct Note {
    frequency: f32,
    label: String,
}

fn music_notes() -> &'static [Note] {
    static NOTES: OnceLock<Vec<Note>> = OnceLock::new();
    NOTES.get_or_init(|| {
        (1..=8)
            .flat_map(|octave| {
                let divisor = 2_f32.powi(8 - octave);
                OCTAVE_8_FREQUENCIES
                    .iter()
                    .zip(NOTE_NAMES)
                    .map(move |(frequency, name)| Note {
                        frequency: frequency / divisor,
                        label: format!("{name}{octave}"),
                    })
            })
            .collect()
    })
}

fn voice_notes() -> &'static [Note] {
    static NOTES: OnceLock<Vec<Note>> = OnceLock::new();
    NOTES.get_or_init(|| {
        music_notes()
            .iter()
            .filter(|note| note.frequency > VOICE_RANGE_HZ.0 && note.frequency < VOICE_RANGE_HZ.1)
            .cloned()
            .collect()
    })
}

/// Number of bands `presentation` produces for a tap with `bin_count` bins.
pub fn band_count(presentation: Presentation, bin_count: usize) -> usize {
    match presentation {
        Presentation::Frequency => bin_count,
        Presentation::Music => music_notes().len(),
        Presentation::Voice => voice_notes().len(),
    }
}
