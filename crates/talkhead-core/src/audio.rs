//! WAV decoding and per-frame energy used for activity-based segment cuts.

use std::path::Path;

use crate::error::{Error, Result};

/// Mono samples in `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Number of video frames the clip spans at `fps`, rounded up.
    pub fn frame_count(&self, fps: u32) -> usize {
        if self.sample_rate == 0 || fps == 0 {
            return 0;
        }
        let frames = self.samples.len() as u64 * fps as u64;
        frames.div_ceil(self.sample_rate as u64) as usize
    }
}

pub fn read_wav(path: &Path) -> Result<Waveform> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            Error::NotFound(format!("Audio file not found: {}", path.display()))
        }
        _ => Error::Io(e),
    })?;
    decode_wav_bytes(&bytes)
}

pub fn decode_wav_bytes(wav_bytes: &[u8]) -> Result<Waveform> {
    let cursor = std::io::Cursor::new(wav_bytes);
    let mut reader = hound::WavReader::new(cursor)
        .map_err(|e| Error::InvalidInput(format!("Failed to parse WAV: {}", e)))?;

    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let mut samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample.max(1) as u32;
            let max_val = if bits > 1 {
                ((1i64 << (bits - 1)) - 1) as f32
            } else {
                1.0
            };
            reader
                .samples::<i32>()
                .filter_map(|s| s.ok())
                .map(|s| (s as f32 / max_val).clamp(-1.0, 1.0))
                .collect()
        }
        hound::SampleFormat::Float => reader.samples::<f32>().filter_map(|s| s.ok()).collect(),
    };

    if channels > 1 {
        samples = samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();
    }

    for sample in &mut samples {
        *sample = if sample.is_finite() {
            sample.clamp(-1.0, 1.0)
        } else {
            0.0
        };
    }

    Ok(Waveform {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// RMS energy of the audio under each video frame.
pub fn frame_energy(waveform: &Waveform, fps: u32) -> Vec<f32> {
    let frames = waveform.frame_count(fps);
    if frames == 0 {
        return Vec::new();
    }
    let rate = waveform.sample_rate as u64;
    let len = waveform.samples.len();

    (0..frames as u64)
        .map(|k| {
            let start = ((k * rate) / fps as u64) as usize;
            let end = ((((k + 1) * rate) / fps as u64) as usize).min(len);
            let window = &waveform.samples[start.min(end)..end];
            if window.is_empty() {
                return 0.0;
            }
            let power: f32 = window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32;
            power.sqrt()
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn write_test_wav(path: &Path, samples: &[f32], sample_rate: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for sample in samples {
        writer
            .write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
}
