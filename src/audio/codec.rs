//! PCM codec
//!
//! Converts between float samples, 16-bit little-endian PCM and the base64
//! form that travels over the live channel. Everything here is pure.

use std::fmt;
use std::io::Cursor;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::{Error, Result};

/// Width of one PCM sample in bytes
pub const SAMPLE_WIDTH: usize = 2;

/// Full-scale value used for float/int conversion
const FULL_SCALE: f32 = 32767.0;

/// Lowest sample rate accepted from a peer
pub const MIN_SAMPLE_RATE: u32 = 8_000;

/// Highest sample rate accepted from a peer
pub const MAX_SAMPLE_RATE: u32 = 192_000;

/// Reject rates outside `MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE`
fn check_rate(rate: u32) -> Result<u32> {
    if (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
        Ok(rate)
    } else {
        Err(Error::MalformedChunk(format!(
            "sample rate {rate} outside {MIN_SAMPLE_RATE}..={MAX_SAMPLE_RATE}"
        )))
    }
}

/// A fixed-length run of mono 16-bit samples at a known rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioFrame {
    /// Wrap already-quantized samples
    #[must_use]
    pub const fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Quantize float samples, saturating at the i16 bounds
    #[must_use]
    pub fn from_f32(samples: &[f32], sample_rate: u32) -> Self {
        let samples = samples.iter().map(|&s| quantize(s)).collect();
        Self {
            samples,
            sample_rate,
        }
    }

    /// Samples as floats in `[-1, 1]`
    #[must_use]
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples
            .iter()
            .map(|&s| f32::from(s) / FULL_SCALE)
            .collect()
    }

    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    /// Consume the frame, returning its samples
    #[must_use]
    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}

/// Payload encoding carried by an [`EncodedChunk`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Raw signed 16-bit little-endian PCM
    Pcm16,
    /// MPEG layer III
    Mp3,
}

/// Encoding plus declared sample rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: Encoding,
    pub sample_rate: u32,
}

impl AudioFormat {
    /// 16-bit PCM at the given rate
    #[must_use]
    pub const fn pcm(sample_rate: u32) -> Self {
        Self {
            encoding: Encoding::Pcm16,
            sample_rate,
        }
    }

    /// MP3 with a nominal rate (the real rate comes from the stream)
    #[must_use]
    pub const fn mp3(sample_rate: u32) -> Self {
        Self {
            encoding: Encoding::Mp3,
            sample_rate,
        }
    }

    /// Parse a mime descriptor such as `audio/pcm;rate=24000`
    ///
    /// A missing `rate` parameter falls back to `default_rate`.
    ///
    /// # Errors
    ///
    /// Returns `MalformedChunk` for non-audio or unknown encodings, and for
    /// rates outside [`MIN_SAMPLE_RATE`]..=[`MAX_SAMPLE_RATE`]
    pub fn from_mime(mime: &str, default_rate: u32) -> Result<Self> {
        let mut parts = mime.split(';').map(str::trim);
        let essence = parts.next().unwrap_or_default().to_ascii_lowercase();

        let encoding = match essence.as_str() {
            "audio/pcm" | "audio/l16" | "audio/raw" => Encoding::Pcm16,
            "audio/mpeg" | "audio/mp3" => Encoding::Mp3,
            other => {
                return Err(Error::MalformedChunk(format!(
                    "unsupported audio mime type: {other}"
                )));
            }
        };

        let mut sample_rate = default_rate;
        for param in parts {
            if let Some((key, value)) = param.split_once('=')
                && key.trim().eq_ignore_ascii_case("rate")
            {
                sample_rate = value.trim().parse().map_err(|_| {
                    Error::MalformedChunk(format!("invalid rate parameter: {value}"))
                })?;
            }
        }

        Ok(Self {
            encoding,
            sample_rate: check_rate(sample_rate)?,
        })
    }

    /// Render as a mime descriptor
    #[must_use]
    pub fn mime_type(&self) -> String {
        match self.encoding {
            Encoding::Pcm16 => format!("audio/pcm;rate={}", self.sample_rate),
            Encoding::Mp3 => "audio/mpeg".to_string(),
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mime_type())
    }
}

/// Transport-safe (base64) audio payload tagged with its format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    data: String,
    format: AudioFormat,
}

impl EncodedChunk {
    /// Wrap base64 text received from a peer
    #[must_use]
    pub const fn new(data: String, format: AudioFormat) -> Self {
        Self { data, format }
    }

    /// Encode raw payload bytes (PCM or MP3) for transport
    #[must_use]
    pub fn from_bytes(bytes: &[u8], format: AudioFormat) -> Self {
        Self {
            data: STANDARD.encode(bytes),
            format,
        }
    }

    /// Base64 payload
    #[must_use]
    pub fn data(&self) -> &str {
        &self.data
    }

    #[must_use]
    pub const fn format(&self) -> AudioFormat {
        self.format
    }

    #[must_use]
    pub fn mime_type(&self) -> String {
        self.format.mime_type()
    }
}

/// Encode a frame as base64 16-bit little-endian PCM
#[must_use]
pub fn encode(frame: &AudioFrame) -> EncodedChunk {
    let bytes: Vec<u8> = frame
        .samples
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect();
    EncodedChunk::from_bytes(&bytes, AudioFormat::pcm(frame.sample_rate))
}

/// Decode a chunk into a frame at `target_rate`
///
/// Resamples (linear interpolation) only when the declared rate differs.
///
/// # Errors
///
/// Returns `MalformedChunk` if the payload is not valid base64, if a PCM
/// payload is not a whole number of samples, if an MP3 payload fails to
/// decode, or if either rate is outside the accepted band
pub fn decode(chunk: &EncodedChunk, target_rate: u32) -> Result<AudioFrame> {
    check_rate(target_rate)?;
    let bytes = STANDARD
        .decode(chunk.data.as_bytes())
        .map_err(|e| Error::MalformedChunk(format!("invalid base64 payload: {e}")))?;

    let (samples, source_rate) = match chunk.format.encoding {
        Encoding::Pcm16 => (
            pcm_from_le_bytes(&bytes)?,
            check_rate(chunk.format.sample_rate)?,
        ),
        Encoding::Mp3 => decode_mp3(&bytes)?,
    };

    if source_rate == target_rate || samples.is_empty() {
        return Ok(AudioFrame::new(samples, target_rate));
    }

    Ok(AudioFrame::new(
        resample_linear(&samples, source_rate, target_rate),
        target_rate,
    ))
}

/// Parse little-endian i16 PCM
fn pcm_from_le_bytes(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % SAMPLE_WIDTH != 0 {
        return Err(Error::MalformedChunk(format!(
            "payload length {} is not a multiple of {SAMPLE_WIDTH}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(SAMPLE_WIDTH)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Decode MP3 bytes to mono i16 samples and their sample rate
fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<i16>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(sample_rate);
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|pair| {
                        let left = i32::from(pair[0]);
                        let right = i32::from(pair.get(1).copied().unwrap_or(pair[0]));
                        #[allow(clippy::cast_possible_truncation)]
                        let mixed = ((left + right) / 2) as i16;
                        mixed
                    }));
                } else {
                    samples.extend_from_slice(&frame.data);
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::MalformedChunk(format!("MP3 decode error: {e}"))),
        }
    }

    // minimp3 skips junk, so a non-MP3 payload just runs out of input
    if samples.is_empty() && !mp3_data.is_empty() {
        return Err(Error::MalformedChunk("no MP3 frames in payload".to_string()));
    }
    if samples.is_empty() {
        return Ok((samples, sample_rate));
    }

    Ok((samples, check_rate(sample_rate)?))
}

/// Resample by linear interpolation
///
/// Output length is `round(len * to / from)`, so duration is preserved to
/// within one sample.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn resample_linear(samples: &[i16], from: u32, to: u32) -> Vec<i16> {
    if from == to || from == 0 || to == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = ((samples.len() as u64 * u64::from(to) + u64::from(from) / 2)
        / u64::from(from)) as usize;
    let step = f64::from(from) / f64::from(to);
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let index = (pos.floor() as usize).min(last);
            let next = (index + 1).min(last);
            let frac = pos - index as f64;
            let a = f64::from(samples[index]);
            let b = f64::from(samples[next]);
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Convert frames to WAV bytes
///
/// # Errors
///
/// Returns error if the frames disagree on sample rate or WAV encoding fails
pub fn frames_to_wav(frames: &[AudioFrame]) -> Result<Vec<u8>> {
    let sample_rate = frames.first().map_or(16_000, AudioFrame::sample_rate);
    if frames.iter().any(|f| f.sample_rate != sample_rate) {
        return Err(Error::MalformedChunk(
            "cannot write frames with mixed sample rates".to_string(),
        ));
    }

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::Device(format!("WAV writer: {e}")))?;

        for &sample in frames.iter().flat_map(|f| f.samples.iter()) {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Device(format!("WAV write: {e}")))?;
        }

        writer
            .finalize()
            .map_err(|e| Error::Device(format!("WAV finalize: {e}")))?;
    }

    Ok(cursor.into_inner())
}

#[allow(clippy::cast_possible_truncation)]
fn quantize(sample: f32) -> i16 {
    (sample * FULL_SCALE)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}
