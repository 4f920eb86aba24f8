//! PCM helpers: decode uploaded audio, normalize it to the canonical layout
//! and encode WAV.

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{Error, Result};

/// Decoded interleaved PCM in the `[-1.0, 1.0]` range
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f32 / self.sample_rate as f32
    }
}

/// Sniff the container and decode it. WAV goes through `hound`; MP3, FLAC,
/// Ogg and MP4/M4A go through `symphonia` format detection.
pub fn decode(bytes: &[u8]) -> Result<DecodedAudio> {
    let audio = if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        decode_wav(bytes)?
    } else {
        decode_compressed(bytes)?
    };
    if audio.sample_rate == 0 || audio.channels == 0 {
        return Err(Error::UnsupportedFormat(format!(
            "{} Hz, {} channel audio cannot be used",
            audio.sample_rate, audio.channels
        )));
    }
    Ok(audio)
}

fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| Error::UnsupportedFormat(format!("invalid WAV: {}", e)))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 || spec.channels == 0 {
        return Err(Error::UnsupportedFormat(format!(
            "WAV header declares {} Hz, {} channels",
            spec.sample_rate, spec.channels
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::UnsupportedFormat(format!("corrupt WAV data: {}", e)))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::UnsupportedFormat(format!("corrupt WAV data: {}", e)))?
        }
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

fn decode_compressed(bytes: &[u8]) -> Result<DecodedAudio> {
    let source = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let detected = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::UnsupportedFormat(format!("unrecognized audio data: {}", e)))?;
    let mut format = detected.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| Error::UnsupportedFormat("no audio track found".to_string()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| Error::UnsupportedFormat(format!("unsupported codec: {}", e)))?;

    let mut samples = Vec::new();
    let mut sample_rate = params.sample_rate.unwrap_or(0);
    let mut channels = params.channels.map(|c| c.count() as u16).unwrap_or(0);

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(Error::UnsupportedFormat(format!("corrupt audio stream: {}", e))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count() as u16;
                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buffer.samples());
            }
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!(error = e, "skipping undecodable packet");
            }
            Err(e) => return Err(Error::UnsupportedFormat(format!("audio decode failed: {}", e))),
        }
    }

    if samples.is_empty() {
        return Err(Error::UnsupportedFormat(
            "audio stream contains no decodable frames".to_string(),
        ));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Average interleaved channels down to mono
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

/// Simple linear interpolation resampling. A zero rate yields no output.
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == 0 || to_rate == 0 {
        return Vec::new();
    }
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (input.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 * ratio;
        let idx = src_idx as usize;
        let frac = (src_idx - idx as f64) as f32;

        let sample = match (input.get(idx), input.get(idx + 1)) {
            (Some(a), Some(b)) => a * (1.0 - frac) + b * frac,
            (Some(a), None) => *a,
            _ => 0.0,
        };
        output.push(sample);
    }

    output
}

/// Mono at `target_rate`, no matter what came in
pub fn normalize(audio: &DecodedAudio, target_rate: u32) -> DecodedAudio {
    let mono = to_mono(&audio.samples, audio.channels);
    DecodedAudio {
        samples: resample(&mono, audio.sample_rate, target_rate),
        sample_rate: target_rate,
        channels: 1,
    }
}

/// Encode as 16-bit PCM WAV
pub fn encode_wav(audio: &DecodedAudio) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::Storage(format!("WAV encode: {}", e)))?;
        for &sample in &audio.samples {
            let clamped = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(clamped)
                .map_err(|e| Error::Storage(format!("WAV encode: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| Error::Storage(format!("WAV encode: {}", e)))?;
    }
    Ok(cursor.into_inner())
}

/// Encode captured 16-bit mono PCM as WAV
pub fn pcm16_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    encode_wav(&DecodedAudio {
        samples: samples.iter().map(|&s| s as f32 / 32768.0).collect(),
        sample_rate,
        channels: 1,
    })
}
