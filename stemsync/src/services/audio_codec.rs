//! PCM decode, resample and WAV encode
//!
//! Decoding goes through symphonia (any supported container/codec), sample
//! rate conversion through rubato, and stem files are written with hound as
//! 32-bit float WAV.

use anyhow::{bail, Context, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

const RESAMPLE_CHUNK_FRAMES: usize = 1024;

/// Interleaved f32 PCM audio
#[derive(Debug, Clone, PartialEq)]
pub struct PcmAudio {
    /// Interleaved samples, nominally in -1.0..=1.0
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.frames() as f64 / self.sample_rate as f64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// One sample vector per channel
    pub fn to_planar(&self) -> Vec<Vec<f32>> {
        let channels = self.channels.max(1) as usize;
        let frames = self.frames();
        let mut planar = vec![Vec::with_capacity(frames); channels];
        for frame in self.samples.chunks_exact(channels) {
            for (ch, &s) in frame.iter().enumerate() {
                planar[ch].push(s);
            }
        }
        planar
    }

    pub fn from_planar(planar: &[Vec<f32>], sample_rate: u32) -> Self {
        let channels = planar.len();
        let frames = planar.iter().map(Vec::len).min().unwrap_or(0);
        let mut samples = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            for ch in planar {
                samples.push(ch[i]);
            }
        }
        Self::new(samples, sample_rate, channels as u16)
    }
}

/// Container-level facts about an audio file
#[derive(Debug, Clone, PartialEq)]
pub struct AudioInfo {
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Lowercase file extension, or "unknown"
    pub format: String,
}

/// Decode an audio file to interleaved f32 at its native rate
pub fn decode_file(path: &Path) -> Result<PcmAudio> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open audio file: {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .context("Failed to probe audio format")?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("No audio tracks found in file")?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .context("Failed to create decoder")?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_rate = codec_params.sample_rate.unwrap_or(0);
    let mut channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(0);

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e).context("Failed to read packet"),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping undecodable packet in {}: {}", path.display(), e);
                continue;
            }
            Err(e) => return Err(e).context("Failed to decode packet"),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count() as u16;

        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buf.samples());
    }

    if sample_rate == 0 || channels == 0 {
        bail!("Audio stream has no sample rate or channel layout");
    }

    debug!(
        path = %path.display(),
        sample_rate,
        channels,
        frames = samples.len() / channels as usize,
        "Decoded audio"
    );

    Ok(PcmAudio::new(samples, sample_rate, channels))
}

/// Read duration, rate and channel count
///
/// Uses the container's frame count when present, else decodes the stream.
pub fn probe_info(path: &Path) -> Result<AudioInfo> {
    let format_name = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "unknown".to_string());

    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open audio file: {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    hint.with_extension(&format_name);

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .context("Failed to probe audio format")?;

    let params = probed
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .map(|t| t.codec_params.clone())
        .context("No audio tracks found in file")?;

    if let (Some(rate), Some(frames), Some(layout)) =
        (params.sample_rate, params.n_frames, params.channels)
    {
        return Ok(AudioInfo {
            duration: frames as f64 / rate as f64,
            sample_rate: rate,
            channels: layout.count() as u16,
            format: format_name,
        });
    }

    let audio = decode_file(path)?;
    Ok(AudioInfo {
        duration: audio.duration_secs(),
        sample_rate: audio.sample_rate,
        channels: audio.channels,
        format: format_name,
    })
}

/// Force exactly two channels
///
/// Mono is duplicated into both channels; more than two channels keeps the
/// first two.
pub fn coerce_stereo(audio: PcmAudio) -> PcmAudio {
    match audio.channels {
        2 => audio,
        0 => PcmAudio::new(Vec::new(), audio.sample_rate, 2),
        1 => {
            let mut samples = Vec::with_capacity(audio.samples.len() * 2);
            for &s in &audio.samples {
                samples.push(s);
                samples.push(s);
            }
            PcmAudio::new(samples, audio.sample_rate, 2)
        }
        n => {
            let n = n as usize;
            let mut samples = Vec::with_capacity(audio.frames() * 2);
            for frame in audio.samples.chunks_exact(n) {
                samples.push(frame[0]);
                samples.push(frame[1]);
            }
            PcmAudio::new(samples, audio.sample_rate, 2)
        }
    }
}

/// Resample to `target_rate` with a sinc interpolator
///
/// Returns the input unchanged when the rate already matches.
pub fn resample(audio: PcmAudio, target_rate: u32) -> Result<PcmAudio> {
    if audio.sample_rate == target_rate || audio.is_empty() {
        return Ok(PcmAudio {
            sample_rate: target_rate,
            ..audio
        });
    }

    let source_rate = audio.sample_rate;
    let channels = audio.channels as usize;
    let frames = audio.frames();
    let planar = audio.to_planar();

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = target_rate as f64 / source_rate as f64;
    let mut resampler =
        SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK_FRAMES, channels)
            .context("Failed to create rubato resampler")?;

    let expected = (frames as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); channels];

    fn append(block: Vec<Vec<f32>>, output: &mut [Vec<f32>]) {
        for (out, chunk) in output.iter_mut().zip(block) {
            out.extend_from_slice(&chunk);
        }
    }

    let mut pos = 0;
    while pos + RESAMPLE_CHUNK_FRAMES <= frames {
        let block: Vec<&[f32]> = planar
            .iter()
            .map(|ch| &ch[pos..pos + RESAMPLE_CHUNK_FRAMES])
            .collect();
        let out = resampler
            .process(&block, None)
            .context("Rubato resampling failed")?;
        append(out, &mut output);
        pos += RESAMPLE_CHUNK_FRAMES;
    }

    if pos < frames {
        let block: Vec<&[f32]> = planar.iter().map(|ch| &ch[pos..]).collect();
        let out = resampler
            .process_partial(Some(block.as_slice()), None)
            .context("Rubato resampling failed")?;
        append(out, &mut output);
    }

    // Flush the filter delay
    while output[0].len() < expected + delay {
        let out = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .context("Rubato resampling failed")?;
        if out.first().map_or(true, Vec::is_empty) {
            break;
        }
        append(out, &mut output);
    }

    for ch in output.iter_mut() {
        let end = (delay + expected).min(ch.len());
        let start = delay.min(end);
        *ch = ch[start..end].to_vec();
    }

    debug!(
        "Resampled {} frames ({} Hz) → {} frames ({} Hz)",
        frames,
        source_rate,
        output[0].len(),
        target_rate
    );

    Ok(PcmAudio::from_planar(&output, target_rate))
}

/// Write 32-bit float WAV atomically
///
/// Samples go to `<path>.part` first, which is renamed over `path` only once
/// the writer has finalized, so readers never see a truncated file.
pub fn write_wav(path: &Path, audio: &PcmAudio) -> Result<()> {
    let spec = hound::WavSpec {
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let part = part_path(path);
    let result = (|| -> Result<()> {
        let mut writer = hound::WavWriter::create(&part, spec)
            .with_context(|| format!("Failed to create {}", part.display()))?;
        for &sample in &audio.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize().context("Failed to finalize WAV")?;
        std::fs::rename(&part, path)
            .with_context(|| format!("Failed to move stem into place: {}", path.display()))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&part);
    }
    result
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}
