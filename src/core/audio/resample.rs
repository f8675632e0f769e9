//! Streaming sample-rate conversion on top of `rubato`.
//!
//! Providers send audio deltas of arbitrary length while rubato's FFT
//! resampler consumes fixed input chunks, so input is staged until a full
//! chunk is available. The filter delay is trimmed from the front of the
//! stream and `flush` pads the tail, which keeps output aligned with the
//! input timeline: N input samples always yield `N * out / in` output samples.

use rubato::{FftFixedIn, Resampler};

use super::{AudioError, AudioResult};

/// Input consumed per rubato call
const CHUNK_MS: usize = 10;

/// FFT sub-chunks per input chunk; more means lower latency, more CPU
const SUB_CHUNKS: usize = 2;

const FULL_SCALE: f32 = 32768.0;

/// Converts a continuous PCM16 stream from one sample rate to another.
///
/// Input may be pushed in chunks of any size; output is identical to
/// converting the concatenated input in one call. Up to one chunk plus the
/// filter delay is held back until [`flush`].
///
/// [`flush`]: StreamingResampler::flush
pub struct StreamingResampler {
    input_rate: u32,
    output_rate: u32,
    /// `None` for a pass-through
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
    /// Leading output samples that are filter delay, not signal
    delay_left: usize,
    consumed: u64,
    emitted: u64,
}

impl std::fmt::Debug for StreamingResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResampler")
            .field("input_rate", &self.input_rate)
            .field("output_rate", &self.output_rate)
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn to_float(sample: i16) -> f32 {
    sample as f32 / FULL_SCALE
}

fn to_pcm(sample: f32) -> i16 {
    (sample * FULL_SCALE)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

fn resample_error(e: impl std::fmt::Display) -> AudioError {
    AudioError::Resample(e.to_string())
}

impl StreamingResampler {
    /// Create a converter from `input_rate` to `output_rate`.
    pub fn new(input_rate: u32, output_rate: u32) -> AudioResult<Self> {
        if input_rate == 0 {
            return Err(AudioError::InvalidSampleRate(input_rate));
        }
        if output_rate == 0 {
            return Err(AudioError::InvalidSampleRate(output_rate));
        }

        let inner = if input_rate == output_rate {
            None
        } else {
            let chunk = (input_rate as usize * CHUNK_MS / 1000).max(1);
            Some(
                FftFixedIn::<f32>::new(
                    input_rate as usize,
                    output_rate as usize,
                    chunk,
                    SUB_CHUNKS,
                    1,
                )
                .map_err(resample_error)?,
            )
        };
        let delay_left = inner.as_ref().map_or(0, |r| r.output_delay());

        Ok(Self {
            input_rate,
            output_rate,
            inner,
            pending: Vec::new(),
            delay_left,
            consumed: 0,
            emitted: 0,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Whether this converter is a pass-through.
    pub fn is_identity(&self) -> bool {
        self.inner.is_none()
    }

    /// Convert the next chunk of input.
    pub fn process(&mut self, input: &[i16]) -> AudioResult<Vec<i16>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(input.to_vec());
        };
        self.pending.extend(input.iter().copied().map(to_float));
        self.consumed += input.len() as u64;

        let mut raw = Vec::new();
        loop {
            let need = inner.input_frames_next();
            if self.pending.len() < need {
                break;
            }
            let out = inner
                .process(&[&self.pending[..need]], None)
                .map_err(resample_error)?;
            self.pending.drain(..need);
            if let Some(channel) = out.first() {
                raw.extend_from_slice(channel);
            }
        }
        Ok(self.take_output(&raw, None))
    }

    /// Release everything held back, then reset for a new stream.
    pub fn flush(&mut self) -> AudioResult<Vec<i16>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        let expected = self.consumed * self.output_rate as u64 / self.input_rate as u64;

        let mut raw = Vec::new();
        if !self.pending.is_empty() {
            let out = inner
                .process_partial(Some(&[&self.pending[..]]), None)
                .map_err(resample_error)?;
            self.pending.clear();
            if let Some(channel) = out.first() {
                raw.extend_from_slice(channel);
            }
        }
        // Zero-fed calls push the filter delay out
        let available = |raw: &Vec<f32>| {
            self.emitted + raw.len().saturating_sub(self.delay_left) as u64
        };
        let mut rounds = 0;
        while available(&raw) < expected && rounds < 16 {
            let out = inner
                .process_partial::<&[f32]>(None, None)
                .map_err(resample_error)?;
            match out.first() {
                Some(channel) if !channel.is_empty() => raw.extend_from_slice(channel),
                _ => break,
            }
            rounds += 1;
        }

        let tail = self.take_output(&raw, Some(expected));
        self.reset();
        Ok(tail)
    }

    /// Drop all buffered state without emitting it.
    pub fn reset(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
            self.delay_left = inner.output_delay();
        }
        self.pending.clear();
        self.consumed = 0;
        self.emitted = 0;
    }

    fn take_output(&mut self, raw: &[f32], limit: Option<u64>) -> Vec<i16> {
        let skip = self.delay_left.min(raw.len());
        self.delay_left -= skip;
        let mut signal = &raw[skip..];
        if let Some(limit) = limit {
            let room = limit.saturating_sub(self.emitted) as usize;
            signal = &signal[..signal.len().min(room)];
        }
        self.emitted += signal.len() as u64;
        signal.iter().copied().map(to_pcm).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(rate: u32, freq: f64, amplitude: f64, len: usize) -> Vec<i16> {
        (0..len)
            .map(|n| {
                let t = n as f64 / rate as f64;
                (amplitude * (2.0 * std::f64::consts::PI * freq * t).sin()).round() as i16
            })
            .collect()
    }

    fn rms(samples: &[i16]) -> f64 {
        let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / samples.len().max(1) as f64).sqrt()
    }

    fn convert_all(r: &mut StreamingResampler, input: &[i16], chunk: usize) -> Vec<i16> {
        let mut output = Vec::new();
        for part in input.chunks(chunk) {
            output.extend(r.process(part).unwrap());
        }
        output.extend(r.flush().unwrap());
        output
    }

    #[test]
    fn test_rejects_zero_rate() {
        assert!(StreamingResampler::new(0, 8000).is_err());
        assert!(StreamingResampler::new(8000, 0).is_err());
    }

    #[test]
    fn test_identity_passthrough() {
        let mut r = StreamingResampler::new(8000, 8000).unwrap();
        assert!(r.is_identity());
        assert_eq!(r.process(&[1, 2, 3]).unwrap(), vec![1, 2, 3]);
        assert!(r.flush().unwrap().is_empty());
    }

    #[test]
    fn test_24k_to_8k_matches_reference_tone() {
        // Reference: the same tone sampled directly at 8kHz.
        let amplitude = 10000.0;
        let input = sine(24000, 440.0, amplitude, 24000);
        let reference = sine(8000, 440.0, amplitude, 8000);

        let mut r = StreamingResampler::new(24000, 8000).unwrap();
        let output = convert_all(&mut r, &input, 480);
        assert_eq!(output.len(), reference.len());

        // Skip filter ringing at the abrupt start and end of the tone.
        let margin = 200;
        let max_err = output[margin..output.len() - margin]
            .iter()
            .zip(&reference[margin..reference.len() - margin])
            .map(|(a, b)| (*a as f64 - *b as f64).abs())
            .fold(0.0, f64::max);
        assert!(
            max_err < amplitude * 0.01,
            "max error {max_err} exceeds 1% of amplitude"
        );
    }

    #[test]
    fn test_24k_to_8k_rejects_aliasing_band() {
        // 6kHz cannot be represented at 8kHz and would alias to 2kHz.
        let input = sine(24000, 6000.0, 10000.0, 24000);
        let mut r = StreamingResampler::new(24000, 8000).unwrap();
        let output = r.process(&input).unwrap();
        let body = &output[200..output.len() - 200];
        assert!(rms(body) < rms(&input) * 0.05, "alias energy too high: {}", rms(body));
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let input = sine(24000, 1000.0, 8000.0, 4800);

        let mut whole = StreamingResampler::new(24000, 8000).unwrap();
        let expected = convert_all(&mut whole, &input, input.len());

        let mut chunked = StreamingResampler::new(24000, 8000).unwrap();
        let actual = convert_all(&mut chunked, &input, 137);

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_8k_to_24k_output_length_and_tone() {
        let amplitude = 8000.0;
        let input = sine(8000, 300.0, amplitude, 8000);
        let reference = sine(24000, 300.0, amplitude, 24000);

        let mut r = StreamingResampler::new(8000, 24000).unwrap();
        let output = convert_all(&mut r, &input, 160);
        assert_eq!(output.len(), 24000);

        let margin = 600;
        let max_err = output[margin..output.len() - margin]
            .iter()
            .zip(&reference[margin..reference.len() - margin])
            .map(|(a, b)| (*a as f64 - *b as f64).abs())
            .fold(0.0, f64::max);
        assert!(max_err < amplitude * 0.01, "max error {max_err}");
    }

    #[test]
    fn test_44k1_to_8k_length() {
        let input = vec![0i16; 44100];
        let mut r = StreamingResampler::new(44100, 8000).unwrap();
        let output = convert_all(&mut r, &input, 44100);
        assert_eq!(output.len(), 8000);
    }

    #[test]
    fn test_reset_starts_a_fresh_stream() {
        let input = sine(16000, 500.0, 6000.0, 3200);
        let mut r = StreamingResampler::new(16000, 8000).unwrap();
        let first = convert_all(&mut r, &input, 320);

        r.process(&input[..1000]).unwrap();
        r.reset();
        let second = convert_all(&mut r, &input, 320);
        assert_eq!(first, second);
    }
}
