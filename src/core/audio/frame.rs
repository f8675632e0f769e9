//! Fixed-duration audio frames.

use std::fmt;

/// Duration of one pipeline frame.
pub const FRAME_DURATION_MS: u32 = 20;

/// Number of samples in one frame at the given rate.
#[inline]
pub fn samples_per_frame(sample_rate: u32) -> usize {
    (sample_rate * FRAME_DURATION_MS / 1000) as usize
}

/// Which way a frame is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameDirection {
    /// Caller → AI
    Inbound,
    /// AI → caller
    Outbound,
}

impl fmt::Display for FrameDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameDirection::Inbound => write!(f, "inbound"),
            FrameDirection::Outbound => write!(f, "outbound"),
        }
    }
}

/// A 20ms chunk of PCM16 audio.
///
/// The final frame of a stream may be shorter than 20ms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub seq: u64,
    pub direction: FrameDirection,
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    /// Duration covered by this frame in milliseconds.
    pub fn duration_ms(&self) -> u32 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000 / self.sample_rate as u64) as u32
    }
}

/// Re-chunks an arbitrary-length sample stream into 20ms frames.
///
/// Telephony carriers mostly send 20ms payloads but are not required to,
/// and provider audio deltas arrive in whatever size the model emits.
#[derive(Debug)]
pub struct FrameAssembler {
    direction: FrameDirection,
    sample_rate: u32,
    frame_len: usize,
    pending: Vec<i16>,
    next_seq: u64,
}

impl FrameAssembler {
    pub fn new(direction: FrameDirection, sample_rate: u32) -> Self {
        let frame_len = samples_per_frame(sample_rate).max(1);
        Self {
            direction,
            sample_rate,
            frame_len,
            pending: Vec::with_capacity(frame_len * 2),
            next_seq: 0,
        }
    }

    /// Append samples and return every complete frame now available.
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.frame_len;
        let mut frames = Vec::with_capacity(complete);
        for chunk in self.pending.chunks_exact(self.frame_len) {
            frames.push(AudioFrame {
                seq: self.next_seq,
                direction: self.direction,
                sample_rate: self.sample_rate,
                samples: chunk.to_vec(),
            });
            self.next_seq += 1;
        }
        self.pending.drain(..complete * self.frame_len);
        frames
    }

    /// Emit whatever is buffered as a short final frame.
    pub fn finish(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let frame = AudioFrame {
            seq: self.next_seq,
            direction: self.direction,
            sample_rate: self.sample_rate,
            samples: std::mem::take(&mut self.pending),
        };
        self.next_seq += 1;
        Some(frame)
    }

    /// Discard buffered samples without emitting them.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_per_frame() {
        assert_eq!(samples_per_frame(8000), 160);
        assert_eq!(samples_per_frame(24000), 480);
        assert_eq!(samples_per_frame(44100), 882);
    }

    #[test]
    fn test_assembler_rechunks_uneven_input() {
        let mut assembler = FrameAssembler::new(FrameDirection::Inbound, 8000);

        assert!(assembler.push(&[1; 100]).is_empty());
        let frames = assembler.push(&[2; 300]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples.len(), 160);
        assert_eq!(frames[0].seq, 0);
        assert_eq!(frames[1].seq, 1);
        assert_eq!(&frames[0].samples[98..102], &[1, 1, 2, 2]);
        assert_eq!(assembler.pending_len(), 80);

        let tail = assembler.finish().unwrap();
        assert_eq!(tail.samples.len(), 80);
        assert_eq!(tail.seq, 2);
        assert_eq!(tail.duration_ms(), 10);
        assert!(assembler.finish().is_none());
    }

    #[test]
    fn test_assembler_clear() {
        let mut assembler = FrameAssembler::new(FrameDirection::Outbound, 8000);
        assembler.push(&[0; 50]);
        assembler.clear();
        assert_eq!(assembler.pending_len(), 0);
        assert!(assembler.finish().is_none());
    }
}
