//! Post-call persistence: stereo WAV recording and plain-text transcript.
//!
//! Objects are written under `{prefix}/{call_id}/recording.wav` and
//! `{prefix}/{call_id}/transcript.txt` in any `object_store` backend.

use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::StoreResult;

pub const RECORDING_FILE: &str = "recording.wav";
pub const TRANSCRIPT_FILE: &str = "transcript.txt";

#[async_trait]
pub trait RecordingSink: Send + Sync {
    async fn write_recording(&self, call_id: &str, wav: Vec<u8>) -> StoreResult<()>;
    async fn write_transcript(&self, call_id: &str, text: &str) -> StoreResult<()>;
}

/// Object key for a call artifact.
///
/// - No prefix: `call_id/file`
/// - With prefix: `prefix/call_id/file`
pub fn recording_object_key(prefix: Option<&str>, call_id: &str, file: &str) -> String {
    let normalized_prefix = prefix
        .map(|p| p.trim().trim_matches('/'))
        .filter(|p| !p.is_empty());

    match normalized_prefix {
        None => format!("{call_id}/{file}"),
        Some(prefix) => format!("{prefix}/{call_id}/{file}"),
    }
}

/// [`RecordingSink`] writing to an `object_store` backend.
#[derive(Clone)]
pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl ObjectStoreSink {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Option<String>) -> Self {
        Self { store, prefix }
    }

    /// Local directory, created if missing.
    pub fn local(root: &Path, prefix: Option<String>) -> StoreResult<Self> {
        std::fs::create_dir_all(root)?;
        let store = object_store::local::LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::new(Arc::new(store), prefix))
    }

    /// S3 bucket; credentials come from the standard AWS environment variables.
    pub fn s3(bucket: &str, region: Option<&str>, prefix: Option<String>) -> StoreResult<Self> {
        let mut builder =
            object_store::aws::AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        Ok(Self::new(Arc::new(builder.build()?), prefix))
    }

    pub fn memory(prefix: Option<String>) -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()), prefix)
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    pub fn key(&self, call_id: &str, file: &str) -> String {
        recording_object_key(self.prefix.as_deref(), call_id, file)
    }

    async fn put(&self, call_id: &str, file: &str, bytes: Vec<u8>) -> StoreResult<()> {
        let key = self.key(call_id, file);
        let path = ObjectPath::parse(&key).map_err(object_store::Error::from)?;
        let size = bytes.len();
        self.store.put(&path, PutPayload::from(bytes)).await?;
        info!(call_id = %call_id, key = %key, bytes = size, "Stored call artifact");
        Ok(())
    }
}

#[async_trait]
impl RecordingSink for ObjectStoreSink {
    async fn write_recording(&self, call_id: &str, wav: Vec<u8>) -> StoreResult<()> {
        self.put(call_id, RECORDING_FILE, wav).await
    }

    async fn write_transcript(&self, call_id: &str, text: &str) -> StoreResult<()> {
        self.put(call_id, TRANSCRIPT_FILE, text.as_bytes().to_vec()).await
    }
}

/// Accumulates both sides of a call as telephony-rate PCM.
///
/// Caller audio is appended as it arrives. Assistant audio is appended when it
/// is sent to the caller, after padding its track with silence up to the
/// caller track so the two stay roughly aligned.
#[derive(Debug)]
pub struct CallRecorder {
    sample_rate: u32,
    max_samples: usize,
    caller: Vec<i16>,
    assistant: Vec<i16>,
    truncated: bool,
}

impl CallRecorder {
    pub fn new(sample_rate: u32, max_seconds: u32) -> Self {
        Self {
            sample_rate,
            max_samples: sample_rate as usize * max_seconds as usize,
            caller: Vec::new(),
            assistant: Vec::new(),
            truncated: false,
        }
    }

    fn append(track: &mut Vec<i16>, samples: &[i16], max: usize, truncated: &mut bool) {
        let room = max.saturating_sub(track.len());
        if samples.len() > room {
            *truncated = true;
        }
        track.extend_from_slice(&samples[..samples.len().min(room)]);
    }

    pub fn push_caller(&mut self, samples: &[i16]) {
        Self::append(&mut self.caller, samples, self.max_samples, &mut self.truncated);
    }

    pub fn push_assistant(&mut self, samples: &[i16]) {
        let target = self.caller.len().min(self.max_samples);
        if self.assistant.len() < target {
            self.assistant.resize(target, 0);
        }
        Self::append(&mut self.assistant, samples, self.max_samples, &mut self.truncated);
    }

    pub fn is_empty(&self) -> bool {
        self.caller.is_empty() && self.assistant.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        let len = self.caller.len().max(self.assistant.len()) as u64;
        len * 1000 / self.sample_rate.max(1) as u64
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Stereo 16-bit WAV: caller on the left channel, assistant on the right.
    pub fn to_wav(&self) -> StoreResult<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let len = self.caller.len().max(self.assistant.len());
        let mut cursor = Cursor::new(Vec::with_capacity(44 + len * 4));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for i in 0..len {
                writer.write_sample(self.caller.get(i).copied().unwrap_or(0))?;
                writer.write_sample(self.assistant.get(i).copied().unwrap_or(0))?;
            }
            writer.finalize()?;
        }
        debug!(samples = len, truncated = self.truncated, "Encoded call recording");
        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key() {
        assert_eq!(recording_object_key(None, "CA1", RECORDING_FILE), "CA1/recording.wav");
        assert_eq!(
            recording_object_key(Some("calls/"), "CA1", TRANSCRIPT_FILE),
            "calls/CA1/transcript.txt"
        );
        assert_eq!(recording_object_key(Some("  "), "CA1", RECORDING_FILE), "CA1/recording.wav");
    }

    #[test]
    fn test_recorder_aligns_assistant_track() {
        let mut recorder = CallRecorder::new(8000, 60);
        recorder.push_caller(&[1; 160]);
        recorder.push_caller(&[2; 160]);
        recorder.push_assistant(&[9; 80]);

        assert_eq!(recorder.assistant.len(), 400);
        assert!(recorder.assistant[..320].iter().all(|&s| s == 0));
        assert_eq!(recorder.assistant[320], 9);
        assert_eq!(recorder.duration_ms(), 50);
    }

    #[test]
    fn test_recorder_caps_length() {
        let mut recorder = CallRecorder::new(8000, 1);
        recorder.push_caller(&vec![1; 7_900]);
        recorder.push_caller(&[1; 160]);
        assert_eq!(recorder.caller.len(), 8000);
        assert!(recorder.truncated());
    }

    #[test]
    fn test_wav_is_interleaved_stereo() {
        let mut recorder = CallRecorder::new(8000, 60);
        recorder.push_caller(&[100, 200]);
        recorder.push_assistant(&[-5]);

        let wav = recorder.to_wav().unwrap();
        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 8000);
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, vec![100, 0, 200, 0, 0, -5]);
    }

    #[tokio::test]
    async fn test_memory_sink_writes_artifacts() {
        let sink = ObjectStoreSink::memory(Some("calls".to_string()));
        sink.write_transcript("CA1", "caller: hello").await.unwrap();
        sink.write_recording("CA1", vec![1, 2, 3]).await.unwrap();

        let store = sink.store();
        let text = store
            .get(&ObjectPath::from("calls/CA1/transcript.txt"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&text[..], b"caller: hello");
        let wav = store
            .get(&ObjectPath::from("calls/CA1/recording.wav"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(wav.len(), 3);
    }

    #[tokio::test]
    async fn test_local_sink_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("recordings");
        let sink = ObjectStoreSink::local(&root, None).unwrap();
        sink.write_transcript("CA2", "assistant: bye").await.unwrap();
        let text = std::fs::read_to_string(root.join("CA2").join("transcript.txt")).unwrap();
        assert_eq!(text, "assistant: bye");
    }
}
