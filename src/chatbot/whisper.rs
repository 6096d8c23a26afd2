//! Local speech-to-text using whisper-rs.
//!
//! Converts voice messages (OGG Opus from Telegram) to text.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Whisper transcription engine.
pub struct Whisper {
    ctx: Arc<WhisperContext>,
    language: String,
}

impl Whisper {
    /// Load a Whisper model from a .bin file.
    pub fn new(model_path: &Path, language: &str) -> Result<Self, String> {
        info!("Loading Whisper model from {:?}", model_path);

        if !model_path.exists() {
            return Err(format!("Model file not found: {:?}", model_path));
        }

        let ctx = WhisperContext::new_with_params(
            model_path.to_str().ok_or("Invalid model path")?,
            WhisperContextParameters::default(),
        )
        .map_err(|e| format!("Failed to load Whisper model: {e}"))?;

        info!("Whisper model loaded ({})", language);
        Ok(Self {
            ctx: Arc::new(ctx),
            language: language.to_string(),
        })
    }

    /// Transcribe audio data (OGG Opus format from Telegram).
    ///
    /// Blocking; converts to 16KHz mono PCM using ffmpeg, then runs Whisper.
    pub fn transcribe(&self, ogg_data: &[u8]) -> Result<String, String> {
        debug!("Transcribing {} bytes of audio", ogg_data.len());

        let pcm_data = convert_ogg_to_pcm(ogg_data)?;

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| format!("Failed to create Whisper state: {e}"))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some(&self.language));
        params.set_translate(false);
        params.set_no_timestamps(true);
        params.set_single_segment(false);
        params.set_print_progress(false);

        state
            .full(params, &pcm_data)
            .map_err(|e| format!("Whisper transcription failed: {e}"))?;

        let mut text = String::new();
        for segment in state.as_iter() {
            if let Ok(s) = segment.to_str() {
                text.push_str(s);
                text.push(' ');
            }
        }

        let text = text.trim().to_string();
        info!("Transcribed: \"{}\"", truncate(&text, 100));
        Ok(text)
    }
}

fn temp_input_path() -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("voxrelay_voice_{}_{}.ogg", std::process::id(), n))
}

/// Convert OGG Opus audio to 16KHz mono f32 PCM samples using ffmpeg.
fn convert_ogg_to_pcm(ogg_data: &[u8]) -> Result<Vec<f32>, String> {
    // ffmpeg needs seekable input for OGG
    let input_path = temp_input_path();

    std::fs::write(&input_path, ogg_data)
        .map_err(|e| format!("Failed to write temp input: {e}"))?;

    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(&input_path)
        .args([
            "-ar", "16000",
            "-ac", "1",
            "-f", "s16le",
            "-acodec", "pcm_s16le",
            "-y",
            "pipe:1",
        ])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output();

    let _ = std::fs::remove_file(&input_path);
    let output = output.map_err(|e| format!("Failed to run ffmpeg: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("ffmpeg failed: {}", stderr));
    }

    let samples = pcm_s16le_to_f32(&output.stdout);
    debug!("Converted to {} f32 samples", samples.len());
    Ok(samples)
}

fn pcm_s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
