//! Command-backed engines.
//!
//! Real model runtimes stay out of this process: each engine can be bound
//! to an external executable that receives 16 kHz mono WAV on stdin and
//! answers JSON (or WAV, for the separator) on stdout. One invocation per
//! call; the process exits between calls, so "loaded" state lives entirely
//! behind the command.
//!
//! | Engine | Env var | stdin | stdout |
//! |--------|---------|-------|--------|
//! | VAD | `SCRIBA_VAD_CMD` | WAV | `{"segments":[{"start":s,"end":s}]}` |
//! | Separator | `SCRIBA_SEPARATOR_LIGHT_CMD` / `SCRIBA_SEPARATOR_HEAVY_CMD` | WAV | WAV |
//! | Primary ASR | `SCRIBA_PRIMARY_ASR_CMD` | WAV | transcription JSON |
//! | Secondary ASR | `SCRIBA_SECONDARY_ASR_CMD` | WAV | `{"text","avg_logprob","avg_no_speech_prob"}` |
//! | LLM | `SCRIBA_LLM_CMD` | request JSON | `{"text","perplexity"}` / `{"text","confidence"}` |

use std::io::{Cursor, Write};
use std::process::{Command, Stdio};

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::audio::AudioBuffer;
use crate::chunk::SeparationTier;
use crate::engines::{
    secondary_confidence, AsrWord, EngineProvider, LlmEngine, PrimaryAsrEngine,
    PrimaryTranscription, ProofResult, SecondaryAsrEngine, SecondaryTranscription,
    SeparatorEngine, TranslationResult, VadEngine, VadSegment,
};
use crate::error::{Result, ScribaError};

/// A parsed command line: program + fixed arguments.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    program: String,
    args: Vec<String>,
}

impl EngineCommand {
    /// Whitespace-split command string. Quoting is deliberately not
    /// supported; wrap complex invocations in a launcher script.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace().map(str::to_owned);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var).ok().as_deref().and_then(Self::parse)
    }

    fn run(&self, engine: &'static str, stdin_bytes: &[u8], extra_args: &[&str]) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ScribaError::EngineUnavailable {
                engine,
                message: format!("spawn {}: {e}", self.program),
            })?;

        // Writer thread keeps large payloads from deadlocking against the
        // child's stdout buffer.
        let mut stdin = child.stdin.take().ok_or(ScribaError::EngineTransient {
            engine,
            message: "child stdin unavailable".into(),
        })?;
        let payload = stdin_bytes.to_vec();
        let writer = std::thread::spawn(move || {
            let _ = stdin.write_all(&payload);
        });

        let output = child
            .wait_with_output()
            .map_err(|e| ScribaError::EngineTransient {
                engine,
                message: format!("wait: {e}"),
            })?;
        let _ = writer.join();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScribaError::EngineTransient {
                engine,
                message: format!("exit {}: {}", output.status, stderr.trim()),
            });
        }
        Ok(output.stdout)
    }
}

/// Serialize a buffer as 16-bit PCM WAV in memory.
fn encode_wav(audio: &AudioBuffer) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| ScribaError::MediaTool(format!("wav encode: {e}")))?;
        for &s in &audio.samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(v)
                .map_err(|e| ScribaError::MediaTool(format!("wav encode: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| ScribaError::MediaTool(format!("wav encode: {e}")))?;
    }
    Ok(cursor.into_inner())
}

fn decode_wav(engine: &'static str, bytes: &[u8]) -> Result<AudioBuffer> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| ScribaError::EngineTransient {
            engine,
            message: format!("wav decode: {e}"),
        })?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = 1.0 / i16::MAX as f32;
            reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>(),
    }
    .map_err(|e| ScribaError::EngineTransient {
        engine,
        message: format!("wav decode: {e}"),
    })?;
    Ok(AudioBuffer::new(samples, spec.sample_rate))
}

fn parse_json<T: for<'de> Deserialize<'de>>(engine: &'static str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| ScribaError::EngineTransient {
        engine,
        message: format!("bad response JSON: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Engine implementations
// ---------------------------------------------------------------------------

pub struct CommandVad {
    cmd: EngineCommand,
}

#[derive(Deserialize)]
struct VadResponse {
    segments: Vec<VadSpan>,
}

#[derive(Deserialize)]
struct VadSpan {
    start: f64,
    end: f64,
}

impl VadEngine for CommandVad {
    fn segment(&mut self, audio: &AudioBuffer) -> Result<Vec<VadSegment>> {
        let wav = encode_wav(audio)?;
        let out = self.cmd.run("vad", &wav, &[])?;
        let resp: VadResponse = parse_json("vad", &out)?;
        let segments: Vec<VadSegment> = resp
            .segments
            .into_iter()
            .filter(|s| s.end > s.start)
            .enumerate()
            .map(|(index, s)| VadSegment {
                index,
                start_sec: s.start,
                end_sec: s.end,
            })
            .collect();
        debug!(count = segments.len(), "command VAD produced segments");
        Ok(segments)
    }
}

pub struct CommandSeparator {
    cmd: EngineCommand,
    tier: SeparationTier,
}

impl SeparatorEngine for CommandSeparator {
    fn tier(&self) -> SeparationTier {
        self.tier
    }

    fn separate(&mut self, audio: &AudioBuffer) -> Result<AudioBuffer> {
        let wav = encode_wav(audio)?;
        let out = self.cmd.run("separator", &wav, &[])?;
        let separated = decode_wav("separator", &out)?;
        if separated.sample_rate != audio.sample_rate {
            return Err(ScribaError::EngineTransient {
                engine: "separator",
                message: format!(
                    "sample rate changed: {} -> {}",
                    audio.sample_rate, separated.sample_rate
                ),
            });
        }
        // Length preservation is part of the separator contract; pad or trim
        // a small tail mismatch rather than failing the chunk.
        let mut samples = separated.samples;
        if samples.len() != audio.samples.len() {
            warn!(
                expected = audio.samples.len(),
                got = samples.len(),
                "separator changed length — adjusting"
            );
            samples.resize(audio.samples.len(), 0.0);
        }
        Ok(AudioBuffer::new(samples, audio.sample_rate))
    }
}

pub struct CommandPrimaryAsr {
    cmd: EngineCommand,
}

#[derive(Deserialize)]
struct PrimaryResponse {
    text: String,
    #[serde(default)]
    text_clean: Option<String>,
    avg_confidence: f32,
    #[serde(default)]
    words: Vec<AsrWord>,
    #[serde(default)]
    event_tag: Option<String>,
    #[serde(default)]
    language: Option<String>,
}

impl PrimaryAsrEngine for CommandPrimaryAsr {
    fn transcribe(
        &mut self,
        audio: &AudioBuffer,
        language_hint: Option<&str>,
    ) -> Result<PrimaryTranscription> {
        let wav = encode_wav(audio)?;
        let mut extra = Vec::new();
        if let Some(lang) = language_hint {
            extra.push("--language");
            extra.push(lang);
        }
        let out = self.cmd.run("primary_asr", &wav, &extra)?;
        let resp: PrimaryResponse = parse_json("primary_asr", &out)?;
        Ok(PrimaryTranscription {
            text_clean: resp.text_clean.unwrap_or_else(|| resp.text.clone()),
            text: resp.text,
            avg_confidence: resp.avg_confidence,
            words: resp.words,
            event_tag: resp.event_tag,
            language: resp.language,
        })
    }
}

pub struct CommandSecondaryAsr {
    cmd: EngineCommand,
}

#[derive(Deserialize)]
struct SecondaryResponse {
    text: String,
    #[serde(default = "default_logprob")]
    avg_logprob: f32,
    #[serde(default)]
    avg_no_speech_prob: f32,
}

fn default_logprob() -> f32 {
    -0.2
}

impl SecondaryAsrEngine for CommandSecondaryAsr {
    fn transcribe_text_only(
        &mut self,
        audio: &AudioBuffer,
        context_prompt: Option<&str>,
        language_hint: Option<&str>,
    ) -> Result<SecondaryTranscription> {
        let wav = encode_wav(audio)?;
        let mut extra = Vec::new();
        if let Some(prompt) = context_prompt {
            extra.push("--prompt");
            extra.push(prompt);
        }
        if let Some(lang) = language_hint {
            extra.push("--language");
            extra.push(lang);
        }
        let out = self.cmd.run("secondary_asr", &wav, &extra)?;
        let resp: SecondaryResponse = parse_json("secondary_asr", &out)?;
        Ok(SecondaryTranscription {
            text: resp.text,
            avg_confidence: secondary_confidence(resp.avg_logprob, resp.avg_no_speech_prob),
        })
    }
}

pub struct CommandLlm {
    cmd: EngineCommand,
}

#[derive(Deserialize)]
struct ProofResponse {
    text: String,
    perplexity: f64,
}

#[derive(Deserialize)]
struct TranslateResponse {
    text: String,
    confidence: f32,
}

impl LlmEngine for CommandLlm {
    fn proof(&mut self, text: &str, context: &[String]) -> Result<ProofResult> {
        let req = json!({ "op": "proof", "text": text, "context": context });
        let out = self.cmd.run("llm", req.to_string().as_bytes(), &[])?;
        let resp: ProofResponse = parse_json("llm", &out)?;
        Ok(ProofResult {
            text: resp.text,
            perplexity: resp.perplexity,
        })
    }

    fn translate(
        &mut self,
        text: &str,
        target_lang: &str,
        context: &[String],
    ) -> Result<TranslationResult> {
        let req = json!({
            "op": "translate",
            "text": text,
            "target_lang": target_lang,
            "context": context,
        });
        let out = self.cmd.run("llm", req.to_string().as_bytes(), &[])?;
        let resp: TranslateResponse = parse_json("llm", &out)?;
        Ok(TranslationResult {
            text: resp.text,
            confidence: resp.confidence,
        })
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Commands for every engine slot, resolved from the environment once at
/// startup. Missing entries fall back to the stub engines so a bare
/// checkout still runs end-to-end.
#[derive(Debug, Clone, Default)]
pub struct CommandSet {
    pub vad: Option<EngineCommand>,
    pub separator_light: Option<EngineCommand>,
    pub separator_heavy: Option<EngineCommand>,
    pub primary_asr: Option<EngineCommand>,
    pub secondary_asr: Option<EngineCommand>,
    pub llm: Option<EngineCommand>,
}

impl CommandSet {
    pub fn from_env() -> Self {
        Self {
            vad: EngineCommand::from_env("SCRIBA_VAD_CMD"),
            separator_light: EngineCommand::from_env("SCRIBA_SEPARATOR_LIGHT_CMD"),
            separator_heavy: EngineCommand::from_env("SCRIBA_SEPARATOR_HEAVY_CMD"),
            primary_asr: EngineCommand::from_env("SCRIBA_PRIMARY_ASR_CMD"),
            secondary_asr: EngineCommand::from_env("SCRIBA_SECONDARY_ASR_CMD"),
            llm: EngineCommand::from_env("SCRIBA_LLM_CMD"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vad.is_none()
            && self.separator_light.is_none()
            && self.separator_heavy.is_none()
            && self.primary_asr.is_none()
            && self.secondary_asr.is_none()
            && self.llm.is_none()
    }
}

/// Provider that prefers configured commands and falls back to stubs per
/// engine.
pub struct CommandEngineProvider {
    commands: CommandSet,
    fallback: super::stub::StubEngineProvider,
}

impl CommandEngineProvider {
    pub fn new(commands: CommandSet) -> Self {
        Self {
            commands,
            fallback: super::stub::StubEngineProvider,
        }
    }
}

impl EngineProvider for CommandEngineProvider {
    fn load_vad(&self) -> Result<Box<dyn VadEngine>> {
        match &self.commands.vad {
            Some(cmd) => Ok(Box::new(CommandVad { cmd: cmd.clone() })),
            None => self.fallback.load_vad(),
        }
    }

    fn load_separator(&self, tier: SeparationTier) -> Result<Box<dyn SeparatorEngine>> {
        let cmd = match tier {
            SeparationTier::Light => &self.commands.separator_light,
            SeparationTier::Heavy => &self.commands.separator_heavy,
        };
        match cmd {
            Some(cmd) => Ok(Box::new(CommandSeparator {
                cmd: cmd.clone(),
                tier,
            })),
            None => self.fallback.load_separator(tier),
        }
    }

    fn load_primary_asr(&self) -> Result<Box<dyn PrimaryAsrEngine>> {
        match &self.commands.primary_asr {
            Some(cmd) => Ok(Box::new(CommandPrimaryAsr { cmd: cmd.clone() })),
            None => self.fallback.load_primary_asr(),
        }
    }

    fn load_secondary_asr(&self) -> Result<Box<dyn SecondaryAsrEngine>> {
        match &self.commands.secondary_asr {
            Some(cmd) => Ok(Box::new(CommandSecondaryAsr { cmd: cmd.clone() })),
            None => self.fallback.load_secondary_asr(),
        }
    }

    fn load_llm(&self) -> Result<Box<dyn LlmEngine>> {
        match &self.commands.llm {
            Some(cmd) => Ok(Box::new(CommandLlm { cmd: cmd.clone() })),
            None => self.fallback.load_llm(),
        }
    }
}
