//! Placeholder session: deterministic stand-ins for a llama.cpp context.
//!
//! Tokens are UTF-8 bytes, completions replay a canned sentence piece by
//! piece and embeddings are byte histograms. Everything the host can observe
//! (streaming, stop, persistence, adapters, multimodal and vocoder state)
//! behaves like a real context would.

use std::fs;
use std::path::Path;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;

use capllama_abi::ffi::{ERR_FAIL, ERR_INVALID};
use capllama_abi::{
    AudioCompletion, ChatTemplates, CompletionParams, CompletionResult, CompletionTimings,
    ContextParams, EmbeddingParams, FormatChatParams, FormattedChat, FormattedChatKind,
    LoraAdapter, MinjaCaps, MinjaTemplates, ModelDescriptor, MultimodalSupport, RerankParams,
    RerankResult, SessionInfo, SessionLoadResult, TokenData, TokenProb, TokenProbItem,
    TokenizeResult,
};

use crate::log;

pub const SAMPLE_COMPLETION: &str = "Sample completion text";
pub const SAMPLE_MODEL_DESC: &str = "Sample model";
pub const EMBD_DIM: usize = 16;

const MEDIA_MARKER: &str = "<__media__>";
const DEFAULT_VOCODER_BATCH: i32 = 512;
const SAMPLES_PER_AUDIO_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub code: i32,
    pub message: String,
}

impl Failure {
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            code: ERR_FAIL,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: ERR_INVALID,
            message: message.into(),
        }
    }
}

pub type Outcome<T> = Result<T, Failure>;

struct MultimodalState {
    path: String,
    use_gpu: bool,
}

struct VocoderState {
    path: String,
    n_batch: i32,
}

pub struct Session {
    params: ContextParams,
    model: ModelDescriptor,
    n_threads: i32,
    /// Prompt and generated tokens of the last evaluation.
    history: Vec<i32>,
    lora: Vec<LoraAdapter>,
    multimodal: Option<MultimodalState>,
    vocoder: Option<VocoderState>,
}

#[derive(Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Value,
}

impl Session {
    pub fn create(params: ContextParams) -> Outcome<(Self, SessionInfo)> {
        if params.model.trim().is_empty() {
            return Err(Failure::invalid("model path is required"));
        }
        for adapter in params.lora_adapters() {
            if adapter.path.is_empty() {
                return Err(Failure::invalid("lora adapter path is empty"));
            }
        }

        let size = fs::metadata(&params.model).map(|m| m.len()).unwrap_or(0);
        let model = ModelDescriptor {
            path: params.model.clone(),
            desc: SAMPLE_MODEL_DESC.to_string(),
            size,
            n_embd: EMBD_DIM as u32,
            n_params: 0,
            chat_templates: ChatTemplates {
                llama_chat: true,
                minja: MinjaTemplates {
                    default: true,
                    default_caps: MinjaCaps::all(),
                    tool_use: true,
                    tool_use_caps: MinjaCaps::all(),
                },
            },
            metadata: Default::default(),
            is_chat_template_supported: true,
        };

        let n_threads = normalize_threads(params.n_threads.unwrap_or(0));
        log::emit(
            "info",
            &format!(
                "placeholder context for {} (n_ctx={}, n_threads={n_threads})",
                params.model,
                params.n_ctx.unwrap_or(512)
            ),
        );

        let info = SessionInfo {
            gpu: false,
            reason_no_gpu: "GPU offload is not available in the placeholder delegate".to_string(),
            model: model.clone(),
            android_lib: None,
        };
        let lora = params.lora_adapters();
        Ok((
            Self {
                params,
                model,
                n_threads,
                history: Vec::new(),
                lora,
                multimodal: None,
                vocoder: None,
            },
            info,
        ))
    }

    pub fn formatted_chat(
        &self,
        messages_json: &str,
        chat_template: Option<&str>,
        params: &FormatChatParams,
    ) -> Outcome<FormattedChat> {
        let messages: Vec<ChatMessage> = serde_json::from_str(messages_json)
            .map_err(|e| Failure::invalid(format!("messages must be an array of {{role, content}}: {e}")))?;

        let template = chat_template
            .filter(|t| !t.is_empty())
            .or(self.params.chat_template.as_deref());
        let chatml = template.is_some_and(|t| t == "chatml" || t.contains("<|im_start|>"));

        let mut media_paths = Vec::new();
        let mut prompt = String::new();
        for msg in &messages {
            let content = message_text(&msg.content, &mut media_paths);
            if chatml {
                prompt.push_str(&format!("<|im_start|>{}\n{content}<|im_end|>\n", msg.role));
            } else {
                prompt.push_str(&format!("{}: {content}\n", capitalize(&msg.role)));
            }
        }
        if params.add_generation_prompt.unwrap_or(true) {
            prompt.push_str(if chatml { "<|im_start|>assistant\n" } else { "Assistant:" });
        }

        let mut out = FormattedChat::llama_chat(prompt);
        out.has_media = !media_paths.is_empty();
        out.media_paths = media_paths;
        if params.jinja.unwrap_or(false) {
            out.kind = FormattedChatKind::Jinja;
            out.chat_format = Some(0);
            out.grammar_lazy = Some(false);
            out.thinking_forced_open = Some(false);
            out.preserved_tokens = Some(Vec::new());
            out.additional_stops = Some(Vec::new());
        }
        Ok(out)
    }

    /// `on_token` returns `false` to interrupt.
    pub fn completion(
        &mut self,
        params: &CompletionParams,
        on_token: &mut dyn FnMut(&TokenData) -> bool,
    ) -> Outcome<CompletionResult> {
        if !params.media_paths.is_empty() && self.multimodal.is_none() {
            return Err(Failure::fail("Multimodal is not enabled"));
        }
        let started = Instant::now();
        let prompt_tokens = tokenize_text(&params.prompt);
        let prompt_ms = started.elapsed().as_secs_f64() * 1000.0;

        let limit = params.n_predict.filter(|n| *n >= 0).map(|n| n as usize);
        let n_probs = params.n_probs.unwrap_or(0).max(0) as usize;

        let mut result = CompletionResult::default();
        let mut probs = Vec::new();
        let mut finished = true;
        for (i, piece) in completion_pieces().enumerate() {
            if limit.is_some_and(|l| i >= l) {
                result.stopped_limit = 1;
                finished = false;
                break;
            }

            let candidate = format!("{}{piece}", result.text);
            if let Some(word) = params.stop.iter().find(|w| !w.is_empty() && candidate.contains(w.as_str())) {
                let cut = candidate.find(word.as_str()).unwrap_or(candidate.len());
                result.text = candidate[..cut].to_string();
                result.stopped_word = word.clone();
                result.stopping_word = word.clone();
                finished = false;
                break;
            }

            let piece_probs = (n_probs > 0).then(|| {
                vec![TokenProb {
                    content: piece.to_string(),
                    probs: vec![TokenProbItem {
                        tok_str: piece.to_string(),
                        prob: 1.0,
                    }],
                }]
            });
            let data = TokenData {
                token: piece.to_string(),
                completion_probabilities: piece_probs.clone(),
                accumulated_text: params.emit_partial_completion.then(|| candidate.clone()),
                ..Default::default()
            };
            if !on_token(&data) {
                result.interrupted = true;
                finished = false;
                break;
            }
            result.text = candidate;
            result.tokens_predicted += 1;
            if let Some(p) = piece_probs {
                probs.extend(p);
            }
        }
        result.stopped_eos = finished;

        let predicted_ms = started.elapsed().as_secs_f64() * 1000.0 - prompt_ms;
        result.content = result.text.clone();
        result.tokens_evaluated = prompt_tokens.len() as i32;
        result.timings = CompletionTimings::from_counts(
            result.tokens_evaluated,
            prompt_ms,
            result.tokens_predicted,
            predicted_ms.max(0.0),
        );
        if n_probs > 0 {
            result.completion_probabilities = Some(probs);
        }
        if self.vocoder.is_some() && !params.guide_tokens.is_empty() {
            result.audio_tokens = Some(params.guide_tokens.clone());
        }

        self.history = prompt_tokens;
        self.history.extend(tokenize_text(&result.text));
        Ok(result)
    }

    pub fn load_session(&mut self, path: &str) -> Outcome<SessionLoadResult> {
        let bytes = fs::read(path).map_err(|e| Failure::fail(format!("Failed to load session {path}: {e}")))?;
        self.history = bytes.iter().copied().map(i32::from).collect();
        Ok(SessionLoadResult {
            tokens_loaded: self.history.len() as i32,
            prompt: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    /// `size <= 0` saves every token.
    pub fn save_session(&self, path: &str, size: i32) -> Outcome<i32> {
        let n = if size > 0 {
            (size as usize).min(self.history.len())
        } else {
            self.history.len()
        };
        let bytes = detokenize_bytes(&self.history[..n]);
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                return Err(Failure::fail(format!("Failed to save session: {} does not exist", parent.display())));
            }
        }
        fs::write(path, bytes).map_err(|e| Failure::fail(format!("Failed to save session {path}: {e}")))?;
        Ok(n as i32)
    }

    pub fn tokenize(&self, text: &str, media_paths: &[String]) -> Outcome<TokenizeResult> {
        if !media_paths.is_empty() && self.multimodal.is_none() {
            return Err(Failure::fail("Multimodal is not enabled"));
        }
        let mut out = TokenizeResult {
            tokens: tokenize_text(text),
            ..Default::default()
        };
        if !media_paths.is_empty() {
            out.has_images = true;
            out.chunk_pos.push(0);
            for path in media_paths {
                let pos = out.tokens.len() as i32;
                out.chunk_pos.push(pos);
                out.chunk_pos_images.push(pos);
                out.bitmap_hashes.push(fnv1a(path.as_bytes()));
            }
        }
        Ok(out)
    }

    pub fn detokenize(&self, tokens: &[i32]) -> String {
        String::from_utf8_lossy(&detokenize_bytes(tokens)).into_owned()
    }

    pub fn embedding(&self, text: &str, params: &EmbeddingParams) -> Outcome<Vec<f32>> {
        if !self.params.embedding.unwrap_or(false) {
            return Err(Failure::fail("Embedding is not enabled"));
        }
        let mut v = vec![0f32; EMBD_DIM];
        for b in text.bytes() {
            v[b as usize % EMBD_DIM] += 1.0;
        }
        let norm = params.embd_normalize.or(self.params.embd_normalize).unwrap_or(2);
        normalize(&mut v, norm);
        Ok(v)
    }

    /// Results are ordered by descending score.
    pub fn rerank(&self, query: &str, documents: &[String], params: &RerankParams) -> Vec<RerankResult> {
        let query_words: Vec<String> = words(query);
        let mut out: Vec<RerankResult> = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| {
                let doc_words = words(doc);
                let shared = doc_words.iter().filter(|w| query_words.contains(w)).count();
                let mut score = shared as f32 / doc_words.len().max(1) as f32;
                if params.normalize == Some(1) {
                    score = 1.0 / (1.0 + (-score).exp());
                }
                RerankResult {
                    score,
                    index,
                    document: None,
                }
            })
            .collect();
        out.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
        out
    }

    /// `[desc, size, n_params, pp_avg, pp_std, tg_avg, tg_std]`
    pub fn bench(&self, pp: i32, tg: i32, pl: i32, nr: i32) -> String {
        log::emit(
            "info",
            &format!("bench pp={pp} tg={tg} pl={pl} nr={nr} n_threads={}", self.n_threads),
        );
        serde_json::json!([self.model.desc, self.model.size, self.model.n_params, 0.0, 0.0, 0.0, 0.0])
            .to_string()
    }

    pub fn apply_lora(&mut self, adapters: Vec<LoraAdapter>) -> Outcome<()> {
        if adapters.iter().any(|a| a.path.is_empty()) {
            return Err(Failure::invalid("lora adapter path is empty"));
        }
        self.lora = adapters;
        Ok(())
    }

    pub fn remove_lora(&mut self) {
        self.lora.clear();
    }

    pub fn loaded_lora(&self) -> &[LoraAdapter] {
        &self.lora
    }

    pub fn init_multimodal(&mut self, path: &str, use_gpu: bool) -> Outcome<bool> {
        if path.is_empty() {
            return Err(Failure::invalid("multimodal projector path is required"));
        }
        log::emit("info", &format!("multimodal projector {path} (use_gpu={use_gpu})"));
        self.multimodal = Some(MultimodalState {
            path: path.to_string(),
            use_gpu,
        });
        Ok(true)
    }

    pub fn multimodal_support(&self) -> MultimodalSupport {
        let Some(mm) = &self.multimodal else {
            return MultimodalSupport::default();
        };
        log::emit("debug", &format!("projector {} (use_gpu={}) supports vision, audio", mm.path, mm.use_gpu));
        MultimodalSupport {
            vision: true,
            audio: true,
        }
    }

    pub fn release_multimodal(&mut self) {
        self.multimodal = None;
    }

    pub fn init_vocoder(&mut self, path: &str, n_batch: i32) -> Outcome<bool> {
        if path.is_empty() {
            return Err(Failure::invalid("vocoder model path is required"));
        }
        let n_batch = if n_batch > 0 { n_batch } else { DEFAULT_VOCODER_BATCH };
        self.vocoder = Some(VocoderState {
            path: path.to_string(),
            n_batch,
        });
        Ok(true)
    }

    pub fn formatted_audio_completion(&self, speaker: Option<&Value>, text: &str) -> Outcome<AudioCompletion> {
        self.require_vocoder()?;
        let speaker_text = speaker
            .and_then(|s| s.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let joined = tts_words(&format!("{speaker_text} {text}")).join("<|text_sep|>");
        Ok(AudioCompletion {
            prompt: format!("<|im_start|>\n<|text_start|>{joined}<|text_end|>\n<|audio_start|>\n"),
            grammar: None,
        })
    }

    pub fn audio_guide_tokens(&self, text: &str) -> Outcome<Vec<i32>> {
        self.require_vocoder()?;
        Ok(tts_words(text)
            .iter()
            .filter_map(|w| w.bytes().next())
            .map(i32::from)
            .collect())
    }

    pub fn decode_audio_tokens(&self, tokens: &[i32]) -> Outcome<Vec<f32>> {
        let vocoder = self.require_vocoder()?;
        let batches = tokens.len().div_ceil(vocoder.n_batch.max(1) as usize);
        log::emit(
            "debug",
            &format!("vocoder {}: {} tokens in {batches} batch(es)", vocoder.path, tokens.len()),
        );
        let mut out = Vec::with_capacity(tokens.len() * SAMPLES_PER_AUDIO_TOKEN);
        for t in tokens {
            let sample = (t.rem_euclid(200) as f32 / 100.0) - 1.0;
            out.extend(std::iter::repeat(sample).take(SAMPLES_PER_AUDIO_TOKEN));
        }
        Ok(out)
    }

    pub fn release_vocoder(&mut self) {
        self.vocoder = None;
    }

    fn require_vocoder(&self) -> Outcome<&VocoderState> {
        self.vocoder.as_ref().ok_or_else(|| Failure::fail("Vocoder is not enabled"))
    }
}

fn normalize_threads(requested: i32) -> i32 {
    if requested > 0 {
        return requested;
    }
    let physical = num_cpus::get_physical();
    let cores = if physical > 0 { physical } else { num_cpus::get() };
    (cores as i32).max(1)
}

fn completion_pieces() -> impl Iterator<Item = &'static str> {
    let mut start = 0;
    let bytes = SAMPLE_COMPLETION.as_bytes();
    std::iter::from_fn(move || {
        if start >= bytes.len() {
            return None;
        }
        let rest = &SAMPLE_COMPLETION[start + 1..];
        let end = rest.find(' ').map(|i| start + 1 + i).unwrap_or(bytes.len());
        let piece = &SAMPLE_COMPLETION[start..end];
        start = end;
        Some(piece)
    })
}

fn tokenize_text(text: &str) -> Vec<i32> {
    text.bytes().map(i32::from).collect()
}

fn detokenize_bytes(tokens: &[i32]) -> Vec<u8> {
    tokens.iter().filter_map(|t| u8::try_from(*t).ok()).collect()
}

fn message_text(content: &Value, media_paths: &mut Vec<String>) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => {
            let mut text = String::new();
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => text.push_str(part.get("text").and_then(Value::as_str).unwrap_or_default()),
                    Some("image_url") | Some("input_audio") => {
                        let url = part
                            .get("image_url")
                            .or_else(|| part.get("input_audio"))
                            .and_then(|v| v.get("url"))
                            .and_then(Value::as_str);
                        if let Some(url) = url {
                            media_paths.push(url.to_string());
                            text.push_str(MEDIA_MARKER);
                        }
                    }
                    _ => {}
                }
            }
            text
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn capitalize(role: &str) -> String {
    let mut chars = role.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn tts_words(text: &str) -> Vec<String> {
    words(text)
}

/// -1 none, 0 max-abs (int16 range), 2 euclidean, p > 2 p-norm.
fn normalize(v: &mut [f32], norm: i32) {
    let divisor = match norm {
        -1 => return,
        0 => v.iter().fold(0f32, |m, x| m.max(x.abs())) / 32760.0,
        2 => v.iter().map(|x| x * x).sum::<f32>().sqrt(),
        p => v.iter().map(|x| x.abs().powi(p)).sum::<f32>().powf(1.0 / p as f32),
    };
    if divisor > 0.0 {
        for x in v.iter_mut() {
            *x /= divisor;
        }
    }
}

/// JS numbers are exact only up to 2^53 - 1.
const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// FNV-1a folded into the JS-safe integer range.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash ^ (hash >> 53)) & MAX_SAFE_INTEGER
}
