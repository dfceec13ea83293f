//! Vocabulary table extracted from container metadata or a vocab file.

use std::path::{Path, PathBuf};

use super::gguf::{GgufFile, MetaValue};
use super::loader::ContainerError;

pub const KEY_TOKENS: &str = "tokenizer.ggml.tokens";
pub const KEY_SCORES: &str = "tokenizer.ggml.scores";
pub const KEY_TOKEN_TYPE: &str = "tokenizer.ggml.token_type";
pub const KEY_BOS: &str = "tokenizer.ggml.bos_token_id";
pub const KEY_EOS: &str = "tokenizer.ggml.eos_token_id";
pub const KEY_PAD: &str = "tokenizer.ggml.padding_token_id";
pub const KEY_UNK: &str = "tokenizer.ggml.unknown_token_id";
pub const KEY_ADD_BOS: &str = "tokenizer.ggml.add_bos_token";

pub const DEFAULT_BOS: u32 = 1;
pub const DEFAULT_EOS: u32 = 2;
pub const DEFAULT_PAD: u32 = 0;
pub const DEFAULT_UNK: u32 = 0;

/// Extension of a vocabulary file shipped next to a model without embedded
/// tokenizer tables.
pub const SIDECAR_EXTENSION: &str = "vocab";

/// `model.gguf` -> `model.vocab`.
pub fn sidecar_path(model_path: &Path) -> PathBuf {
    model_path.with_extension(SIDECAR_EXTENSION)
}

/// Token classes as recorded in `tokenizer.ggml.token_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl TokenKind {
    fn from_code(code: u64) -> Self {
        match code {
            2 => Self::Unknown,
            3 => Self::Control,
            4 => Self::UserDefined,
            5 => Self::Unused,
            6 => Self::Byte,
            _ => Self::Normal,
        }
    }
}

/// Special token ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: u32,
    pub eos: u32,
    pub pad: u32,
    pub unk: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            bos: DEFAULT_BOS,
            eos: DEFAULT_EOS,
            pad: DEFAULT_PAD,
            unk: DEFAULT_UNK,
        }
    }
}

/// Token strings, merge scores and token classes, indexed by id.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub tokens: Vec<String>,
    pub scores: Vec<f32>,
    pub kinds: Vec<TokenKind>,
    pub special: SpecialTokens,
    pub add_bos: bool,
}

impl Vocabulary {
    /// Build from explicit parts. Token classes are inferred from the strings
    /// and special ids.
    pub fn new(tokens: Vec<String>, scores: Vec<f32>, special: SpecialTokens) -> Result<Self, ContainerError> {
        let kinds = infer_kinds(&tokens, &special);
        let vocab = Self {
            tokens,
            scores,
            kinds,
            special,
            add_bos: true,
        };
        vocab.validate()?;
        Ok(vocab)
    }

    pub fn from_gguf(file: &GgufFile) -> Result<Self, ContainerError> {
        let tokens = string_array(file, KEY_TOKENS)?
            .ok_or_else(|| ContainerError::MissingMetadata(KEY_TOKENS.into()))?;

        let scores = match file.get(KEY_SCORES).and_then(MetaValue::as_array) {
            Some(items) => items
                .iter()
                .map(|v| {
                    v.as_f32()
                        .ok_or_else(|| ContainerError::Format(format!("{} holds a non-numeric value", KEY_SCORES)))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![0.0; tokens.len()],
        };

        let special = SpecialTokens {
            bos: special_id(file, KEY_BOS, DEFAULT_BOS)?,
            eos: special_id(file, KEY_EOS, DEFAULT_EOS)?,
            pad: special_id(file, KEY_PAD, DEFAULT_PAD)?,
            unk: special_id(file, KEY_UNK, DEFAULT_UNK)?,
        };

        let kinds = match file.get(KEY_TOKEN_TYPE).and_then(MetaValue::as_array) {
            Some(items) => items
                .iter()
                .map(|v| v.as_u64().map(TokenKind::from_code).unwrap_or(TokenKind::Normal))
                .collect(),
            None => infer_kinds(&tokens, &special),
        };

        let vocab = Self {
            tokens,
            scores,
            kinds,
            special,
            add_bos: file.get_bool(KEY_ADD_BOS).unwrap_or(true),
        };
        vocab.validate()?;
        Ok(vocab)
    }

    /// Parse a text vocabulary: one token per line, optionally followed by a
    /// tab- or space-separated score. `\n`, `\t`, `\r` and `\\` are unescaped.
    pub fn from_text(text: &str) -> Result<Self, ContainerError> {
        let mut tokens = Vec::new();
        let mut scores = Vec::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (token, score) = split_score(line);
            tokens.push(unescape(token));
            scores.push(score);
        }
        Self::new(tokens, scores, SpecialTokens::default())
    }

    pub fn from_file(path: &Path) -> Result<Self, ContainerError> {
        if !path.is_file() {
            return Err(ContainerError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_text(&text)
    }

    /// Take special ids and the BOS flag from container metadata, as for an
    /// embedded vocabulary, and reclassify tokens against them.
    pub fn with_metadata(mut self, file: &GgufFile) -> Result<Self, ContainerError> {
        self.special = SpecialTokens {
            bos: special_id(file, KEY_BOS, DEFAULT_BOS)?,
            eos: special_id(file, KEY_EOS, DEFAULT_EOS)?,
            pad: special_id(file, KEY_PAD, DEFAULT_PAD)?,
            unk: special_id(file, KEY_UNK, DEFAULT_UNK)?,
        };
        self.add_bos = file.get_bool(KEY_ADD_BOS).unwrap_or(true);
        self.kinds = infer_kinds(&self.tokens, &self.special);
        self.validate()?;
        Ok(self)
    }

    /// Render in the format read by [`Vocabulary::from_text`].
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (token, score) in self.tokens.iter().zip(&self.scores) {
            out.push_str(&escape(token));
            out.push('\t');
            out.push_str(&score.to_string());
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn kind(&self, id: u32) -> Option<TokenKind> {
        self.kinds.get(id as usize).copied()
    }

    fn validate(&self) -> Result<(), ContainerError> {
        if self.tokens.is_empty() {
            return Err(ContainerError::Format("vocabulary is empty".into()));
        }
        if self.scores.len() != self.tokens.len() || self.kinds.len() != self.tokens.len() {
            return Err(ContainerError::Format(format!(
                "vocabulary tables disagree: {} tokens, {} scores, {} types",
                self.tokens.len(),
                self.scores.len(),
                self.kinds.len()
            )));
        }
        let n = self.tokens.len() as u32;
        let s = &self.special;
        for (name, id) in [("bos", s.bos), ("eos", s.eos), ("pad", s.pad), ("unk", s.unk)] {
            if id >= n {
                return Err(ContainerError::Format(format!(
                    "{} token id {} outside vocabulary of {}",
                    name, id, n
                )));
            }
        }
        Ok(())
    }
}

fn string_array(file: &GgufFile, key: &str) -> Result<Option<Vec<String>>, ContainerError> {
    let Some(items) = file.get(key).and_then(MetaValue::as_array) else {
        return Ok(None);
    };
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| ContainerError::Format(format!("{} holds a non-string value", key)))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn special_id(file: &GgufFile, key: &str, default: u32) -> Result<u32, ContainerError> {
    match file.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| ContainerError::Format(format!("{} is not a token id", key))),
    }
}

fn infer_kinds(tokens: &[String], special: &SpecialTokens) -> Vec<TokenKind> {
    tokens
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let id = i as u32;
            if id == special.unk {
                TokenKind::Unknown
            } else if id == special.bos || id == special.eos || id == special.pad {
                TokenKind::Control
            } else if parse_byte_token(t).is_some() {
                TokenKind::Byte
            } else {
                TokenKind::Normal
            }
        })
        .collect()
}

/// Parse a `<0xNN>` byte token.
pub fn parse_byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

fn split_score(line: &str) -> (&str, f32) {
    let sep = line.rfind('\t').or_else(|| line.rfind(' '));
    if let Some(pos) = sep.filter(|&p| p > 0) {
        if let Ok(score) = line[pos + 1..].parse::<f32>() {
            return (&line[..pos], score);
        }
    }
    (line, 0.0)
}

fn escape(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    for c in token.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_vocab_parses_scores_and_escapes() {
        let v = Vocabulary::from_text("<unk>\n<s>\n</s>\nhello\t-1.5\nline\\n 2\n").unwrap();
        assert_eq!(v.len(), 5);
        assert_eq!(v.tokens[3], "hello");
        assert_eq!(v.scores[3], -1.5);
        assert_eq!(v.tokens[4], "line\n");
        assert_eq!(v.scores[4], 2.0);
        assert_eq!(v.kind(0), Some(TokenKind::Unknown));
        assert_eq!(v.kind(1), Some(TokenKind::Control));
    }

    #[test]
    fn text_form_reads_back() {
        let tokens = vec!["<unk>".into(), "<s>".into(), "</s>".into(), "tab\there".into(), "a\\b".into()];
        let v = Vocabulary::new(tokens, vec![0.0, 0.0, 0.0, 1.5, -2.25], SpecialTokens::default()).unwrap();
        let back = Vocabulary::from_text(&v.to_text()).unwrap();
        assert_eq!(back.tokens, v.tokens);
        assert_eq!(back.scores, v.scores);
    }

    #[test]
    fn sidecar_sits_next_to_model() {
        assert_eq!(sidecar_path(Path::new("/m/tiny.gguf")), PathBuf::from("/m/tiny.vocab"));
    }

    #[test]
    fn byte_tokens_are_recognised() {
        assert_eq!(parse_byte_token("<0x0A>"), Some(0x0A));
        assert_eq!(parse_byte_token("<0xff>"), Some(0xFF));
        assert_eq!(parse_byte_token("<0x1>"), None);
        assert_eq!(parse_byte_token("0x41"), None);
    }

    #[test]
    fn special_ids_must_be_in_range() {
        let special = SpecialTokens {
            eos: 10,
            ..SpecialTokens::default()
        };
        let err = Vocabulary::new(vec!["a".into(), "b".into(), "c".into()], vec![0.0; 3], special);
        assert!(matches!(err, Err(ContainerError::Format(_))));
    }
}
