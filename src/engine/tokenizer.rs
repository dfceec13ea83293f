//! SentencePiece-style BPE tokenizer over the container vocabulary.
//!
//! Encoding maps spaces to `▁`, splits the text into characters and merges
//! adjacent pieces by highest vocabulary score until no merge remains.
//! Pieces the vocabulary lacks fall back to `<0xNN>` byte tokens, so any
//! input is representable when the vocabulary carries all 256 bytes.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use thiserror::Error;

use crate::models::vocab::parse_byte_token;
use crate::models::{TokenKind, Vocabulary};

/// Word-boundary marker substituted for spaces.
pub const SPACE_MARKER: char = '\u{2581}';

/// Maximum prompt size in bytes (64KB).
pub const MAX_TEXT_BYTES: usize = 65_536;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenizerError {
    #[error("Input too long: {len} bytes, limit {max}")]
    InputTooLong { len: usize, max: usize },

    #[error("Invalid token ID: {0}")]
    InvalidToken(u32),
}

#[derive(Debug, Clone, Copy)]
struct Symbol {
    start: usize,
    end: usize,
    prev: Option<usize>,
    next: Option<usize>,
    /// Literal `▁` from the input: always emitted as bytes, never merged.
    bytes_only: bool,
}

#[derive(Debug, PartialEq)]
struct Bigram {
    score: f32,
    left: usize,
    right: usize,
    len: usize,
}

impl Eq for Bigram {}

impl Ord for Bigram {
    // Highest score first, then leftmost.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.left.cmp(&self.left))
    }
}

impl PartialOrd for Bigram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Tokenizer bound to one vocabulary.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: Vocabulary,
    /// Mergeable pieces (normal and user-defined tokens) to id.
    pieces: HashMap<String, u32>,
    byte_ids: [Option<u32>; 256],
}

impl Tokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        let mut pieces = HashMap::with_capacity(vocab.tokens.len());
        let mut byte_ids = [None; 256];
        for (i, token) in vocab.tokens.iter().enumerate() {
            let id = i as u32;
            match vocab.kinds[i] {
                TokenKind::Normal | TokenKind::UserDefined => {
                    pieces.entry(token.clone()).or_insert(id);
                }
                TokenKind::Byte => {
                    if let Some(b) = parse_byte_token(token) {
                        byte_ids[b as usize].get_or_insert(id);
                    }
                }
                _ => {}
            }
        }
        Self {
            vocab,
            pieces,
            byte_ids,
        }
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn bos(&self) -> u32 {
        self.vocab.special.bos
    }

    pub fn eos(&self) -> u32 {
        self.vocab.special.eos
    }

    pub fn unk(&self) -> u32 {
        self.vocab.special.unk
    }

    pub fn is_eos(&self, id: u32) -> bool {
        id == self.vocab.special.eos
    }

    /// Whether every byte value has a fallback token.
    pub fn has_full_byte_coverage(&self) -> bool {
        self.byte_ids.iter().all(Option::is_some)
    }

    /// Encode a prompt for generation, prepending BOS when the vocabulary asks for it.
    pub fn encode_prompt(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        let mut ids = Vec::with_capacity(text.len() / 2 + 1);
        if self.vocab.add_bos {
            ids.push(self.bos());
        }
        ids.extend(self.encode(text)?);
        Ok(ids)
    }

    /// Encode text without special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        if text.len() > MAX_TEXT_BYTES {
            return Err(TokenizerError::InputTooLong {
                len: text.len(),
                max: MAX_TEXT_BYTES,
            });
        }
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let mut norm = String::with_capacity(text.len() + 8);
        let mut symbols = Vec::with_capacity(text.chars().count());
        for ch in text.chars() {
            let start = norm.len();
            let bytes_only = ch == SPACE_MARKER;
            norm.push(if ch == ' ' { SPACE_MARKER } else { ch });
            let idx = symbols.len();
            symbols.push(Symbol {
                start,
                end: norm.len(),
                prev: idx.checked_sub(1),
                next: Some(idx + 1),
                bytes_only,
            });
        }
        if let Some(last) = symbols.last_mut() {
            last.next = None;
        }

        let mut queue = BinaryHeap::new();
        for i in 1..symbols.len() {
            self.push_bigram(&norm, &symbols, i - 1, i, &mut queue);
        }

        while let Some(bigram) = queue.pop() {
            let (l, r) = (symbols[bigram.left], symbols[bigram.right]);
            // Stale: one side already merged away or grown.
            if l.start == l.end || r.start == r.end || l.next != Some(bigram.right) {
                continue;
            }
            if r.end - l.start != bigram.len {
                continue;
            }

            symbols[bigram.left].end = r.end;
            symbols[bigram.left].next = r.next;
            symbols[bigram.right].end = r.start;
            if let Some(n) = r.next {
                symbols[n].prev = Some(bigram.left);
            }

            if let Some(p) = symbols[bigram.left].prev {
                self.push_bigram(&norm, &symbols, p, bigram.left, &mut queue);
            }
            if let Some(n) = symbols[bigram.left].next {
                self.push_bigram(&norm, &symbols, bigram.left, n, &mut queue);
            }
        }

        let mut ids = Vec::with_capacity(symbols.len());
        let mut cursor = if symbols.is_empty() { None } else { Some(0) };
        while let Some(i) = cursor {
            let sym = symbols[i];
            let piece = &norm[sym.start..sym.end];
            match self.pieces.get(piece).filter(|_| !sym.bytes_only) {
                Some(&id) => ids.push(id),
                None => {
                    for b in piece.bytes() {
                        ids.push(self.byte_ids[b as usize].unwrap_or(self.unk()));
                    }
                }
            }
            cursor = sym.next;
        }
        Ok(ids)
    }

    fn push_bigram(
        &self,
        norm: &str,
        symbols: &[Symbol],
        left: usize,
        right: usize,
        queue: &mut BinaryHeap<Bigram>,
    ) {
        let (l, r) = (symbols[left], symbols[right]);
        if l.bytes_only || r.bytes_only {
            return;
        }
        let text = &norm[l.start..r.end];
        if let Some(&id) = self.pieces.get(text) {
            queue.push(Bigram {
                score: self.vocab.scores[id as usize],
                left,
                right,
                len: text.len(),
            });
        }
    }

    /// Raw bytes one token contributes to decoded text.
    pub fn token_bytes(&self, id: u32) -> Vec<u8> {
        let unk_text = || self.unk_text().as_bytes().to_vec();
        let Some(kind) = self.vocab.kind(id) else {
            return unk_text();
        };
        if id == self.unk() {
            return unk_text();
        }
        let token = &self.vocab.tokens[id as usize];
        match kind {
            TokenKind::Control => Vec::new(),
            TokenKind::Unknown => unk_text(),
            TokenKind::Byte => parse_byte_token(token).map(|b| vec![b]).unwrap_or_default(),
            _ => token.replace(SPACE_MARKER, " ").into_bytes(),
        }
    }

    fn unk_text(&self) -> &str {
        &self.vocab.tokens[self.unk() as usize]
    }

    /// Decode ids to text. Byte tokens are reassembled before UTF-8
    /// validation; invalid sequences become U+FFFD.
    pub fn decode(&self, ids: &[u32]) -> String {
        let bytes: Vec<u8> = ids.iter().flat_map(|&id| self.token_bytes(id)).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Strictly decode one id, rejecting ids outside the vocabulary.
    pub fn decode_token(&self, id: u32) -> Result<String, TokenizerError> {
        if id as usize >= self.vocab.len() {
            return Err(TokenizerError::InvalidToken(id));
        }
        Ok(String::from_utf8_lossy(&self.token_bytes(id)).into_owned())
    }
}

/// Incremental decoder for streaming that holds back incomplete UTF-8.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one token and return the text that became complete.
    pub fn push(&mut self, tokenizer: &Tokenizer, id: u32) -> String {
        self.pending.extend(tokenizer.token_bytes(id));
        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let out = s.to_string();
                self.pending.clear();
                out
            }
            Err(e) if e.error_len().is_none() => {
                // Incomplete sequence at the tail; emit the valid prefix.
                let valid = e.valid_up_to();
                let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                out
            }
            Err(_) => {
                let out = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                out
            }
        }
    }

    /// Flush whatever is left, lossily.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}
