//! SentencePiece-style tokenizer driven by the vocabulary stored in a GGUF file.

use super::gguf::GgufMetadata;
use crate::core::TokenId;
use std::collections::HashMap;

const SPACE: char = '▁';

/// GGUF `tokenizer.ggml.token_type` values this tokenizer cares about.
const TOKEN_TYPE_CONTROL: u64 = 3;
const TOKEN_TYPE_USER_DEFINED: u64 = 4;

/// Longest piece, in chars, that greedy matching will try at one position.
const MAX_MATCH_CHARS: usize = 64;

#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub tokens: Vec<String>,
    /// Control or user-defined pieces that `parse_special` may match literally.
    pub special: Vec<TokenId>,
    pub bos_token: TokenId,
    pub unk_token: Option<TokenId>,
}

impl Vocabulary {
    /// Reads the `tokenizer.ggml.*` keys. Returns `None` when the file has no tokens.
    pub fn from_metadata(metadata: &GgufMetadata) -> Option<Self> {
        let tokens = metadata.strings("tokenizer.ggml.tokens");
        if tokens.is_empty() {
            return None;
        }

        let id = |key: &str| {
            metadata
                .uint(key)
                .and_then(|v| i32::try_from(v).ok())
                .map(TokenId)
        };

        let special = match metadata.get("tokenizer.ggml.token_type") {
            Some(super::gguf::MetadataValue::Array(types)) => types
                .iter()
                .enumerate()
                .filter(|(_, t)| {
                    matches!(t.as_u64(), Some(TOKEN_TYPE_CONTROL | TOKEN_TYPE_USER_DEFINED))
                })
                .map(|(i, _)| TokenId(i as i32))
                .collect(),
            _ => tokens
                .iter()
                .enumerate()
                .filter(|(_, t)| looks_special(t))
                .map(|(i, _)| TokenId(i as i32))
                .collect(),
        };

        Some(Self {
            special,
            bos_token: id("tokenizer.ggml.bos_token_id").unwrap_or(TokenId(1)),
            unk_token: id("tokenizer.ggml.unknown_token_id")
                .or_else(|| tokens.iter().position(|t| t == "<unk>").map(|i| TokenId(i as i32))),
            tokens,
        })
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }
}

/// `<s>`, `</s>`, `<|im_start|>` and the like, but not byte pieces such as `<0x0A>`.
fn looks_special(piece: &str) -> bool {
    piece.len() > 2
        && piece.starts_with('<')
        && piece.ends_with('>')
        && !piece.starts_with("<0x")
}

pub struct SpmTokenizer {
    vocab: Vocabulary,
    encoder: HashMap<String, TokenId>,
    /// Special pieces, longest first.
    special: Vec<(String, TokenId)>,
    max_piece_chars: usize,
}

impl SpmTokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        let mut encoder = HashMap::with_capacity(vocab.tokens.len());
        let mut max_piece_chars = 1;
        for (i, token) in vocab.tokens.iter().enumerate() {
            let id = TokenId(i as i32);
            if vocab.special.contains(&id) {
                continue;
            }
            encoder.entry(token.clone()).or_insert(id);
            max_piece_chars = max_piece_chars.max(token.chars().count().min(MAX_MATCH_CHARS));
        }

        let mut special: Vec<(String, TokenId)> = vocab
            .special
            .iter()
            .filter_map(|id| {
                vocab
                    .tokens
                    .get(id.0 as usize)
                    .filter(|t| !t.is_empty())
                    .map(|t| (t.clone(), *id))
            })
            .collect();
        special.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            vocab,
            encoder,
            special,
            max_piece_chars,
        }
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.size()
    }

    pub fn encode(&self, text: &str, add_bos: bool, parse_special: bool) -> Vec<TokenId> {
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(self.vocab.bos_token);
        }

        let mut first_fragment = true;
        for fragment in self.split_special(text, parse_special) {
            match fragment {
                Fragment::Special(id) => tokens.push(id),
                Fragment::Text(s) => {
                    let mut normalized = String::with_capacity(s.len() + SPACE.len_utf8());
                    if first_fragment {
                        normalized.push(SPACE);
                    }
                    normalized.extend(s.chars().map(|c| if c == ' ' { SPACE } else { c }));
                    self.encode_pieces(&normalized, &mut tokens);
                }
            }
            first_fragment = false;
        }

        tokens
    }

    /// Writes into `out` and returns the count, or `-needed` if `out` is too small.
    pub fn encode_into(
        &self,
        text: &str,
        out: &mut [TokenId],
        add_bos: bool,
        parse_special: bool,
    ) -> i32 {
        let tokens = self.encode(text, add_bos, parse_special);
        let needed = i32::try_from(tokens.len()).unwrap_or(i32::MAX);
        if tokens.len() > out.len() {
            return -needed;
        }
        out[..tokens.len()].copy_from_slice(&tokens);
        needed
    }

    fn split_special<'t>(&self, text: &'t str, parse_special: bool) -> Vec<Fragment<'t>> {
        if !parse_special || self.special.is_empty() {
            return if text.is_empty() {
                Vec::new()
            } else {
                vec![Fragment::Text(text)]
            };
        }

        let mut fragments = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < text.len() {
            let rest = &text[i..];
            if let Some((piece, id)) = self.special.iter().find(|(p, _)| rest.starts_with(p.as_str())) {
                if start < i {
                    fragments.push(Fragment::Text(&text[start..i]));
                }
                fragments.push(Fragment::Special(*id));
                i += piece.len();
                start = i;
            } else {
                i += rest.chars().next().map_or(1, char::len_utf8);
            }
        }
        if start < text.len() {
            fragments.push(Fragment::Text(&text[start..]));
        }
        fragments
    }

    /// Greedy longest match, falling back to `<0xXX>` byte pieces and then `<unk>`.
    ///
    /// Candidates are slices of `text`; pieces longer than `MAX_MATCH_CHARS`
    /// are never matched.
    fn encode_pieces(&self, text: &str, tokens: &mut Vec<TokenId>) {
        // Byte offset of every char boundary, including the end.
        let bounds: Vec<usize> = text
            .char_indices()
            .map(|(at, _)| at)
            .chain(std::iter::once(text.len()))
            .collect();
        let n_chars = bounds.len() - 1;

        let mut i = 0;
        while i < n_chars {
            let longest = self.max_piece_chars.min(n_chars - i);
            let found = (1..=longest).rev().find_map(|len| {
                self.encoder
                    .get(&text[bounds[i]..bounds[i + len]])
                    .map(|id| (*id, len))
            });

            match found {
                Some((id, len)) => {
                    tokens.push(id);
                    i += len;
                }
                None => {
                    self.byte_fallback(&text[bounds[i]..bounds[i + 1]], tokens);
                    i += 1;
                }
            }
        }
    }

    fn byte_fallback(&self, c: &str, tokens: &mut Vec<TokenId>) {
        let pieces: Option<Vec<TokenId>> = c
            .bytes()
            .map(|b| self.encoder.get(&format!("<0x{:02X}>", b)).copied())
            .collect();

        match (pieces, self.vocab.unk_token) {
            (Some(ids), _) => tokens.extend(ids),
            (None, Some(unk)) => tokens.push(unk),
            (None, None) => tracing::trace!(?c, "dropping character with no vocabulary entry"),
        }
    }
}

enum Fragment<'t> {
    Text(&'t str),
    Special(TokenId),
}
