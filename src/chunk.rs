//! Heading-aware contract chunker.
//!
//! Splits extracted contract text into [`Chunk`]s along the headings German
//! contracts use (`1.`, `§ 3`, `Artikel 2`, `4.1`, `(2)`, `Abschnitt II`,
//! markdown emphasis, all-caps lines). Chunks shorter than the floor are
//! dropped, chunks longer than the ceiling are split. All lengths are in
//! characters, so a split never lands inside a UTF-8 sequence.
//!
//! If no heading produces a chunk, the whole text is returned, split at the
//! ceiling when necessary.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Heading patterns, tried in order. The capture group named `section`, if
/// present, becomes the chunk's section marker.
static HEADING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^(?P<section>\d+)\.\s+.+$",
        r"^§\s*(?P<section>\d+)\s+.+$",
        r"^Artikel\s+(?P<section>\d+)\s+.+$",
        r"^(?P<section>\d+\.\d+)\s+.+$",
        r"^\((?P<section>\d+)\)\s+.+$",
        r"^(?:Abschnitt|Titel|Kapitel)\s+(?P<section>[IVX\d]+)\s*[:\-]?\s*.+$",
        r"^(?:#+\s*|\*\*|__).+?(?:\*\*|__)?$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("heading pattern is valid"))
    .collect()
});

/// A detected heading line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub text: String,
    pub section: Option<String>,
}

/// Classify a trimmed line as a heading.
pub fn detect_heading(line: &str) -> Option<Heading> {
    if line.chars().count() < 3 {
        return None;
    }

    for pattern in HEADING_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(line) {
            return Some(Heading {
                text: line.to_string(),
                section: caps.name("section").map(|m| m.as_str().to_string()),
            });
        }
    }

    if is_all_caps(line) && line.chars().count() < 100 && !line.ends_with('.') {
        return Some(Heading {
            text: line.to_string(),
            section: None,
        });
    }

    None
}

/// At least one cased letter and no lower-case ones.
fn is_all_caps(line: &str) -> bool {
    let mut cased = false;
    for c in line.chars() {
        if c.is_lowercase() {
            return false;
        }
        if c.is_uppercase() {
            cased = true;
        }
    }
    cased
}

/// Split `s` after `n` characters.
fn split_at_chars(s: &str, n: usize) -> (&str, &str) {
    match s.char_indices().nth(n) {
        Some((idx, _)) => s.split_at(idx),
        None => (s, ""),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    min_chars: usize,
    max_chars: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(100, 2000)
    }
}

/// The chunk under construction.
struct Pending {
    text: String,
    chars: usize,
    heading: Option<String>,
    section: Option<String>,
}

impl Pending {
    fn push_line(&mut self, line: &str) {
        if !self.text.is_empty() {
            self.text.push('\n');
            self.chars += 1;
        }
        self.text.push_str(line);
        self.chars += line.chars().count();
    }

    fn chunk(&self, text: &str) -> Chunk {
        Chunk {
            text: text.to_string(),
            heading: self.heading.clone(),
            section: self.section.clone(),
        }
    }
}

impl Chunker {
    pub fn new(min_chars: usize, max_chars: usize) -> Self {
        Self {
            min_chars,
            max_chars: max_chars.max(1),
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.min_chars, config.max_chars)
    }

    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut pending = Pending {
            text: String::new(),
            chars: 0,
            heading: None,
            section: None,
        };

        for raw in trimmed.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(heading) = detect_heading(line) {
                self.flush(&mut chunks, &pending);
                pending = Pending {
                    text: String::new(),
                    chars: 0,
                    heading: Some(heading.text),
                    section: heading.section,
                };
            }
            pending.push_line(line);
            self.split_oversized(&mut chunks, &mut pending);
        }
        self.flush(&mut chunks, &pending);

        if chunks.is_empty() {
            return self.split_whole(trimmed);
        }
        chunks
    }

    fn flush(&self, chunks: &mut Vec<Chunk>, pending: &Pending) {
        if !pending.text.is_empty() && pending.chars >= self.min_chars {
            chunks.push(pending.chunk(&pending.text));
        }
    }

    /// Emit ceiling-sized pieces while the pending chunk is too long; the
    /// remainder stays pending under the same heading.
    fn split_oversized(&self, chunks: &mut Vec<Chunk>, pending: &mut Pending) {
        while pending.chars > self.max_chars {
            let (head, tail) = split_at_chars(&pending.text, self.max_chars);
            let head = head.trim_end();
            if !head.is_empty() {
                chunks.push(pending.chunk(head));
            }
            let rest = tail.trim_start().to_string();
            pending.chars = rest.chars().count();
            pending.text = rest;
        }
    }

    fn split_whole(&self, text: &str) -> Vec<Chunk> {
        let mut out = Vec::new();
        let mut remaining = text;
        while !remaining.is_empty() {
            let (head, tail) = split_at_chars(remaining, self.max_chars);
            let head = head.trim();
            if !head.is_empty() {
                out.push(Chunk {
                    text: head.to_string(),
                    heading: None,
                    section: None,
                });
            }
            remaining = tail.trim_start();
        }
        out
    }
}
