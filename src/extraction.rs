use html2text::from_read;
use scraper::{Html, Selector};

use crate::data_models::{Chunk, ExtractedContent, FetchedPage};

const TEXT_WIDTH: usize = 120;
const MIN_EXTRACTED_CHARS: usize = 200;

/// Turns a fetched page into text. `None` means extraction failed and the
/// url should go through recovery.
pub trait ContentExtractor: Send + Sync {
    fn extract(&self, page: &FetchedPage) -> Option<ExtractedContent>;
}

/// Plain `<title>` + html2text extraction.
#[derive(Debug, Clone)]
pub struct HtmlExtractor {
    pub min_chars: usize,
}

impl Default for HtmlExtractor {
    fn default() -> Self {
        Self {
            min_chars: MIN_EXTRACTED_CHARS,
        }
    }
}

impl HtmlExtractor {
    fn title(document: &Html) -> String {
        let Ok(title_selector) = Selector::parse("title") else {
            return String::new();
        };
        document
            .select(&title_selector)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string())
            .unwrap_or_default()
    }
}

impl ContentExtractor for HtmlExtractor {
    fn extract(&self, page: &FetchedPage) -> Option<ExtractedContent> {
        let (title, text) = if page.content_type == "text/plain" {
            (String::new(), page.html.trim().to_string())
        } else {
            let document = Html::parse_document(&page.html);
            let text = match from_read(page.html.as_bytes(), TEXT_WIDTH) {
                Ok(text) => text,
                Err(e) => {
                    log::debug!("error converting html of {}, error: {:#}", page.url, e);
                    return None;
                }
            };
            (Self::title(&document), text.trim().to_string())
        };

        if text.chars().count() < self.min_chars {
            log::debug!("too little text in {} ({} chars)", page.url, text.chars().count());
            return None;
        }
        Some(ExtractedContent::new(page.url.as_str(), title, text))
    }
}

/// Splits extracted text into bounded chunks, paragraph boundaries first.
#[derive(Debug, Clone)]
pub struct Chunker {
    pub max_chars: usize,
    pub max_chunks_per_source: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            max_chars: 4000,
            max_chunks_per_source: 5,
        }
    }
}

impl Chunker {
    pub fn chunk(&self, content: &ExtractedContent) -> Vec<Chunk> {
        let max_chars = self.max_chars.max(1);
        let mut pieces: Vec<String> = Vec::new();
        let mut current = String::new();

        for paragraph in content.text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            for part in split_long(paragraph, max_chars) {
                let needed = current.chars().count() + part.chars().count() + 2;
                if !current.is_empty() && needed > max_chars {
                    pieces.push(std::mem::take(&mut current));
                }
                if !current.is_empty() {
                    current.push_str("\n\n");
                }
                current.push_str(&part);
            }
        }
        if !current.is_empty() {
            pieces.push(current);
        }

        pieces
            .into_iter()
            .take(self.max_chunks_per_source)
            .enumerate()
            .map(|(index, text)| Chunk {
                url: content.url.clone(),
                title: content.title.clone(),
                text,
                index,
            })
            .collect()
    }

    pub fn chunk_all(&self, contents: &[ExtractedContent]) -> Vec<Chunk> {
        contents.iter().flat_map(|c| self.chunk(c)).collect()
    }
}

/// Break a paragraph longer than `max_chars` on whitespace, or hard-cut
/// words that are longer than that on their own.
fn split_long(paragraph: &str, max_chars: usize) -> Vec<String> {
    if paragraph.chars().count() <= max_chars {
        return vec![paragraph.to_string()];
    }
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for word in paragraph.split_whitespace() {
        let chars: Vec<char> = word.chars().collect();
        for piece in chars.chunks(max_chars) {
            let piece: String = piece.iter().collect();
            let len = piece.chars().count();
            if current_len > 0 && current_len + 1 + len > max_chars {
                parts.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if current_len > 0 {
                current.push(' ');
                current_len += 1;
            }
            current.push_str(&piece);
            current_len += len;
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
