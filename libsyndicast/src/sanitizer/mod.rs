//! Rich text to platform markup conversion
//!
//! Content bodies are authored as HTML. Each platform accepts only a small
//! subset of inline tags (or none at all), so every body is rewritten for
//! the target's [`MarkupDialect`] before publishing.
//!
//! The conversion is a single left-to-right pass over tokens:
//!
//! - script-like elements are dropped with their contents
//! - block elements become text followed by a line break
//! - list items become `• ` prefixed lines (ordered lists too)
//! - tag aliases collapse to one spelling (`strong` → `b`, `em` → `i`, ...)
//!   and only `href` survives, on links
//! - tags outside the dialect are removed, keeping their text
//! - open tags live on an explicit stack; a close tag pops back to its
//!   match and anything still open at the end is closed in reverse order
//! - blank line runs collapse to one blank line, lines are trimmed, and
//!   stray `<`, `>` and `&` are escaped in HTML dialects
//!
//! # Examples
//!
//! ```
//! use libsyndicast::sanitizer::{sanitize, MarkupDialect};
//!
//! let html = sanitize("<p>Hello <strong>world</strong><script>x()</script></p>", &MarkupDialect::TELEGRAM_HTML);
//! assert_eq!(html, "Hello <b>world</b>");
//!
//! let plain = sanitize(r#"See <a href="https://example.com">docs</a>"#, &MarkupDialect::PLAIN_TEXT);
//! assert_eq!(plain, "See docs (https://example.com)");
//! ```

mod delivery;
mod tokenizer;

pub use delivery::{plan_delivery, DeliveryPlan};

use tokenizer::{Token, Tokenizer};

/// Inline formatting a dialect may support
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineTag {
    Bold,
    Italic,
    Underline,
    Strike,
    Link,
    Code,
    Pre,
}

impl InlineTag {
    /// Canonical tag for any accepted spelling
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "b" | "strong" => Some(InlineTag::Bold),
            "i" | "em" => Some(InlineTag::Italic),
            "u" | "ins" => Some(InlineTag::Underline),
            "s" | "strike" | "del" => Some(InlineTag::Strike),
            "a" => Some(InlineTag::Link),
            "code" => Some(InlineTag::Code),
            "pre" => Some(InlineTag::Pre),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InlineTag::Bold => "b",
            InlineTag::Italic => "i",
            InlineTag::Underline => "u",
            InlineTag::Strike => "s",
            InlineTag::Link => "a",
            InlineTag::Code => "code",
            InlineTag::Pre => "pre",
        }
    }
}

/// What to do with a link the dialect cannot express as markup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFallback {
    /// Keep only the link text
    Drop,
    /// Append the target after the text: `text (url)`
    Inline,
}

/// The markup subset a platform renderer accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkupDialect {
    pub allowed: &'static [InlineTag],
    /// Escape `<`, `>` and `&` in text (HTML parse modes)
    pub escape_html: bool,
    pub link_fallback: LinkFallback,
}

impl MarkupDialect {
    /// Telegram Bot API `parse_mode=HTML`
    pub const TELEGRAM_HTML: MarkupDialect = MarkupDialect {
        allowed: &[
            InlineTag::Bold,
            InlineTag::Italic,
            InlineTag::Underline,
            InlineTag::Strike,
            InlineTag::Link,
            InlineTag::Code,
            InlineTag::Pre,
        ],
        escape_html: true,
        link_fallback: LinkFallback::Drop,
    };

    /// Platforms that render captions and posts verbatim
    pub const PLAIN_TEXT: MarkupDialect = MarkupDialect {
        allowed: &[],
        escape_html: false,
        link_fallback: LinkFallback::Inline,
    };

    pub fn allows(&self, tag: InlineTag) -> bool {
        self.allowed.contains(&tag)
    }
}

/// Convert a rich-text body into `dialect`
pub fn sanitize(input: &str, dialect: &MarkupDialect) -> String {
    let mut renderer = Renderer::new(dialect);
    for token in Tokenizer::new(input) {
        renderer.feed(token);
    }
    renderer.finish()
}

/// Number of characters a reader sees once markup is rendered
pub fn visible_len(markup: &str) -> usize {
    Tokenizer::new(markup)
        .map(|token| match token {
            Token::Text(text) => text.chars().count(),
            _ => 0,
        })
        .sum()
}

/// Cut plain text to at most `limit` characters, marking the cut with `...`
pub fn truncate_plain(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let keep = limit.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.truncate(out.trim_end().len());
    out.push_str("...");
    out
}

const BLOCKS: &[&str] = &[
    "p", "div", "blockquote", "section", "article", "header", "footer", "aside", "main", "nav",
    "figure", "figcaption", "address", "table", "tr", "dl", "dt", "dd", "ul", "ol", "li", "h1",
    "h2", "h3", "h4", "h5", "h6",
];

fn is_heading(name: &str) -> bool {
    matches!(name, "h1" | "h2" | "h3" | "h4" | "h5" | "h6")
}

#[derive(Debug)]
struct OpenTag {
    tag: InlineTag,
    href: Option<String>,
    /// Whether the tag was written to the output
    emitted: bool,
    /// Output length when the tag opened
    text_start: usize,
}

/// An open block element and the inline stack depth when it opened
#[derive(Debug)]
struct BlockFrame {
    name: String,
    depth: usize,
}

struct Renderer<'d> {
    dialect: &'d MarkupDialect,
    out: String,
    stack: Vec<OpenTag>,
    blocks: Vec<BlockFrame>,
}

impl<'d> Renderer<'d> {
    fn new(dialect: &'d MarkupDialect) -> Self {
        Self {
            dialect,
            out: String::new(),
            stack: Vec::new(),
            blocks: Vec::new(),
        }
    }

    fn feed(&mut self, token: Token) {
        match token {
            Token::Text(text) => self.push_text(&text),
            Token::Open {
                name,
                attrs,
                self_closing,
            } => self.open(&name, &attrs, self_closing),
            Token::Close { name } => self.close(&name),
        }
    }

    fn open(&mut self, name: &str, attrs: &[(String, String)], self_closing: bool) {
        if name == "br" || name == "hr" {
            self.out.push('\n');
            return;
        }

        if BLOCKS.contains(&name) {
            if self_closing {
                self.out.push('\n');
                return;
            }
            if matches!(name, "ul" | "ol" | "li") {
                self.ensure_line_start();
            }
            self.blocks.push(BlockFrame {
                name: name.to_string(),
                depth: self.stack.len(),
            });
            if name == "li" {
                self.out.push_str("• ");
            } else if is_heading(name) {
                self.open_inline(InlineTag::Bold, None);
            }
            return;
        }

        if let Some(tag) = InlineTag::from_name(name) {
            if self_closing {
                return;
            }
            let href = if tag == InlineTag::Link {
                attrs
                    .iter()
                    .find(|(key, _)| key == "href")
                    .and_then(|(_, value)| safe_href(value))
            } else {
                None
            };
            self.open_inline(tag, href);
        }
    }

    fn close(&mut self, name: &str) {
        if BLOCKS.contains(&name) {
            let Some(index) = self.blocks.iter().rposition(|b| b.name == name) else {
                return;
            };
            let depth = self.blocks[index].depth;
            self.blocks.truncate(index);
            while self.stack.len() > depth {
                if let Some(open) = self.stack.pop() {
                    self.write_close(&open);
                }
            }
            self.ensure_line_start();
            return;
        }

        if let Some(tag) = InlineTag::from_name(name) {
            self.close_inline(tag);
        }
    }

    fn open_inline(&mut self, tag: InlineTag, href: Option<String>) {
        let emitted = self.can_emit(tag) && (tag != InlineTag::Link || href.is_some());

        if emitted {
            match &href {
                Some(href) => {
                    self.out.push_str("<a href=\"");
                    self.out.push_str(&escape_attr(href));
                    self.out.push_str("\">");
                }
                None => {
                    self.out.push('<');
                    self.out.push_str(tag.name());
                    self.out.push('>');
                }
            }
        }

        self.stack.push(OpenTag {
            tag,
            href,
            emitted,
            text_start: self.out.len(),
        });
    }

    fn can_emit(&self, tag: InlineTag) -> bool {
        if !self.dialect.allows(tag) {
            return false;
        }
        let active = |t: InlineTag| self.stack.iter().any(|o| o.emitted && o.tag == t);
        // No self-nesting, nothing inside inline code, only code inside pre
        if active(tag) || active(InlineTag::Code) {
            return false;
        }
        !(active(InlineTag::Pre) && tag != InlineTag::Code)
    }

    fn close_inline(&mut self, tag: InlineTag) {
        // Tags opened outside the innermost block cannot be closed from inside it
        let floor = self.blocks.last().map(|b| b.depth).unwrap_or(0);
        let Some(index) = self.stack[floor..]
            .iter()
            .rposition(|o| o.tag == tag)
            .map(|i| i + floor)
        else {
            return;
        };

        // Misnested close: shut the inner tags, close the match, then reopen them
        let reopen = self.stack.split_off(index + 1);
        for open in reopen.iter().rev() {
            self.write_close(open);
        }
        if let Some(open) = self.stack.pop() {
            self.write_close(&open);
        }
        for mut open in reopen {
            if open.emitted {
                self.out.push('<');
                match &open.href {
                    Some(href) => {
                        self.out.push_str("a href=\"");
                        self.out.push_str(&escape_attr(href));
                        self.out.push('"');
                    }
                    None => self.out.push_str(open.tag.name()),
                }
                self.out.push('>');
            }
            open.text_start = self.out.len();
            self.stack.push(open);
        }
    }

    fn write_close(&mut self, open: &OpenTag) {
        if open.emitted {
            self.out.push_str("</");
            self.out.push_str(open.tag.name());
            self.out.push('>');
            return;
        }

        let inline_link = open.tag == InlineTag::Link
            && !self.dialect.allows(InlineTag::Link)
            && self.dialect.link_fallback == LinkFallback::Inline;
        if let (true, Some(href)) = (inline_link, &open.href) {
            let text = self.out.get(open.text_start..).unwrap_or("").trim();
            if text.is_empty() {
                self.out.push_str(href);
            } else if text != href {
                self.out.push_str(" (");
                self.out.push_str(href);
                self.out.push(')');
            }
        }
    }

    fn push_text(&mut self, text: &str) {
        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        // Source indentation between blocks is not content
        let text = if self.out.is_empty() || self.out.ends_with('\n') {
            text.trim_start()
        } else {
            text.as_str()
        };
        if text.is_empty() {
            return;
        }
        if self.dialect.escape_html {
            self.out.push_str(&escape_text(text));
        } else {
            self.out.push_str(text);
        }
    }

    fn ensure_line_start(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with('\n') {
            self.out.push('\n');
        }
    }

    fn finish(mut self) -> String {
        while let Some(open) = self.stack.pop() {
            self.write_close(&open);
        }
        normalize_lines(&self.out)
    }
}

/// Trim every line, drop leading/trailing blank lines and keep at most one
/// blank line between paragraphs
fn normalize_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;

    for line in text.split('\n').map(str::trim) {
        if line.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if blank_run > 0 {
                out.push('\n');
            }
        }
        blank_run = 0;
        out.push_str(line);
    }

    out
}

fn safe_href(raw: &str) -> Option<String> {
    let href = raw.trim();
    let lower = href.to_ascii_lowercase();
    let allowed = ["http://", "https://", "mailto:", "tg://"]
        .iter()
        .any(|scheme| lower.starts_with(scheme));
    allowed.then(|| href.to_string())
}

fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn escape_attr(value: &str) -> String {
    escape_text(value).replace('"', "&quot;")
}
