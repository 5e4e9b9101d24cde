//! Left-to-right tokenizer for rich-text bodies
//!
//! Produces text runs (entities decoded), open tags and close tags.
//! Comments, doctypes and processing instructions are skipped, and
//! script-like elements are dropped together with their contents. A `<`
//! that does not begin well-formed markup is returned as literal text.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    Text(String),
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close {
        name: String,
    },
}

/// Elements whose whole subtree is discarded
const DISCARDED: &[&str] = &[
    "script", "style", "noscript", "template", "iframe", "object", "head", "title", "svg",
];

enum Markup {
    Tag(Token, usize),
    Skip(usize),
    Literal,
}

pub(crate) struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub(crate) fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn skip_subtree(&mut self, name: &str) {
        let rest = &self.input[self.pos..];
        // ASCII lowercasing keeps byte offsets aligned with `rest`
        let haystack = rest.to_ascii_lowercase();
        let needle = format!("</{}", name);

        self.pos += match haystack.find(&needle) {
            Some(start) => match haystack[start..].find('>') {
                Some(end) => start + end + 1,
                None => rest.len(),
            },
            None => rest.len(),
        };
    }
}

impl Iterator for Tokenizer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        loop {
            let rest = &self.input[self.pos..];
            if rest.is_empty() {
                return None;
            }

            if !rest.starts_with('<') {
                let end = rest.find('<').unwrap_or(rest.len());
                self.pos += end;
                return Some(Token::Text(decode_entities(&rest[..end])));
            }

            match scan_markup(rest) {
                Markup::Skip(len) => self.pos += len,
                Markup::Tag(token, len) => {
                    self.pos += len;
                    if let Token::Open {
                        name,
                        self_closing: false,
                        ..
                    } = &token
                    {
                        if DISCARDED.contains(&name.as_str()) {
                            let name = name.clone();
                            self.skip_subtree(&name);
                            continue;
                        }
                    }
                    return Some(token);
                }
                Markup::Literal => {
                    let end = rest[1..].find('<').map(|i| i + 1).unwrap_or(rest.len());
                    self.pos += end;
                    return Some(Token::Text(decode_entities(&rest[..end])));
                }
            }
        }
    }
}

/// Scan the markup starting at `rest[0] == '<'`
fn scan_markup(rest: &str) -> Markup {
    if let Some(body) = rest.strip_prefix("<!--") {
        return Markup::Skip(body.find("-->").map(|i| 4 + i + 3).unwrap_or(rest.len()));
    }
    if let Some(body) = rest.strip_prefix("<![CDATA[") {
        return Markup::Skip(body.find("]]>").map(|i| 9 + i + 3).unwrap_or(rest.len()));
    }
    if rest.starts_with("<!") || rest.starts_with("<?") {
        return match rest[1..].find(|c: char| c == '<' || c == '>') {
            Some(i) if rest.as_bytes()[i + 1] == b'>' => Markup::Skip(i + 2),
            _ => Markup::Literal,
        };
    }

    let bytes = rest.as_bytes();
    let closing = rest.starts_with("</");
    let name_start = if closing { 2 } else { 1 };

    if !bytes.get(name_start).is_some_and(|b| b.is_ascii_alphabetic()) {
        return Markup::Literal;
    }

    let mut i = name_start;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'-') {
        i += 1;
    }
    let name = rest[name_start..i].to_ascii_lowercase();

    let mut attrs = Vec::new();
    let mut self_closing = false;

    loop {
        i = skip_whitespace(bytes, i);
        match bytes.get(i) {
            None => return Markup::Literal,
            Some(b'>') => {
                i += 1;
                break;
            }
            Some(b'/') => {
                if bytes.get(i + 1) == Some(&b'>') {
                    self_closing = true;
                    i += 2;
                    break;
                }
                i += 1;
            }
            // A new tag opening inside this one means this one is text
            Some(b'<') => return Markup::Literal,
            Some(_) => {
                let start = i;
                while i < bytes.len()
                    && !bytes[i].is_ascii_whitespace()
                    && !matches!(bytes[i], b'=' | b'>' | b'/' | b'<')
                {
                    i += 1;
                }
                let attr_name = rest[start..i].to_ascii_lowercase();

                i = skip_whitespace(bytes, i);
                let mut value = String::new();
                if bytes.get(i) == Some(&b'=') {
                    i = skip_whitespace(bytes, i + 1);
                    match bytes.get(i) {
                        Some(&quote) if quote == b'"' || quote == b'\'' => {
                            let value_start = i + 1;
                            match rest[value_start..].find(quote as char) {
                                Some(len) => {
                                    value = decode_entities(&rest[value_start..value_start + len]);
                                    i = value_start + len + 1;
                                }
                                None => return Markup::Literal,
                            }
                        }
                        Some(_) => {
                            let value_start = i;
                            while i < bytes.len()
                                && !bytes[i].is_ascii_whitespace()
                                && !matches!(bytes[i], b'>' | b'<')
                            {
                                i += 1;
                            }
                            value = decode_entities(&rest[value_start..i]);
                        }
                        None => return Markup::Literal,
                    }
                }

                if !attr_name.is_empty() {
                    attrs.push((attr_name, value));
                }
            }
        }
    }

    let token = if closing {
        Token::Close { name }
    } else {
        Token::Open {
            name,
            attrs,
            self_closing,
        }
    };
    Markup::Tag(token, i)
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Decode character references; unknown ones are kept verbatim
pub(crate) fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        match parse_entity(tail) {
            Some((decoded, len)) => {
                out.push_str(&decoded);
                rest = &tail[len..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Longest named reference in the HTML5 table plus `&` and `;`
const MAX_ENTITY_LEN: usize = 34;

fn parse_entity(s: &str) -> Option<(String, usize)> {
    let (semi, _) = s
        .char_indices()
        .take(MAX_ENTITY_LEN)
        .find(|(_, c)| *c == ';')?;
    let name = &s[1..semi];

    if let Some(number) = name.strip_prefix('#') {
        let code = match number.strip_prefix('x').or_else(|| number.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => number.parse::<u32>().ok()?,
        };
        if code == 0 {
            return None;
        }
        return Some((char::from_u32(code)?.to_string(), semi + 1));
    }

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    // Rendered text has no use for a non-breaking space
    if name == "nbsp" {
        return Some((" ".to_string(), semi + 1));
    }

    let reference = &s[..=semi];
    let decoded = html_escape::decode_html_entities(reference);
    // A legacy prefix match (`&ampx;` as `&` + `x;`) keeps the trailing `;`
    if decoded == reference || (decoded.ends_with(';') && name != "semi") {
        return None;
    }
    Some((decoded.into_owned(), semi + 1))
}
