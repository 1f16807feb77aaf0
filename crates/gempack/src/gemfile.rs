//! Declaration reader for the `Gemfile` DSL.
//!
//! Only the parts that matter for packaging are understood: `gem`
//! declarations with their groups and source options, plus `group`, `git`
//! and `path` blocks. Anything else is skipped, but `do ... end` nesting is
//! tracked so a block never leaks its groups past its `end`.
//!
//! ```ruby
//! source 'https://rubygems.org'
//! gem 'rake'
//! gem 'warbler', git: 'https://github.com/jruby/warbler'
//!
//! group :development, :test do
//!   gem 'rspec'
//! end
//! ```

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// The default manifest filename.
pub const GEMFILE: &str = "Gemfile";

/// Errors that can occur when reading a `Gemfile`.
#[derive(Error, Debug)]
pub enum GemfileError {
    #[error("line {line}: `gem` without a package name")]
    MissingName { line: usize },

    #[error("line {line}: `end` without an open block")]
    UnexpectedEnd { line: usize },

    #[error("{open} block(s) still open at end of file")]
    UnclosedBlock { open: usize },
}

/// The source a declaration asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclaredSource {
    /// The default gem source.
    Registry,
    /// A git repository.
    Git { url: String },
    /// A local directory.
    Path { path: String },
}

/// A single `gem` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredGem {
    /// The package name.
    pub name: String,
    /// Groups from enclosing blocks and the `group:` option.
    pub groups: BTreeSet<String>,
    /// Declared source.
    pub source: DeclaredSource,
    /// Line the declaration appears on (1-based).
    pub line: usize,
}

/// The declarations read from a `Gemfile`.
#[derive(Debug, Clone, Default)]
pub struct Gemfile {
    /// Gem declarations in file order.
    pub gems: Vec<DeclaredGem>,
    /// `source` URLs.
    pub sources: Vec<String>,
}

/// A block opened by a line ending in `do`.
#[derive(Debug, Default)]
struct Frame {
    groups: Vec<String>,
    source: Option<DeclaredSource>,
}

impl Gemfile {
    /// Parse `Gemfile` content.
    ///
    /// # Errors
    ///
    /// Returns an error if a `gem` line has no name or `do`/`end` are unbalanced.
    pub fn parse(content: &str) -> Result<Self, GemfileError> {
        let mut gemfile = Self::default();
        let mut stack: Vec<Frame> = Vec::new();

        for (index, raw) in content.lines().enumerate() {
            let line = index + 1;
            let code = strip_comment(raw).trim();
            if code.is_empty() {
                continue;
            }

            if code == "end" || code.starts_with("end ") || code.starts_with("end.") {
                if stack.pop().is_none() {
                    return Err(GemfileError::UnexpectedEnd { line });
                }
                continue;
            }

            let (call, opens_block) = split_block_opener(code);
            let (keyword, rest) = split_keyword(call);

            match keyword {
                "gem" => {
                    let args = CallArgs::parse(strip_modifier(rest));
                    let name = args
                        .positional
                        .first()
                        .and_then(Value::as_text)
                        .ok_or(GemfileError::MissingName { line })?;
                    gemfile.gems.push(declared_gem(name, &args, &stack, line));
                }
                "source" if !opens_block => {
                    let args = CallArgs::parse(rest);
                    if let Some(url) = args.positional.first().and_then(Value::as_text) {
                        gemfile.sources.push(url.to_string());
                    }
                }
                _ => {}
            }

            if opens_block {
                stack.push(frame_for(keyword, rest));
            } else if matches!(keyword, "if" | "unless" | "case" | "begin" | "while" | "until")
            {
                stack.push(Frame::default());
            }
        }

        if !stack.is_empty() {
            return Err(GemfileError::UnclosedBlock { open: stack.len() });
        }

        Ok(gemfile)
    }
}

fn declared_gem(name: &str, args: &CallArgs, stack: &[Frame], line: usize) -> DeclaredGem {
    let mut groups: BTreeSet<String> = stack
        .iter()
        .flat_map(|f| f.groups.iter().cloned())
        .collect();
    for key in ["group", "groups"] {
        if let Some(value) = args.options.get(key) {
            groups.extend(value.texts().map(str::to_string));
        }
    }

    let source = source_option(&args.options)
        .or_else(|| stack.iter().rev().find_map(|f| f.source.clone()))
        .unwrap_or(DeclaredSource::Registry);

    DeclaredGem {
        name: name.to_string(),
        groups,
        source,
        line,
    }
}

fn source_option(options: &BTreeMap<String, Value>) -> Option<DeclaredSource> {
    if let Some(url) = options.get("git").and_then(Value::as_text) {
        return Some(DeclaredSource::Git {
            url: url.to_string(),
        });
    }
    if let Some(repo) = options.get("github").and_then(Value::as_text) {
        return Some(DeclaredSource::Git {
            url: format!("https://github.com/{repo}.git"),
        });
    }
    options
        .get("path")
        .and_then(Value::as_text)
        .map(|path| DeclaredSource::Path {
            path: path.to_string(),
        })
}

fn frame_for(keyword: &str, rest: &str) -> Frame {
    let args = CallArgs::parse(rest);
    let first = args.positional.first().and_then(Value::as_text);
    match keyword {
        "group" => Frame {
            groups: args
                .positional
                .iter()
                .flat_map(Value::texts)
                .map(str::to_string)
                .collect(),
            source: None,
        },
        "git" => Frame {
            groups: Vec::new(),
            source: first.map(|url| DeclaredSource::Git {
                url: url.to_string(),
            }),
        },
        "github" => Frame {
            groups: Vec::new(),
            source: first.map(|repo| DeclaredSource::Git {
                url: format!("https://github.com/{repo}.git"),
            }),
        },
        "path" => Frame {
            groups: Vec::new(),
            source: first.map(|path| DeclaredSource::Path {
                path: path.to_string(),
            }),
        },
        _ => Frame::default(),
    }
}

/// Drop a trailing `# comment`, ignoring `#` inside string literals.
fn strip_comment(line: &str) -> &str {
    let mut quote = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, '#') => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Split `group :test do |x|` into (`group :test`, true).
fn split_block_opener(code: &str) -> (&str, bool) {
    let head = match code.rfind('|') {
        Some(end) if code.trim_end().ends_with('|') => code[..end]
            .rfind('|')
            .map_or(code, |start| code[..start].trim_end()),
        _ => code,
    };
    match head.strip_suffix("do") {
        Some(before) if before.is_empty() || before.ends_with(' ') || before.ends_with(')') => {
            (before.trim_end(), true)
        }
        _ => (code, false),
    }
}

fn split_keyword(call: &str) -> (&str, &str) {
    let end = call
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(call.len());
    let rest = call[end..].trim();
    let rest = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .unwrap_or(rest);
    (&call[..end], rest.trim())
}

/// Drop a trailing `if`/`unless` modifier from a call.
fn strip_modifier(args: &str) -> &str {
    for modifier in [" if ", " unless "] {
        if let Some(pos) = find_top_level(args, modifier) {
            return &args[..pos];
        }
    }
    args
}

/// A literal argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(String),
    Sym(String),
    List(Vec<Value>),
    Other(String),
}

impl Value {
    fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            return Self::List(split_top_level(inner).into_iter().map(Self::parse).collect());
        }
        if let Some(sym) = text.strip_prefix(':') {
            return Self::Sym(unquote(sym).unwrap_or(sym).to_string());
        }
        match unquote(text) {
            Some(s) => Self::Str(s.to_string()),
            None => Self::Other(text.to_string()),
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Sym(s) => Some(s),
            Self::List(_) | Self::Other(_) => None,
        }
    }

    fn texts(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        match self {
            Self::List(items) => Box::new(items.iter().filter_map(Value::as_text)),
            other => Box::new(other.as_text().into_iter()),
        }
    }
}

/// Arguments of a DSL call: positionals plus `key => value` / `key: value` options.
#[derive(Debug, Default)]
struct CallArgs {
    positional: Vec<Value>,
    options: BTreeMap<String, Value>,
}

impl CallArgs {
    fn parse(args: &str) -> Self {
        let mut parsed = Self::default();
        for piece in split_top_level(args) {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            if let Some(pos) = find_top_level(piece, "=>") {
                if let Some(key) = Value::parse(&piece[..pos]).as_text() {
                    parsed
                        .options
                        .insert(key.to_string(), Value::parse(&piece[pos + 2..]));
                }
            } else if let Some((key, value)) = keyword_option(piece) {
                parsed.options.insert(key.to_string(), Value::parse(value));
            } else {
                parsed.positional.push(Value::parse(piece));
            }
        }
        parsed
    }
}

/// `group: :test` style option; rejects `::Const` and symbols.
fn keyword_option(piece: &str) -> Option<(&str, &str)> {
    let end = piece.find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))?;
    if end == 0 {
        return None;
    }
    let rest = piece[end..].strip_prefix(':')?;
    if rest.starts_with(':') {
        return None;
    }
    Some((&piece[..end], rest.trim()))
}

fn unquote(text: &str) -> Option<&str> {
    let text = text.trim();
    ['\'', '"']
        .into_iter()
        .find_map(|q| text.strip_prefix(q).and_then(|t| t.strip_suffix(q)))
}

/// Split on commas outside quotes and brackets.
fn split_top_level(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut quote = None;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, '[' | '(' | '{') => depth += 1,
            (None, ']' | ')' | '}') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                pieces.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&text[start..]);
    pieces
}

/// Byte offset of `needle` outside quotes and brackets.
fn find_top_level(text: &str, needle: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote = None;

    for (i, c) in text.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, '[' | '(' | '{') => depth += 1,
            (None, ']' | ')' | '}') => depth = depth.saturating_sub(1),
            (None, _) if depth == 0 && text[i..].starts_with(needle) => return Some(i),
            _ => {}
        }
    }
    None
}
