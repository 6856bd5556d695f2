//! SFZ text parsing: header scopes, opcode pairs and inheritance.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, multispace0};
use nom::combinator::map;
use nom::sequence::{delimited, preceded, separated_pair};

use crate::error::{FormatError, Result};

pub type OpcodeMap = HashMap<String, String>;

/// Opcode prefixes that carry no playback meaning for conversion.
const IGNORED_OPCODE_PREFIXES: &[&str] = &["hint_", "label_", "set_cc", "set_hdcc", "set_realcc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Control,
    Global,
    Master,
    Group,
    Region,
    Curve,
}

impl Header {
    /// Only these six headers are legal. Anything else, including
    /// `<effect>`, `<midi>` and `<sample>`, rejects the whole file.
    fn from_name(name: &str) -> std::result::Result<Header, FormatError> {
        match name.to_ascii_lowercase().as_str() {
            "control" => Ok(Header::Control),
            "global" => Ok(Header::Global),
            "master" => Ok(Header::Master),
            "group" => Ok(Header::Group),
            "region" => Ok(Header::Region),
            "curve" => Ok(Header::Curve),
            _ => Err(FormatError::IllegalHeader(name.to_string())),
        }
    }
}

/// A parsed SFZ file. Each region map already holds its effective
/// opcodes: control, global, master, group and region merged in that
/// order, later scopes winning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SfzDocument {
    pub control: OpcodeMap,
    pub regions: Vec<OpcodeMap>,
}

impl SfzDocument {
    pub fn default_path(&self) -> Option<String> {
        self.control
            .get("default_path")
            .filter(|p| !p.is_empty())
            .map(|p| p.replace('\\', "/"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Header(&'a str),
    Opcode(&'a str, &'a str),
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn starts_with_opcode(s: &str) -> bool {
    let key_len = s.find(|c: char| !is_key_char(c)).unwrap_or(s.len());
    key_len > 0 && s[key_len..].starts_with('=')
}

/// A value runs to the end of the line, to the next header, or to the
/// next whitespace-separated `key=`. Sample paths may contain spaces.
fn opcode_value(input: &str) -> IResult<&str, &str> {
    let bytes = input.as_bytes();
    let mut end = bytes.len();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'\n' | b'\r' | b'<' => {
                end = i;
                break;
            }
            b' ' | b'\t' => {
                let rest = input[i..].trim_start_matches([' ', '\t']);
                if rest.starts_with('<') || starts_with_opcode(rest) {
                    end = i;
                    break;
                }
            }
            _ => {}
        }
    }
    Ok((&input[end..], input[..end].trim()))
}

fn header_tag(input: &str) -> IResult<&str, &str> {
    delimited(char('<'), take_while1(is_key_char), char('>'))(input)
}

fn token(input: &str) -> IResult<&str, Token<'_>> {
    preceded(
        multispace0,
        alt((
            map(header_tag, Token::Header),
            map(
                separated_pair(take_while1(is_key_char), char('='), opcode_value),
                |(key, value)| Token::Opcode(key, value),
            ),
        )),
    )(input)
}

/// Removes `// line` and `/* block */` comments.
fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("//") {
            rest = after.find('\n').map_or("", |i| &after[i..]);
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |i| &after[i + 2..]);
            out.push(' ');
        } else {
            let c = rest.chars().next().unwrap_or_default();
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    out
}

/// Pulls `#define $NAME value` lines out of the text and substitutes them
/// everywhere else. Any other directive is rejected.
fn expand_directives(text: &str) -> std::result::Result<String, FormatError> {
    let mut defines: Vec<(String, String)> = Vec::new();
    let mut body = String::with_capacity(text.len());
    for line in text.lines() {
        let trimmed = line.trim_start();
        let Some(directive) = trimmed.strip_prefix('#') else {
            body.push_str(line);
            body.push('\n');
            continue;
        };
        let mut parts = directive.split_whitespace();
        match parts.next() {
            Some("define") => {
                let name = parts.next().unwrap_or_default();
                let value = parts.collect::<Vec<_>>().join(" ");
                if !name.starts_with('$') {
                    return Err(FormatError::Syntax(trimmed.to_string()));
                }
                defines.push((name.to_string(), value));
            }
            other => {
                return Err(FormatError::UnsupportedDirective(
                    other.unwrap_or_default().to_string(),
                ));
            }
        }
    }
    // Longest names first so `$VEL` never clobbers `$VELHI`.
    defines.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    for (name, value) in &defines {
        body = body.replace(name.as_str(), value);
    }
    Ok(body)
}

#[derive(Default)]
struct Scopes {
    control: OpcodeMap,
    global: OpcodeMap,
    master: OpcodeMap,
    group: OpcodeMap,
}

impl Scopes {
    fn effective(&self, region: OpcodeMap) -> OpcodeMap {
        let mut merged = self.control.clone();
        for scope in [&self.global, &self.master, &self.group] {
            merged.extend(scope.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged.extend(region);
        merged
    }
}

/// Parses SFZ text into header-scoped opcode maps.
pub fn parse(text: &str) -> std::result::Result<SfzDocument, FormatError> {
    let text = expand_directives(&strip_comments(text))?;

    let mut scopes = Scopes::default();
    let mut regions = Vec::new();
    let mut current: Option<Header> = None;
    let mut section = OpcodeMap::new();

    let mut close = |header: Option<Header>, section: OpcodeMap, scopes: &mut Scopes| match header {
        Some(Header::Control) => scopes.control = section,
        Some(Header::Global) => scopes.global = section,
        Some(Header::Master) => scopes.master = section,
        Some(Header::Group) => scopes.group = section,
        Some(Header::Region) => regions.push(scopes.effective(section)),
        Some(Header::Curve) | None => {}
    };

    let mut rest = text.as_str();
    while !rest.trim_start().is_empty() {
        let (remaining, token) = token(rest).map_err(|_| {
            let snippet: String = rest.trim_start().chars().take(32).collect();
            FormatError::Syntax(snippet)
        })?;
        rest = remaining;

        match token {
            Token::Header(name) => {
                let header = Header::from_name(name)?;
                close(current, std::mem::take(&mut section), &mut scopes);
                match header {
                    Header::Global => {
                        scopes.master.clear();
                        scopes.group.clear();
                    }
                    Header::Master => scopes.group.clear(),
                    _ => {}
                }
                current = Some(header);
            }
            Token::Opcode(key, value) => {
                let key = key.to_ascii_lowercase();
                if current.is_none() {
                    log::debug!("Dropping opcode '{key}' outside any header");
                    continue;
                }
                if IGNORED_OPCODE_PREFIXES.iter().any(|p| key.starts_with(p)) {
                    continue;
                }
                section.insert(key, value.to_string());
            }
        }
    }
    close(current, section, &mut scopes);

    Ok(SfzDocument {
        control: scopes.control,
        regions,
    })
}

pub fn read_sfz_file(path: &Path) -> Result<SfzDocument> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(parse(&text)?)
}

/// Parses a MIDI note number or a scientific pitch name (`C4` = 60).
pub fn parse_note(value: &str) -> Option<u8> {
    let value = value.trim();
    if let Ok(n) = value.parse::<i32>() {
        return u8::try_from(n).ok().filter(|n| *n <= 127);
    }

    let mut chars = value.chars();
    let base = match chars.next()?.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let rest = chars.as_str();
    let (shift, octave) = if let Some(o) = rest.strip_prefix('#') {
        (1, o)
    } else if let Some(o) = rest.strip_prefix('b') {
        (-1, o)
    } else {
        (0, rest)
    };
    let octave: i32 = octave.parse().ok()?;
    let midi = base + shift + (octave + 1) * 12;
    u8::try_from(midi).ok().filter(|n| *n <= 127)
}
