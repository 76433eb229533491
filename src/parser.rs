//! The surface parser: spec.md §6 treats this as an external collaborator
//! ("the surface parser that produces the instruction tree"). This module
//! defines the `Parser` trait the VM depends on plus a small hand-rolled
//! default directive language, in the recursive-descent style of
//! `arthur-zhang-just-bash`'s `parser/` module rather than armake2's
//! build-time PEG grammar (see DESIGN.md for why the build-time grammar
//! generator was dropped).
//!
//! Directive syntax:
//!
//! ```text
//! @set NAME = EXPR
//! @include EXPR
//! @if EXPR ... @elseif EXPR ... @else ... @endif
//! @macro NAME(arg, arg) ... @endmacro
//! @error EXPR
//! {{ EXPR }}            (inline interpolation inside ordinary text)
//! ```
//!
//! Everything else is literal text.

use thiserror::Error;

use crate::instruction::{ConditionalBranch, Instruction};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("unknown directive \"@{directive}\" at line {line}")]
    UnknownDirective { directive: String, line: u32 },
    #[error("unexpected \"@{directive}\" with no matching opener at line {line}")]
    UnexpectedDirective { directive: String, line: u32 },
    #[error("unterminated block opened at line {line}")]
    UnterminatedBlock { line: u32 },
    #[error("invalid \"@set\" directive at line {line}: expected \"NAME = EXPR\"")]
    InvalidSet { line: u32 },
}

/// External collaborator contract (spec.md §6): parse `source` into an
/// instruction tree. `set_file` lets the VM tell the parser which
/// filename to report in parse errors before each nested parse (spec.md
/// §6: "a mutable `file` attribute that the VM sets before each nested
/// parse").
pub trait Parser {
    fn set_file(&mut self, file: String);
    fn parse(&mut self, source: &str) -> Result<Vec<Instruction>, ParseError>;
}

#[derive(Debug, Default)]
pub struct DirectiveParser {
    file: String,
}

impl DirectiveParser {
    pub fn new() -> Self {
        DirectiveParser::default()
    }
}

impl Parser for DirectiveParser {
    fn set_file(&mut self, file: String) {
        self.file = file;
    }

    fn parse(&mut self, source: &str) -> Result<Vec<Instruction>, ParseError> {
        let state = ParseState::new(source);
        let mut idx = 0usize;
        let instructions = parse_block(&state, &mut idx, None)?;
        if idx < state.lines.len() {
            let line_no = (idx + 1) as u32;
            let directive = directive_keyword(state.lines[idx]);
            return Err(ParseError::UnexpectedDirective {
                directive,
                line: line_no,
            });
        }
        Ok(instructions)
    }
}

struct ParseState<'a> {
    lines: Vec<&'a str>,
    trailing_newline: bool,
}

impl<'a> ParseState<'a> {
    fn new(source: &'a str) -> Self {
        let trailing_newline = source.ends_with('\n');
        let mut lines: Vec<&str> = source.split('\n').collect();
        if trailing_newline {
            lines.pop();
        }
        ParseState {
            lines,
            trailing_newline,
        }
    }

    fn line_suffix(&self, i: usize) -> &'static str {
        if i == self.lines.len() - 1 && !self.trailing_newline {
            ""
        } else {
            "\n"
        }
    }
}

fn directive_keyword(line: &str) -> String {
    let trimmed = line.trim_start();
    let directive = trimmed.strip_prefix('@').unwrap_or(trimmed);
    split_keyword(directive).0
}

fn split_keyword(s: &str) -> (String, &str) {
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    (s[..end].to_string(), s[end..].trim_start())
}

/// Parses lines until EOF or until a directive keyword in `terminators` is
/// reached (left unconsumed, for the caller to inspect). `terminators ==
/// None` means "top-level": any `@elseif`/`@else`/`@endif`/`@endmacro`
/// encountered with no matching opener is an error.
fn parse_block(
    state: &ParseState,
    idx: &mut usize,
    terminators: Option<&[&str]>,
) -> Result<Vec<Instruction>, ParseError> {
    let mut out = Vec::new();
    while *idx < state.lines.len() {
        let line_no = (*idx + 1) as u32;
        let raw = state.lines[*idx];
        let trimmed = raw.trim_start();

        let Some(directive) = trimmed.strip_prefix('@') else {
            out.extend(parse_text_line(state, *idx, line_no));
            *idx += 1;
            continue;
        };

        let (keyword, rest) = split_keyword(directive);

        if let Some(terms) = terminators {
            if terms.contains(&keyword.as_str()) {
                return Ok(out);
            }
        }

        match keyword.as_str() {
            "set" => {
                out.push(parse_set(rest, line_no)?);
                *idx += 1;
            }
            "include" => {
                out.push(Instruction::Include {
                    value: rest.trim().to_string(),
                    line: line_no,
                });
                *idx += 1;
            }
            "error" => {
                out.push(Instruction::Error {
                    value: rest.trim().to_string(),
                    line: line_no,
                });
                *idx += 1;
            }
            "if" => {
                let test = rest.trim().to_string();
                *idx += 1;
                out.push(parse_conditional(state, idx, test, line_no)?);
            }
            "macro" => {
                let declaration = rest.trim().to_string();
                *idx += 1;
                out.push(parse_macro(state, idx, declaration, line_no)?);
            }
            "elseif" | "else" | "endif" | "endmacro" => {
                return Err(ParseError::UnexpectedDirective {
                    directive: keyword,
                    line: line_no,
                });
            }
            other => {
                return Err(ParseError::UnknownDirective {
                    directive: other.to_string(),
                    line: line_no,
                });
            }
        }
    }
    Ok(out)
}

fn parse_conditional(
    state: &ParseState,
    idx: &mut usize,
    test: String,
    line: u32,
) -> Result<Instruction, ParseError> {
    let consequent = parse_block(state, idx, Some(&["elseif", "else", "endif"]))?;
    let mut elseifs: Vec<ConditionalBranch> = Vec::new();
    let mut alternate: Option<Vec<Instruction>> = None;

    loop {
        if *idx >= state.lines.len() {
            return Err(ParseError::UnterminatedBlock { line });
        }
        let branch_line = (*idx + 1) as u32;
        let raw = state.lines[*idx];
        let directive = raw.trim_start().strip_prefix('@').unwrap_or("");
        let (keyword, rest) = split_keyword(directive);

        match keyword.as_str() {
            "elseif" => {
                *idx += 1;
                let body = parse_block(state, idx, Some(&["elseif", "else", "endif"]))?;
                elseifs.push(ConditionalBranch {
                    test: rest.trim().to_string(),
                    consequent: body,
                    line: branch_line,
                });
            }
            "else" => {
                *idx += 1;
                let body = parse_block(state, idx, Some(&["endif"]))?;
                alternate = Some(body);
            }
            "endif" => {
                *idx += 1;
                break;
            }
            _ => return Err(ParseError::UnterminatedBlock { line }),
        }
    }

    Ok(Instruction::Conditional {
        test,
        consequent,
        elseifs,
        alternate,
        line,
    })
}

fn parse_macro(
    state: &ParseState,
    idx: &mut usize,
    declaration: String,
    line: u32,
) -> Result<Instruction, ParseError> {
    let body = parse_block(state, idx, Some(&["endmacro"]))?;
    if *idx >= state.lines.len() {
        return Err(ParseError::UnterminatedBlock { line });
    }
    *idx += 1; // consume @endmacro
    Ok(Instruction::Macro {
        declaration,
        body,
        line,
    })
}

fn parse_set(rest: &str, line: u32) -> Result<Instruction, ParseError> {
    let (name, value) = rest.split_once('=').ok_or(ParseError::InvalidSet { line })?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ParseError::InvalidSet { line });
    }
    Ok(Instruction::Set {
        variable: name.to_string(),
        value: value.trim().to_string(),
        line,
    })
}

/// Splits a text line on `{{ EXPR }}` interpolations into alternating
/// literal (`computed: true`) and expression (`computed: false`) output
/// instructions, all carrying the line's line number.
fn parse_text_line(state: &ParseState, i: usize, line: u32) -> Vec<Instruction> {
    let raw = state.lines[i];
    let suffix = state.line_suffix(i);
    let mut out = Vec::new();
    let mut rest = raw;
    loop {
        match rest.find("{{") {
            None => {
                if !rest.is_empty() || out.is_empty() {
                    out.push(Instruction::Output {
                        value: format!("{}{}", rest, suffix),
                        computed: true,
                        line,
                    });
                } else if let Some(Instruction::Output { value, computed: true, .. }) =
                    out.last_mut()
                {
                    value.push_str(suffix);
                }
                break;
            }
            Some(open) => {
                let before = &rest[..open];
                if !before.is_empty() {
                    out.push(Instruction::Output {
                        value: before.to_string(),
                        computed: true,
                        line,
                    });
                }
                let after_open = &rest[open + 2..];
                match after_open.find("}}") {
                    None => {
                        // Unterminated interpolation: treat the rest of
                        // the line as literal text, including the `{{`.
                        out.push(Instruction::Output {
                            value: format!("{{{{{}{}", after_open, suffix),
                            computed: true,
                            line,
                        });
                        break;
                    }
                    Some(close) => {
                        let expr = after_open[..close].trim().to_string();
                        out.push(Instruction::Output {
                            value: expr,
                            computed: false,
                            line,
                        });
                        rest = &after_open[close + 2..];
                    }
                }
            }
        }
    }
    out
}
