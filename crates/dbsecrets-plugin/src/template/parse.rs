//! Parser for the username template language.
//!
//! The accepted grammar is a subset of Go's `text/template`:
//!
//! ```text
//! template  := (text | "{{" ["- "] action [" -"] "}}")*
//! action    := "/*" comment "*/" | pipeline
//! pipeline  := command ("|" command)*
//! command   := operand operand*
//! operand   := IDENT | FIELD | STRING | RAWSTRING | INT | "(" pipeline ")"
//! ```

use super::funcs::Builtin;

/// Parsed template node
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Text(String),
    Action(Pipeline),
}

/// Commands chained with `|`
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Pipeline {
    pub(crate) commands: Vec<Command>,
}

/// One command: a function and its arguments, or a single value
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Command {
    pub(crate) operands: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    Function(Builtin),
    Field(Field),
    Str(String),
    Int(i64),
    Pipeline(Pipeline),
}

/// Metadata fields reachable from a template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Field {
    DisplayName,
    RoleName,
}

impl Field {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "DisplayName" => Some(Self::DisplayName),
            "RoleName" => Some(Self::RoleName),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Field(String),
    Str(String),
    Int(i64),
    Dot,
    Pipe,
    LParen,
    RParen,
}

/// Parse a template source into nodes
pub(crate) fn parse(source: &str) -> Result<Vec<Node>, String> {
    let mut nodes = Vec::new();
    let mut rest = source;
    let mut trim_next_text = false;

    loop {
        let Some(open) = rest.find("{{") else {
            push_text(&mut nodes, rest, trim_next_text, false);
            break;
        };

        let after_open = &rest[open + 2..];
        let trim_left = starts_with_trim_marker(after_open);
        let body_start = if trim_left { &after_open[1..] } else { after_open };

        let close = find_action_end(body_start)?;
        let mut body = &body_start[..close];
        let trim_right = ends_with_trim_marker(body);
        if trim_right {
            body = &body[..body.len() - 1];
        }

        push_text(&mut nodes, &rest[..open], trim_next_text, trim_left);
        trim_next_text = trim_right;
        rest = &body_start[close + 2..];

        let body = body.trim();
        if body.starts_with("/*") {
            if !body.ends_with("*/") || body.len() < 4 {
                return Err("unclosed comment".to_string());
            }
            continue;
        }
        if body.is_empty() {
            return Err("missing value for command".to_string());
        }

        let tokens = lex(body)?;
        let mut parser = Parser { tokens, pos: 0 };
        let pipeline = parser.pipeline()?;
        if let Some(token) = parser.peek() {
            return Err(format!("unexpected {} in action", describe(token)));
        }
        nodes.push(Node::Action(pipeline));
    }

    Ok(nodes)
}

fn push_text(nodes: &mut Vec<Node>, text: &str, trim_start: bool, trim_end: bool) {
    let mut text = text;
    if trim_start {
        text = text.trim_start();
    }
    if trim_end {
        text = text.trim_end();
    }
    if !text.is_empty() {
        nodes.push(Node::Text(text.to_string()));
    }
}

fn starts_with_trim_marker(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next() == Some('-') && chars.next().is_some_and(char::is_whitespace)
}

fn ends_with_trim_marker(s: &str) -> bool {
    let mut chars = s.chars().rev();
    chars.next() == Some('-') && chars.next().is_some_and(char::is_whitespace)
}

/// Byte offset of the closing `}}`, ignoring braces inside string literals
fn find_action_end(body: &str) -> Result<usize, String> {
    let mut chars = body.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        match ch {
            '"' => loop {
                match chars.next() {
                    Some((_, '\\')) => {
                        chars.next();
                    }
                    Some((_, '"')) => break,
                    Some(_) => {}
                    None => return Err("unterminated quoted string".to_string()),
                }
            },
            '`' => loop {
                match chars.next() {
                    Some((_, '`')) => break,
                    Some(_) => {}
                    None => return Err("unterminated raw quoted string".to_string()),
                }
            },
            '}' if body[idx..].starts_with("}}") => return Ok(idx),
            _ => {}
        }
    }
    Err("unclosed action".to_string())
}

fn lex(body: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' => {
                let (value, next) = lex_quoted(&chars, i + 1)?;
                tokens.push(Token::Str(value));
                i = next;
            }
            '`' => {
                let start = i + 1;
                let end = (start..chars.len())
                    .find(|&j| chars[j] == '`')
                    .ok_or_else(|| "unterminated raw quoted string".to_string())?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '.' => {
                let start = i + 1;
                let end = scan_word(&chars, start);
                if end == start {
                    tokens.push(Token::Dot);
                } else {
                    tokens.push(Token::Field(chars[start..end].iter().collect()));
                }
                i = end;
            }
            '-' | '+' | '0'..='9' => {
                let start = i;
                let mut end = i + 1;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
                if end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    return Err(format!(
                        "bad number syntax: {:?}",
                        chars[start..=end].iter().collect::<String>()
                    ));
                }
                let text: String = chars[start..end].iter().collect();
                let value = text
                    .parse::<i64>()
                    .map_err(|_| format!("bad number syntax: {text:?}"))?;
                tokens.push(Token::Int(value));
                i = end;
            }
            c if c.is_alphabetic() || c == '_' => {
                let end = scan_word(&chars, i);
                tokens.push(Token::Ident(chars[i..end].iter().collect()));
                i = end;
            }
            other => return Err(format!("unexpected {other:?} in command")),
        }
    }

    Ok(tokens)
}

fn scan_word(chars: &[char], start: usize) -> usize {
    let mut end = start;
    while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
        end += 1;
    }
    end
}

fn lex_quoted(chars: &[char], start: usize) -> Result<(String, usize), String> {
    let mut value = String::new();
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '"' => return Ok((value, i + 1)),
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| "unterminated quoted string".to_string())?;
                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '\\' => '\\',
                    '"' => '"',
                    '\'' => '\'',
                    other => return Err(format!("unknown escape sequence: \\{other}")),
                });
                i += 2;
            }
            c => {
                value.push(c);
                i += 1;
            }
        }
    }
    Err("unterminated quoted string".to_string())
}

fn describe(token: &Token) -> String {
    match token {
        Token::Ident(name) => format!("identifier {name:?}"),
        Token::Field(name) => format!("field .{name}"),
        Token::Str(s) => format!("string {s:?}"),
        Token::Int(n) => format!("number {n}"),
        Token::Dot => "\".\"".to_string(),
        Token::Pipe => "\"|\"".to_string(),
        Token::LParen => "\"(\"".to_string(),
        Token::RParen => "\")\"".to_string(),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn pipeline(&mut self) -> Result<Pipeline, String> {
        let mut commands = vec![self.command()?];
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            commands.push(self.command()?);
        }
        Ok(Pipeline { commands })
    }

    fn command(&mut self) -> Result<Command, String> {
        let mut operands = Vec::new();
        while let Some(token) = self.peek() {
            if matches!(token, Token::Pipe | Token::RParen) {
                break;
            }
            operands.push(self.operand()?);
        }

        match operands.first() {
            None => Err("missing value for command".to_string()),
            Some(Operand::Function(_)) => Ok(Command { operands }),
            Some(_) if operands.len() > 1 => {
                Err("can't give argument to non-function".to_string())
            }
            Some(_) => Ok(Command { operands }),
        }
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Ident(name)) => Builtin::from_name(&name)
                .map(Operand::Function)
                .ok_or_else(|| format!("function {name:?} not defined")),
            Some(Token::Field(name)) => Field::from_name(&name)
                .map(Operand::Field)
                .ok_or_else(|| format!("can't evaluate field {name}")),
            Some(Token::Str(s)) => Ok(Operand::Str(s)),
            Some(Token::Int(n)) => Ok(Operand::Int(n)),
            Some(Token::LParen) => {
                let inner = self.pipeline()?;
                match self.next() {
                    Some(Token::RParen) => Ok(Operand::Pipeline(inner)),
                    _ => Err("unclosed left paren".to_string()),
                }
            }
            Some(Token::Dot) => Err("can't render \".\" directly".to_string()),
            Some(token) => Err(format!("unexpected {} in operand", describe(&token))),
            None => Err("missing value for command".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_only() {
        assert_eq!(parse("plain").unwrap(), vec![Node::Text("plain".into())]);
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn test_pipeline_structure() {
        let nodes = parse("{{ .DisplayName | truncate 8 }}").unwrap();
        let Node::Action(pipeline) = &nodes[0] else {
            panic!("expected action");
        };
        assert_eq!(pipeline.commands.len(), 2);
        assert_eq!(
            pipeline.commands[0].operands,
            vec![Operand::Field(Field::DisplayName)]
        );
        assert_eq!(
            pipeline.commands[1].operands,
            vec![Operand::Function(Builtin::Truncate), Operand::Int(8)]
        );
    }

    #[test]
    fn test_trim_markers() {
        let nodes = parse("a  {{- \"b\" -}}  c").unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0], Node::Text("a".into()));
        assert_eq!(nodes[2], Node::Text("c".into()));
    }

    #[test]
    fn test_negative_number_is_not_trim() {
        let nodes = parse("{{-3}}").unwrap();
        let Node::Action(pipeline) = &nodes[0] else {
            panic!("expected action");
        };
        assert_eq!(pipeline.commands[0].operands, vec![Operand::Int(-3)]);
    }

    #[test]
    fn test_braces_inside_string_literal() {
        let nodes = parse("{{ \"}}\" }}x").unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1], Node::Text("x".into()));
    }

    #[test]
    fn test_comment_is_skipped() {
        assert_eq!(
            parse("a{{/* note */}}b").unwrap(),
            vec![Node::Text("a".into()), Node::Text("b".into())]
        );
    }

    #[test]
    fn test_errors() {
        assert!(parse("{{ foo }}").unwrap_err().contains("function \"foo\" not defined"));
        assert!(parse("{{ .Other }}").unwrap_err().contains("can't evaluate field"));
        assert!(parse("{{ .DisplayName").unwrap_err().contains("unclosed action"));
        assert!(parse("{{ }}").unwrap_err().contains("missing value"));
        assert!(parse("{{ (uuid }}").unwrap_err().contains("unclosed left paren"));
        assert!(parse("{{ \"a\" \"b\" }}").unwrap_err().contains("non-function"));
        assert!(parse("{{ 12ab }}").unwrap_err().contains("bad number"));
    }
}
