//! Session-scoped connection filtering by tags.
//!
//! Four modes: pass-through, simple OR over a tag list, a boolean tag
//! expression (`AND`/`OR`/`NOT`/parentheses), and named presets resolving to
//! a tag list. Matching is case-insensitive throughout. A malformed
//! expression or unknown preset fails open: all connections stay visible and
//! the problem is logged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

use crate::config::{SessionConfig, TagFilterMode};
use crate::connection::OutboundConnection;

/// Decides which outbound connections a session may see.
pub struct FilteringService {
    presets: HashMap<String, Vec<String>>,
}

impl FilteringService {
    pub fn new(presets: HashMap<String, Vec<String>>) -> Self {
        Self { presets }
    }

    /// Apply the session's tag filter to the given connections.
    pub fn filtered_connections(
        &self,
        connections: Vec<Arc<OutboundConnection>>,
        session: &SessionConfig,
    ) -> Vec<Arc<OutboundConnection>> {
        match session.tag_filter_mode {
            TagFilterMode::None => {
                if let Some(preset_name) = &session.preset_name {
                    self.apply_preset(connections, preset_name)
                } else {
                    connections
                }
            }
            TagFilterMode::SimpleOr => {
                let wanted = normalize(session.tags.as_deref().unwrap_or(&[]));
                connections
                    .into_iter()
                    .filter(|c| intersects(&wanted, c.tags()))
                    .collect()
            }
            TagFilterMode::Advanced => {
                let Some(expression) = session.tag_expression.as_deref() else {
                    warn!("advanced tag filter selected without an expression; passing all");
                    return connections;
                };
                match TagExpr::parse(expression) {
                    Ok(expr) => connections
                        .into_iter()
                        .filter(|c| expr.evaluate(&tag_set(c.tags())))
                        .collect(),
                    Err(e) => {
                        warn!(expression, "tag expression parse error, passing all: {e}");
                        connections
                    }
                }
            }
            TagFilterMode::Preset => {
                let Some(preset_name) = &session.preset_name else {
                    warn!("preset tag filter selected without a preset name; passing all");
                    return connections;
                };
                self.apply_preset(connections, preset_name)
            }
        }
    }

    fn apply_preset(
        &self,
        connections: Vec<Arc<OutboundConnection>>,
        preset_name: &str,
    ) -> Vec<Arc<OutboundConnection>> {
        match self.presets.get(preset_name) {
            Some(tags) => {
                let wanted = normalize(tags);
                connections
                    .into_iter()
                    .filter(|c| intersects(&wanted, c.tags()))
                    .collect()
            }
            None => {
                warn!(preset_name, "unknown preset, passing all connections");
                connections
            }
        }
    }
}

fn normalize(tags: &[String]) -> HashSet<String> {
    tags.iter().map(|t| t.to_lowercase()).collect()
}

fn tag_set(tags: &[String]) -> HashSet<String> {
    normalize(tags)
}

fn intersects(wanted: &HashSet<String>, tags: &[String]) -> bool {
    tags.iter().any(|t| wanted.contains(&t.to_lowercase()))
}

/// Parsed boolean tag expression.
///
/// Grammar: `expr := term ('OR' term)*`, `term := factor ('AND' factor)*`,
/// `factor := 'NOT'? (IDENT | '(' expr ')')`.
#[derive(Debug, Clone, PartialEq)]
pub enum TagExpr {
    Tag(String),
    Not(Box<TagExpr>),
    And(Box<TagExpr>, Box<TagExpr>),
    Or(Box<TagExpr>, Box<TagExpr>),
}

impl TagExpr {
    pub fn parse(input: &str) -> Result<Self, String> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(format!(
                "unexpected trailing input at token {}",
                parser.pos
            ));
        }
        Ok(expr)
    }

    /// Evaluate against a lowercase tag set.
    pub fn evaluate(&self, tags: &HashSet<String>) -> bool {
        match self {
            TagExpr::Tag(tag) => tags.contains(tag),
            TagExpr::Not(inner) => !inner.evaluate(tags),
            TagExpr::And(lhs, rhs) => lhs.evaluate(tags) && rhs.evaluate(tags),
            TagExpr::Or(lhs, rhs) => lhs.evaluate(tags) || rhs.evaluate(tags),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.to_uppercase().as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    "NOT" => tokens.push(Token::Not),
                    _ => tokens.push(Token::Ident(word.to_lowercase())),
                }
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<TagExpr, String> {
        let mut lhs = self.term()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.term()?;
            lhs = TagExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<TagExpr, String> {
        let mut lhs = self.factor()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.factor()?;
            lhs = TagExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<TagExpr, String> {
        match self.advance() {
            Some(Token::Not) => Ok(TagExpr::Not(Box::new(self.factor()?))),
            Some(Token::Ident(name)) => Ok(TagExpr::Tag(name)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            other => Err(format!("expected identifier, NOT or '(', got {other:?}")),
        }
    }
}
