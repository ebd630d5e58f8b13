//! Search query strings.
//!
//! Parses the bleve-style query syntax accepted by the search API and
//! compiles it into an SQLite FTS5 `MATCH` expression.
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `word` | optional term (required when no `+` clause is present) |
//! | `+word` | required term |
//! | `-word` | excluded term |
//! | `field:word` | term restricted to one field |
//! | `"two words"` | phrase |
//! | `pre*` | prefix |
//! | `word^2`, `word~1` | accepted, boost and fuzziness ignored |

use std::fmt::Write;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("query must not be empty")]
    Empty,
    #[error("unknown field '{0}' in query")]
    UnknownField(String),
    #[error("unterminated quote in query")]
    UnterminatedQuote,
    #[error("query has no positive terms")]
    OnlyExclusions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occur {
    Must,
    Should,
    MustNot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Word(String),
    Phrase(String),
    Prefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub occur: Occur,
    pub field: Option<String>,
    pub term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    pub clauses: Vec<Clause>,
}

impl Query {
    pub fn parse(input: &str) -> Result<Self, QueryError> {
        let mut clauses = Vec::new();
        for token in tokenize(input)? {
            if let Some(clause) = parse_clause(&token) {
                clauses.push(clause);
            }
        }
        if clauses.is_empty() {
            return Err(QueryError::Empty);
        }
        Ok(Self { clauses })
    }

    /// Compiles to FTS5, requiring `type_name` in the `type` column.
    ///
    /// `fields` lists the columns a clause may name. Required clauses are
    /// AND-ed; optional clauses only match when there are no required ones.
    pub fn to_fts(&self, type_name: &str, fields: &[&str]) -> Result<String, QueryError> {
        for clause in &self.clauses {
            if let Some(field) = &clause.field {
                if field != "type" && !fields.contains(&field.as_str()) {
                    return Err(QueryError::UnknownField(field.clone()));
                }
            }
        }

        let must: Vec<String> = self.rendered(Occur::Must);
        let should: Vec<String> = self.rendered(Occur::Should);
        let must_not: Vec<String> = self.rendered(Occur::MustNot);

        let positive = if !must.is_empty() {
            must.join(" AND ")
        } else if !should.is_empty() {
            should.join(" OR ")
        } else {
            return Err(QueryError::OnlyExclusions);
        };

        let mut expr = format!("(type : {}) AND ({})", quote(type_name), positive);
        for neg in must_not {
            expr = format!("({}) NOT {}", expr, neg);
        }
        Ok(expr)
    }

    fn rendered(&self, occur: Occur) -> Vec<String> {
        self.clauses
            .iter()
            .filter(|c| c.occur == occur)
            .map(render_clause)
            .collect()
    }
}

fn render_clause(clause: &Clause) -> String {
    let mut out = String::new();
    if let Some(field) = &clause.field {
        let _ = write!(out, "{} : ", field);
    }
    match &clause.term {
        Term::Word(w) | Term::Phrase(w) => out.push_str(&quote(w)),
        Term::Prefix(p) => {
            let _ = write!(out, "{} *", quote(p));
        }
    }
    format!("({})", out)
}

/// FTS5 string literal.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Splits on whitespace, keeping quoted sections together.
fn tokenize(input: &str) -> Result<Vec<String>, QueryError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(QueryError::UnterminatedQuote);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn parse_clause(token: &str) -> Option<Clause> {
    let (occur, rest) = match token.chars().next() {
        Some('+') => (Occur::Must, &token[1..]),
        Some('-') => (Occur::MustNot, &token[1..]),
        _ => (Occur::Should, token),
    };

    let (field, rest) = match rest.split_once(':') {
        Some((f, r)) if !f.is_empty() && !f.contains('"') => (Some(f.to_string()), r),
        _ => (None, rest),
    };

    let term = if let Some(inner) = rest.strip_prefix('"') {
        let end = inner.rfind('"')?;
        let phrase = inner[..end].trim();
        if phrase.is_empty() {
            return None;
        }
        Term::Phrase(phrase.to_string())
    } else {
        let word = strip_modifiers(rest);
        if let Some(prefix) = word.strip_suffix('*') {
            if prefix.is_empty() {
                return None;
            }
            Term::Prefix(prefix.to_string())
        } else if word.is_empty() {
            return None;
        } else {
            Term::Word(word.to_string())
        }
    };

    Some(Clause { occur, field, term })
}

/// Drops a trailing `^boost` or `~fuzziness`.
fn strip_modifiers(word: &str) -> &str {
    match word.rfind(|c| c == '^' || c == '~') {
        Some(i) if word[i + 1..].chars().all(|c| c.is_ascii_digit() || c == '.') => &word[..i],
        _ => word,
    }
}
