use thiserror::Error;

use crate::models::DataSourceType;

/// Statement kinds accepted from the query editor
const ALLOWED_STATEMENT_PREFIXES: &[&str] = &["SELECT", "WITH", "SHOW", "DESCRIBE", "EXPLAIN", "ANALYZE"];

/// Keywords rejected anywhere in the analysed text, even inside subqueries
const DANGEROUS_KEYWORDS: &[&str] = &[
    "DROP", "TRUNCATE", "DELETE", "UPDATE", "INSERT", "ALTER", "CREATE", "GRANT", "REVOKE",
];

/// Longest identifier accepted for schema/table arguments
const MAX_IDENTIFIER_LEN: usize = 128;

/// The specific safety rule a piece of query text violated
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryViolation {
    #[error("Query cannot be empty")]
    Empty,

    #[error("Only a single query statement is allowed (found {0})")]
    MultipleStatements(usize),

    #[error("{0} statement type is not allowed in query editor")]
    ForbiddenStatement(String),

    #[error("{0} operations are not allowed in query editor")]
    ForbiddenKeyword(String),

    #[error("Invalid identifier '{0}': only letters, digits and underscore are allowed")]
    InvalidIdentifier(String),

    #[error("Unsupported document query: {0}")]
    UnsupportedDocumentQuery(String),
}

impl QueryViolation {
    /// Short name of the rule, reported alongside the message
    pub fn rule(&self) -> &'static str {
        match self {
            QueryViolation::Empty => "empty",
            QueryViolation::MultipleStatements(_) => "multi-statement",
            QueryViolation::ForbiddenStatement(_) => "forbidden-statement",
            QueryViolation::ForbiddenKeyword(_) => "forbidden-keyword",
            QueryViolation::InvalidIdentifier(_) => "invalid-identifier",
            QueryViolation::UnsupportedDocumentQuery(_) => "document-query",
        }
    }
}

/// Lexical conventions used when blanking comments and literals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// `--` and `/* */` comments, `$tag$` bodies; backslash escapes only in `E'...'`
    PostgreSql,
    /// `#`, `-- ` and `/* */` comments; `/*! ... */` bodies are executed
    MySql,
    /// Document shorthand: quoted strings with backslash escapes
    Document,
}

impl From<DataSourceType> for SqlDialect {
    fn from(engine: DataSourceType) -> Self {
        match engine {
            DataSourceType::PostgreSQL => SqlDialect::PostgreSql,
            DataSourceType::MySQL => SqlDialect::MySql,
            DataSourceType::MongoDB => SqlDialect::Document,
        }
    }
}

/// Keyword-based statement-safety checks for user supplied query text.
///
/// This is deliberately not a SQL parser: the text is reduced to an
/// analysis-only view (comments and quoted literals blanked out) and checked
/// against a statement allowlist and a keyword denylist. The analysed view is
/// never executed; callers always run the original text.
///
/// Whenever the lexing is unsure, text stays visible: a stray keyword or
/// semicolon only causes a rejection, a wrongly blanked one would not.
pub struct SqlValidator;

impl SqlValidator {
    /// Full pipeline for relational engines: single, read-only, non-destructive statement
    pub fn validate_read_only(sql: &str, dialect: SqlDialect) -> Result<(), QueryViolation> {
        let statement = Self::single_statement(sql, dialect)?;

        let first_token: String = statement
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_ascii_uppercase();

        if first_token.is_empty() || !ALLOWED_STATEMENT_PREFIXES.contains(&first_token.as_str()) {
            let shown = if first_token.is_empty() {
                statement
                    .split_whitespace()
                    .next()
                    .unwrap_or("This")
                    .to_string()
            } else {
                first_token
            };
            return Err(QueryViolation::ForbiddenStatement(shown));
        }

        Self::check_denylist(&statement)
    }

    /// Pipeline for document-store shorthand: everything except the SQL
    /// statement-kind check, which the shorthand parser replaces
    pub fn validate_document_text(text: &str) -> Result<(), QueryViolation> {
        let statement = Self::single_statement(text, SqlDialect::Document)?;
        Self::check_denylist(&statement)
    }

    /// Identifiers interpolated into engine-native quoting must be plain words
    pub fn validate_identifier(identifier: &str) -> Result<(), QueryViolation> {
        let valid = !identifier.is_empty()
            && identifier.len() <= MAX_IDENTIFIER_LEN
            && identifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');

        if valid {
            Ok(())
        } else {
            Err(QueryViolation::InvalidIdentifier(identifier.to_string()))
        }
    }

    /// Blank out comments and quoted literals, keeping everything else.
    ///
    /// An unterminated literal or comment-like sequence the dialect does not
    /// treat as a comment is left in place so its contents stay visible to
    /// the checks. MySQL `/*!` comments lose only their markers.
    pub fn sanitize_for_analysis(sql: &str, dialect: SqlDialect) -> String {
        let chars: Vec<char> = sql.chars().collect();
        let mut out = String::with_capacity(sql.len());
        let mut in_executable_comment = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();

            if c == '/' && next == Some('*') {
                if dialect == SqlDialect::MySql && chars.get(i + 2) == Some(&'!') {
                    // Optional server version, then code up to the closing `*/`
                    i += 3;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                    in_executable_comment = true;
                    out.push(' ');
                    continue;
                }

                // Block comment, runs to end of text if unterminated
                let mut j = i + 2;
                while j < chars.len() && !(chars[j] == '*' && chars.get(j + 1) == Some(&'/')) {
                    j += 1;
                }
                i = (j + 2).min(chars.len());
                out.push(' ');
                continue;
            }

            if in_executable_comment && c == '*' && next == Some('/') {
                in_executable_comment = false;
                i += 2;
                out.push(' ');
                continue;
            }

            if Self::starts_line_comment(&chars, i, dialect) {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                out.push(' ');
                continue;
            }

            if let Some(end) = Self::literal_end(&chars, i, dialect) {
                i = end + 1;
                out.push(' ');
                continue;
            }

            out.push(c);
            i += 1;
        }

        out
    }

    fn starts_line_comment(chars: &[char], i: usize, dialect: SqlDialect) -> bool {
        match (chars[i], chars.get(i + 1).copied()) {
            ('#', _) => dialect == SqlDialect::MySql,
            // MySQL needs whitespace or a control character after the dashes
            ('-', Some('-')) => {
                dialect != SqlDialect::MySql
                    || chars
                        .get(i + 2)
                        .map_or(true, |c| c.is_whitespace() || c.is_control())
            }
            _ => false,
        }
    }

    /// Index of the closing quote for a literal opened at `start`, if one
    /// opens there and is terminated
    fn literal_end(chars: &[char], start: usize, dialect: SqlDialect) -> Option<usize> {
        let quote = chars[start];
        let backslash_escapes = match (dialect, quote) {
            (SqlDialect::PostgreSql, '\'') => Self::is_escape_string(chars, start),
            (SqlDialect::PostgreSql, '"') => false,
            (SqlDialect::PostgreSql, '$') => return Self::dollar_quote_end(chars, start),
            (SqlDialect::PostgreSql, _) => return None,
            (_, '\'' | '"') => true,
            (_, '`') => false,
            _ => return None,
        };

        let mut j = start + 1;
        while j < chars.len() {
            let c = chars[j];
            if c == '\\' && backslash_escapes {
                j += 2;
                continue;
            }
            if c == quote {
                if chars.get(j + 1) == Some(&quote) {
                    j += 2;
                    continue;
                }
                return Some(j);
            }
            j += 1;
        }

        None
    }

    /// `E'...'` (not the tail of a longer word) enables backslash escapes
    fn is_escape_string(chars: &[char], quote: usize) -> bool {
        quote > 0
            && matches!(chars[quote - 1], 'e' | 'E')
            && (quote < 2 || !is_word_char(chars[quote - 2]))
    }

    /// End of a `$tag$ ... $tag$` body opened at `start`
    fn dollar_quote_end(chars: &[char], start: usize) -> Option<usize> {
        if start > 0 && is_word_char(chars[start - 1]) {
            return None;
        }

        let mut j = start + 1;
        while j < chars.len() && is_word_char(chars[j]) {
            j += 1;
        }
        // `$1` is a parameter, not a tag
        if chars.get(j) != Some(&'$') || chars.get(start + 1).is_some_and(|c| c.is_ascii_digit()) {
            return None;
        }

        let tag = &chars[start..=j];
        (j + 1..=chars.len().saturating_sub(tag.len()))
            .find(|&k| chars[k..k + tag.len()] == *tag)
            .map(|k| k + tag.len() - 1)
    }

    /// Steps shared by every engine: non-empty, sanitized, exactly one statement
    fn single_statement(text: &str, dialect: SqlDialect) -> Result<String, QueryViolation> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(QueryViolation::Empty);
        }

        let sanitized = Self::sanitize_for_analysis(trimmed, dialect);
        let statements: Vec<&str> = sanitized
            .split(';')
            .map(str::trim)
            .filter(|stmt| !stmt.is_empty())
            .collect();

        match statements.len() {
            // Nothing but comments
            0 => Err(QueryViolation::Empty),
            1 => Ok(statements[0].to_string()),
            n => Err(QueryViolation::MultipleStatements(n)),
        }
    }

    fn check_denylist(statement: &str) -> Result<(), QueryViolation> {
        let found = statement
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .map(str::to_ascii_uppercase)
            .find(|token| DANGEROUS_KEYWORDS.contains(&token.as_str()));

        match found {
            Some(keyword) => Err(QueryViolation::ForbiddenKeyword(keyword)),
            None => Ok(()),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
