//! Token view of a candidate statement
//!
//! The first two guard gates work on `sqlparser` tokens rather than on the
//! AST, so stacked statements and write verbs are caught even when the text
//! would not parse. Whitespace and comments are dropped; a keyword or a `;`
//! inside a literal, quoted identifier or comment never counts.

use sqlparser::dialect::SQLiteDialect;
use sqlparser::tokenizer::{Location, Token, Tokenizer, TokenizerError};

/// A significant token with its byte span in the source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Lexeme {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

impl Lexeme {
    /// Upper-cased bare word. Quoted identifiers are never keywords.
    pub fn keyword(&self) -> Option<String> {
        match &self.token {
            Token::Word(word) if word.quote_style.is_none() => Some(word.value.to_ascii_uppercase()),
            _ => None,
        }
    }
}

pub fn tokenize(sql: &str) -> Result<Vec<Lexeme>, TokenizerError> {
    let dialect = SQLiteDialect {};
    let located = Tokenizer::new(&dialect, sql).tokenize_with_location()?;

    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect();
    let offsets: Vec<usize> = located
        .iter()
        .map(|t| byte_offset(sql, &line_starts, &t.location))
        .collect();

    // a token ends where the next one, significant or not, begins
    Ok(located
        .into_iter()
        .enumerate()
        .filter(|(_, t)| !matches!(t.token, Token::Whitespace(_) | Token::EOF))
        .map(|(i, t)| Lexeme {
            token: t.token,
            start: offsets[i],
            end: offsets.get(i + 1).copied().unwrap_or(sql.len()),
        })
        .collect())
}

/// Locations are 1-based lines and character columns.
fn byte_offset(sql: &str, line_starts: &[usize], location: &Location) -> usize {
    let line_start = match line_starts.get((location.line as usize).saturating_sub(1)) {
        Some(start) => *start,
        None => return sql.len(),
    };
    sql[line_start..]
        .char_indices()
        .nth((location.column as usize).saturating_sub(1))
        .map(|(i, _)| line_start + i)
        .unwrap_or(sql.len())
}

/// Splits on top-level `;`, dropping empty statements.
pub fn split_statements(lexemes: &[Lexeme]) -> Vec<&[Lexeme]> {
    lexemes
        .split(|l| l.token == Token::SemiColon)
        .filter(|statement| !statement.is_empty())
        .collect()
}

/// First keyword of a statement, skipping opening parentheses.
pub fn leading_keyword(statement: &[Lexeme]) -> Option<String> {
    statement
        .iter()
        .find(|l| l.token != Token::LParen)
        .and_then(Lexeme::keyword)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(sql: &str) -> Vec<String> {
        tokenize(sql)
            .unwrap()
            .iter()
            .filter_map(|t| t.keyword())
            .collect()
    }

    #[test]
    fn test_keywords_in_literals_are_not_words() {
        let w = words("SELECT title FROM projects WHERE title = 'DROP TABLE x; DELETE'");
        assert_eq!(w, vec!["SELECT", "TITLE", "FROM", "PROJECTS", "WHERE", "TITLE"]);
    }

    #[test]
    fn test_comments_skipped() {
        let w = words("SELECT 1 -- DELETE FROM projects\n/* DROP */ FROM projects");
        assert_eq!(w, vec!["SELECT", "FROM", "PROJECTS"]);
    }

    #[test]
    fn test_quoted_identifier_is_not_keyword() {
        let w = words("SELECT \"delete\" FROM projects");
        assert_eq!(w, vec!["SELECT", "FROM", "PROJECTS"]);
    }

    #[test]
    fn test_escaped_quotes() {
        let tokens = tokenize("SELECT 'it''s; fine'").unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(matches!(tokens[1].token, Token::SingleQuotedString(_)));
        assert_eq!(split_statements(&tokens).len(), 1);
    }

    #[test]
    fn test_split_statements() {
        let tokens = tokenize("SELECT 1; DROP TABLE projects;").unwrap();
        let statements = split_statements(&tokens);
        assert_eq!(statements.len(), 2);
        assert_eq!(leading_keyword(statements[1]).as_deref(), Some("DROP"));

        let tokens = tokenize("SELECT 1;  ;\n-- trailing").unwrap();
        assert_eq!(split_statements(&tokens).len(), 1);
    }

    #[test]
    fn test_leading_keyword_skips_parens() {
        let tokens = tokenize("((SELECT 1))").unwrap();
        assert_eq!(leading_keyword(&tokens).as_deref(), Some("SELECT"));
    }

    #[test]
    fn test_unterminated() {
        assert!(tokenize("SELECT 'abc").is_err());
        assert!(tokenize("SELECT \"abc").is_err());
        assert!(tokenize("SELECT 1 /* x").is_err());
    }

    #[test]
    fn test_spans_cover_source() {
        let sql = "SELECT acronym FROM projects;";
        let tokens = tokenize(sql).unwrap();
        let last = &tokens[tokens.len() - 2];
        assert_eq!(&sql[tokens[0].start..last.end], "SELECT acronym FROM projects");
    }

    #[test]
    fn test_spans_across_lines_and_multibyte_text() {
        let sql = "SELECT city\nFROM participants\nWHERE city = 'Málaga';  -- note";
        let tokens = tokenize(sql).unwrap();
        let semicolon = tokens.iter().position(|t| t.token == Token::SemiColon).unwrap();
        let last = &tokens[semicolon - 1];
        assert_eq!(
            &sql[tokens[0].start..last.end],
            "SELECT city\nFROM participants\nWHERE city = 'Málaga'"
        );
    }
}
