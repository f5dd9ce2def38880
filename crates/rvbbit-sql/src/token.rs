//! SQL tokenizer for the rewrite layer.
//!
//! Tokenization is lossless: every byte of the input lands in exactly one
//! token, so re-rendering an unmodified token stream reproduces the input.
//! Strings and comments are opaque single tokens, which is what keeps
//! semantic operators from matching inside literals.

/// Token classes the rewriter distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Unquoted identifier or keyword.
    Word,
    /// `'...'` string literal (raw text includes the quotes).
    Str,
    /// `"..."` quoted identifier.
    QuotedIdent,
    Number,
    /// `--` line comment or `/* */` block comment, raw.
    Comment,
    Whitespace,
    /// Operator or punctuation (`::`, `<=`, `~`, `(`, `,`, ...).
    Symbol,
    /// `$1`-style parameter placeholder.
    Param,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    /// Case-insensitive keyword comparison (words only).
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_symbol(&self, symbol: &str) -> bool {
        self.kind == TokenKind::Symbol && self.text == symbol
    }

    /// Significant tokens participate in pattern matching; whitespace and
    /// comments do not.
    pub fn is_significant(&self) -> bool {
        !matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }
}

/// Tokenize a SQL string. Never fails: unterminated strings/comments extend
/// to the end of input as a single token.
pub fn tokenize(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;

        // Whitespace run
        if c.is_ascii_whitespace() {
            let start = i;
            while i < bytes.len() && (bytes[i] as char).is_ascii_whitespace() {
                i += 1;
            }
            tokens.push(Token::new(TokenKind::Whitespace, &sql[start..i]));
            continue;
        }

        // Line comment
        if c == '-' && bytes.get(i + 1) == Some(&b'-') {
            let start = i;
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            tokens.push(Token::new(TokenKind::Comment, &sql[start..i]));
            continue;
        }

        // Block comment
        if c == '/' && bytes.get(i + 1) == Some(&b'*') {
            let start = i;
            i += 2;
            while i < bytes.len() {
                if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    i += 2;
                    break;
                }
                i += 1;
            }
            tokens.push(Token::new(TokenKind::Comment, &sql[start..i]));
            continue;
        }

        // String literal with '' escaping
        if c == '\'' {
            let start = i;
            i += 1;
            while i < bytes.len() {
                if bytes[i] == b'\'' {
                    if bytes.get(i + 1) == Some(&b'\'') {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            tokens.push(Token::new(TokenKind::Str, &sql[start..i]));
            continue;
        }

        // Quoted identifier
        if c == '"' {
            let start = i;
            i += 1;
            while i < bytes.len() {
                if bytes[i] == b'"' {
                    i += 1;
                    break;
                }
                i += 1;
            }
            tokens.push(Token::new(TokenKind::QuotedIdent, &sql[start..i]));
            continue;
        }

        // Parameter placeholder
        if c == '$' && bytes.get(i + 1).map(|b| b.is_ascii_digit()).unwrap_or(false) {
            let start = i;
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            tokens.push(Token::new(TokenKind::Param, &sql[start..i]));
            continue;
        }

        // Word
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() {
                let b = bytes[i] as char;
                if b.is_ascii_alphanumeric() || b == '_' {
                    i += 1;
                } else {
                    break;
                }
            }
            tokens.push(Token::new(TokenKind::Word, &sql[start..i]));
            continue;
        }

        // Number
        if c.is_ascii_digit() {
            let start = i;
            let mut seen_dot = false;
            while i < bytes.len() {
                let b = bytes[i] as char;
                if b.is_ascii_digit() {
                    i += 1;
                } else if b == '.' && !seen_dot {
                    seen_dot = true;
                    i += 1;
                } else {
                    break;
                }
            }
            tokens.push(Token::new(TokenKind::Number, &sql[start..i]));
            continue;
        }

        // Multi-char symbols, longest first
        let rest = &sql[i..];
        let two = rest.get(..2).unwrap_or("");
        if matches!(two, "::" | "<=" | ">=" | "<>" | "!=" | "||") {
            tokens.push(Token::new(TokenKind::Symbol, two));
            i += 2;
            continue;
        }

        // Single-char symbol (covers `~`, parens, commas, everything else)
        let ch_len = c.len_utf8();
        tokens.push(Token::new(TokenKind::Symbol, &sql[i..i + ch_len]));
        i += ch_len;
    }

    tokens
}

/// Re-render a token stream.
pub fn render(tokens: &[Token]) -> String {
    tokens.iter().map(|t| t.text.as_str()).collect()
}

/// Parse `-- @ key: value` annotations out of the comment tokens.
pub fn comment_hints(tokens: &[Token]) -> std::collections::HashMap<String, String> {
    let mut hints = std::collections::HashMap::new();
    for token in tokens {
        if token.kind != TokenKind::Comment {
            continue;
        }
        let body = token
            .text
            .trim_start_matches("--")
            .trim_start_matches("/*")
            .trim_end_matches("*/")
            .trim();
        let Some(rest) = body.strip_prefix('@') else {
            continue;
        };
        if let Some((key, value)) = rest.split_once(':') {
            hints.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    hints
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_lossless() {
        let sql = "SELECT a, 'it''s' AS s -- trailing\nFROM t /* block */ WHERE x >= 1.5";
        assert_eq!(render(&tokenize(sql)), sql);
    }

    #[test]
    fn strings_are_single_opaque_tokens() {
        let tokens = tokenize("SELECT 'a MEANS b' FROM t");
        let strings: Vec<&Token> = tokens.iter().filter(|t| t.kind == TokenKind::Str).collect();
        assert_eq!(strings.len(), 1);
        assert_eq!(strings[0].text, "'a MEANS b'");
        // MEANS never appears as a word token.
        assert!(!tokens.iter().any(|t| t.is_keyword("MEANS")));
    }

    #[test]
    fn comments_are_opaque() {
        let tokens = tokenize("SELECT x -- col MEANS 'y'\nFROM t");
        assert!(!tokens.iter().any(|t| t.is_keyword("MEANS")));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Comment));
    }

    #[test]
    fn params_and_casts() {
        let tokens = tokenize("SELECT $1::int");
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Param && t.text == "$1"));
        assert!(tokens.iter().any(|t| t.is_symbol("::")));
    }

    #[test]
    fn keyword_matching_is_case_insensitive() {
        let tokens = tokenize("select X means 'y'");
        assert!(tokens.iter().any(|t| t.is_keyword("MEANS")));
    }

    #[test]
    fn hints_parse_from_annotations() {
        let tokens = tokenize("-- @ parallel: 5\n-- @ model: gpt-4o\nSELECT 1");
        let hints = comment_hints(&tokens);
        assert_eq!(hints.get("parallel").map(String::as_str), Some("5"));
        assert_eq!(hints.get("model").map(String::as_str), Some("gpt-4o"));
    }

    #[test]
    fn dollar_without_digit_is_symbol() {
        let tokens = tokenize("SELECT $tag$");
        assert!(tokens
            .iter()
            .any(|t| t.kind == TokenKind::Symbol && t.text == "$"));
    }
}
