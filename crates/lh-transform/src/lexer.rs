// Tokenizer for the transform expression language.

use crate::TransformError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Colon,
    Question,
    Dot,
    Amp,
    Plus,
    Minus,
    Star,
    Slash,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Str(String),
    Num(f64),
    /// A bare identifier — the head or a step of a field path, or a keyword.
    Ident(String),
    /// `$name` — a builtin function reference.
    Func(String),
    True,
    False,
    Null,
}

/// Tokenize an expression source string.
pub fn tokenize(source: &str) -> Result<Vec<Token>, TransformError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '&' => {
                tokens.push(Token::Amp);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(TransformError::Lex {
                        pos: i,
                        msg: "expected `!=`".to_owned(),
                    });
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '"' | '\'' => {
                let (s, next) = lex_string(source, i, c)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            '$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && is_ident_char(bytes[end] as char) {
                    end += 1;
                }
                if end == start {
                    return Err(TransformError::Lex {
                        pos: i,
                        msg: "expected function name after `$`".to_owned(),
                    });
                }
                tokens.push(Token::Func(source[start..end].to_owned()));
                i = end;
            }
            c if c.is_ascii_digit() => {
                let (n, next) = lex_number(source, i)?;
                tokens.push(Token::Num(n));
                i = next;
            }
            c if is_ident_start(c) => {
                let start = i;
                let mut end = i;
                while end < bytes.len() && is_ident_char(bytes[end] as char) {
                    end += 1;
                }
                let word = &source[start..end];
                tokens.push(match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word.to_owned()),
                });
                i = end;
            }
            other => {
                return Err(TransformError::Lex {
                    pos: i,
                    msg: format!("unexpected character `{other}`"),
                });
            }
        }
    }

    Ok(tokens)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn lex_string(source: &str, start: usize, quote: char) -> Result<(String, usize), TransformError> {
    let mut out = String::new();
    let mut chars = source[start + 1..].char_indices();
    while let Some((offset, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, escaped)) => out.push(escaped),
                None => {
                    return Err(TransformError::Lex {
                        pos: start,
                        msg: "unterminated escape".to_owned(),
                    });
                }
            },
            c if c == quote => return Ok((out, start + 1 + offset + c.len_utf8())),
            c => out.push(c),
        }
    }
    Err(TransformError::Lex {
        pos: start,
        msg: "unterminated string".to_owned(),
    })
}

fn lex_number(source: &str, start: usize) -> Result<(f64, usize), TransformError> {
    let bytes = source.as_bytes();
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    // A decimal point only counts when followed by a digit; otherwise it is
    // a path separator (e.g. `1.x` never occurs, but `}` or EOF may follow).
    if end < bytes.len()
        && bytes[end] == b'.'
        && end + 1 < bytes.len()
        && bytes[end + 1].is_ascii_digit()
    {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    source[start..end]
        .parse::<f64>()
        .map(|n| (n, end))
        .map_err(|e| TransformError::Lex {
            pos: start,
            msg: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_an_object_constructor() {
        let tokens = tokenize(r#"{"publisher": "github", "id": pull_request.id}"#).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::LBrace,
                Token::Str("publisher".to_owned()),
                Token::Colon,
                Token::Str("github".to_owned()),
                Token::Comma,
                Token::Str("id".to_owned()),
                Token::Colon,
                Token::Ident("pull_request".to_owned()),
                Token::Dot,
                Token::Ident("id".to_owned()),
                Token::RBrace,
            ]
        );
    }

    #[test]
    fn tokenizes_conditionals_and_comparisons() {
        let tokens = tokenize(r#"action = "opened" ? "created" : "updated""#).unwrap();
        assert!(tokens.contains(&Token::Question));
        assert!(tokens.contains(&Token::Eq));
        assert!(tokens.contains(&Token::Colon));
    }

    #[test]
    fn tokenizes_numbers_and_functions() {
        let tokens = tokenize("$fromEpoch(created) + 1.5").unwrap();
        assert_eq!(tokens[0], Token::Func("fromEpoch".to_owned()));
        assert_eq!(tokens.last(), Some(&Token::Num(1.5)));
    }

    #[test]
    fn string_escapes() {
        let tokens = tokenize(r#""a\"b""#).unwrap();
        assert_eq!(tokens, vec![Token::Str("a\"b".to_owned())]);
    }

    #[test]
    fn rejects_unterminated_strings() {
        assert!(matches!(
            tokenize(r#""abc"#),
            Err(TransformError::Lex { .. })
        ));
    }
}
