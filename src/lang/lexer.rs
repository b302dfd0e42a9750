//! Indentation-aware tokenizer.

use super::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

// Longest operators first so that prefix matching picks `//=` over `//`.
const OPERATORS: &[&str] = &[
    "//=", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "//", "->", "(", ")", "[", "]",
    "{", "}", ",", ":", ".", "=", "+", "-", "*", "/", "%", "<", ">",
];

pub fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut tokens = Vec::new();
    let mut indents: Vec<usize> = vec![0];
    let mut depth = 0usize;
    let mut last_line = 1;

    for (index, raw) in source.lines().enumerate() {
        let line = index as u32 + 1;
        last_line = line;
        let chars: Vec<char> = raw.chars().collect();
        let mut pos = 0;

        if depth == 0 {
            let mut width = 0;
            while pos < chars.len() && (chars[pos] == ' ' || chars[pos] == '\t') {
                width += if chars[pos] == '\t' { 8 - width % 8 } else { 1 };
                pos += 1;
            }
            if pos == chars.len() || chars[pos] == '#' {
                continue;
            }
            let current = indents.last().copied().unwrap_or(0);
            if width > current {
                indents.push(width);
                tokens.push(Token {
                    kind: TokenKind::Indent,
                    line,
                });
            } else {
                while width < indents.last().copied().unwrap_or(0) {
                    indents.pop();
                    tokens.push(Token {
                        kind: TokenKind::Dedent,
                        line,
                    });
                }
                if width != indents.last().copied().unwrap_or(0) {
                    return Err(CompileError::Lex {
                        line,
                        message: "unindent does not match any outer indentation level".into(),
                    });
                }
            }
        }

        while pos < chars.len() {
            let c = chars[pos];
            if c == ' ' || c == '\t' {
                pos += 1;
                continue;
            }
            if c == '#' {
                break;
            }
            if c.is_ascii_digit() {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '_') {
                    pos += 1;
                }
                let mut is_float = false;
                if pos + 1 < chars.len() && chars[pos] == '.' && chars[pos + 1].is_ascii_digit() {
                    is_float = true;
                    pos += 1;
                    while pos < chars.len() && chars[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
                let text: String = chars[start..pos].iter().filter(|c| **c != '_').collect();
                let kind = if is_float {
                    TokenKind::Float(text.parse().map_err(|_| CompileError::Lex {
                        line,
                        message: format!("invalid float literal {}", text),
                    })?)
                } else {
                    TokenKind::Int(text.parse().map_err(|_| CompileError::Lex {
                        line,
                        message: format!("integer literal {} out of range", text),
                    })?)
                };
                tokens.push(Token { kind, line });
                continue;
            }
            if c.is_alphabetic() || c == '_' {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                    pos += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Name(chars[start..pos].iter().collect()),
                    line,
                });
                continue;
            }
            if c == '"' || c == '\'' {
                let (text, next) = lex_string(&chars, pos, line)?;
                pos = next;
                tokens.push(Token {
                    kind: TokenKind::Str(text),
                    line,
                });
                continue;
            }

            let rest: String = chars[pos..chars.len().min(pos + 3)].iter().collect();
            let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
                return Err(CompileError::Lex {
                    line,
                    message: format!("unexpected character {:?}", c),
                });
            };
            match *op {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" | "}" => depth = depth.saturating_sub(1),
                _ => {}
            }
            pos += op.len();
            tokens.push(Token {
                kind: TokenKind::Op(op),
                line,
            });
        }

        if depth == 0 && !matches!(tokens.last().map(|t| &t.kind), Some(TokenKind::Newline) | None)
        {
            tokens.push(Token {
                kind: TokenKind::Newline,
                line,
            });
        }
    }

    if depth > 0 {
        return Err(CompileError::Lex {
            line: last_line,
            message: "unexpected end of input inside brackets".into(),
        });
    }
    if !matches!(tokens.last().map(|t| &t.kind), Some(TokenKind::Newline) | None) {
        tokens.push(Token {
            kind: TokenKind::Newline,
            line: last_line,
        });
    }
    while indents.len() > 1 {
        indents.pop();
        tokens.push(Token {
            kind: TokenKind::Dedent,
            line: last_line,
        });
    }
    tokens.push(Token {
        kind: TokenKind::Eof,
        line: last_line,
    });
    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize, line: u32) -> Result<(String, usize), CompileError> {
    let quote = chars[start];
    let mut pos = start + 1;
    let mut out = String::new();
    while pos < chars.len() {
        let c = chars[pos];
        if c == quote {
            return Ok((out, pos + 1));
        }
        if c == '\\' && pos + 1 < chars.len() {
            pos += 1;
            out.push(match chars[pos] {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                other => other,
            });
        } else {
            out.push(c);
        }
        pos += 1;
    }
    Err(CompileError::Lex {
        line,
        message: "unterminated string literal".into(),
    })
}

/// Escape a string so that the lexer reads it back unchanged.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_indentation_produces_indent_and_dedent() {
        let toks = kinds("def f(a):\n    return a\nx = 1\n");
        assert!(toks.contains(&TokenKind::Indent));
        assert!(toks.contains(&TokenKind::Dedent));
        assert_eq!(toks.last(), Some(&TokenKind::Eof));
    }

    #[test]
    fn test_brackets_join_lines() {
        let toks = kinds("x = [1,\n     2]\n");
        let newlines = toks.iter().filter(|t| **t == TokenKind::Newline).count();
        assert_eq!(newlines, 1);
        assert!(!toks.contains(&TokenKind::Indent));
    }

    #[test]
    fn test_literals_and_operators() {
        let toks = kinds("y //= 2.5 + 'a\\n'\n");
        assert_eq!(toks[0], TokenKind::Name("y".into()));
        assert_eq!(toks[1], TokenKind::Op("//="));
        assert_eq!(toks[2], TokenKind::Float(2.5));
        assert_eq!(toks[4], TokenKind::Str("a\n".into()));
    }

    #[test]
    fn test_comments_and_blank_lines_are_skipped() {
        let toks = kinds("# header\n\nx = 1  # trailing\n");
        assert_eq!(
            toks,
            vec![
                TokenKind::Name("x".into()),
                TokenKind::Op("="),
                TokenKind::Int(1),
                TokenKind::Newline,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_bad_dedent_is_an_error() {
        let err = tokenize("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert!(matches!(err, CompileError::Lex { line: 3, .. }));
    }

    #[test]
    fn test_quote_round_trips() {
        let text = "he said \"hi\"\\\n";
        let toks = kinds(&format!("{}\n", quote(text)));
        assert_eq!(toks[0], TokenKind::Str(text.to_string()));
    }
}
