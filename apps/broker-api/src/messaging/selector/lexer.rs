use super::SelectorError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Between,
    In,
    Like,
    Escape,
    Is,
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
}

/// A token and the byte offset it starts at.
pub(crate) type Spanned = (Token, usize);

pub(crate) fn tokenize(input: &str) -> Result<Vec<Spanned>, SelectorError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let single = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            '=' => Some(Token::Eq),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push((token, pos));
            i += 1;
            continue;
        }

        let next = chars.get(i + 1).map(|&(_, c)| c);
        match c {
            '<' => {
                let (token, width) = match next {
                    Some('>') => (Token::Ne, 2),
                    Some('=') => (Token::Le, 2),
                    _ => (Token::Lt, 1),
                };
                tokens.push((token, pos));
                i += width;
            }
            '>' => {
                let (token, width) = match next {
                    Some('=') => (Token::Ge, 2),
                    _ => (Token::Gt, 1),
                };
                tokens.push((token, pos));
                i += width;
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&(_, '\'')) => {
                            // Doubled quote is an escaped quote.
                            if chars.get(i + 1).map(|&(_, c)| c) == Some('\'') {
                                value.push('\'');
                                i += 2;
                            } else {
                                i += 1;
                                break;
                            }
                        }
                        Some(&(_, ch)) => {
                            value.push(ch);
                            i += 1;
                        }
                        None => return Err(SelectorError::syntax(pos, "unterminated string literal")),
                    }
                }
                tokens.push((Token::Str(value), pos));
            }
            c if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                if i < chars.len() && matches!(chars[i].1, 'e' | 'E') {
                    i += 1;
                    if i < chars.len() && matches!(chars[i].1, '+' | '-') {
                        i += 1;
                    }
                    while i < chars.len() && chars[i].1.is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().map(|&(_, c)| c).collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| SelectorError::syntax(pos, format!("invalid number '{text}'")))?;
                tokens.push((Token::Num(value), pos));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|&(_, c)| c).collect();
                tokens.push((keyword(&word).unwrap_or(Token::Ident(word)), pos));
            }
            other => {
                return Err(SelectorError::syntax(pos, format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

fn keyword(word: &str) -> Option<Token> {
    let token = match word.to_ascii_uppercase().as_str() {
        "TRUE" => Token::True,
        "FALSE" => Token::False,
        "NULL" => Token::Null,
        "AND" => Token::And,
        "OR" => Token::Or,
        "NOT" => Token::Not,
        "BETWEEN" => Token::Between,
        "IN" => Token::In,
        "LIKE" => Token::Like,
        "ESCAPE" => Token::Escape,
        "IS" => Token::Is,
        _ => return None,
    };
    Some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn tokenizes_comparison() {
        assert_eq!(
            kinds("price >= 10.5"),
            vec![Token::Ident("price".into()), Token::Ge, Token::Num(10.5)]
        );
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(
            kinds("a is not null"),
            vec![Token::Ident("a".into()), Token::Is, Token::Not, Token::Null]
        );
    }

    #[test]
    fn doubled_quote_escapes() {
        assert_eq!(kinds("'it''s'"), vec![Token::Str("it's".into())]);
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(tokenize("name = 'abc").is_err());
        assert!(tokenize("a # b").is_err());
    }
}
