//! 词法分析器
//!
//! 每次调用 [`Lexer::next_token`] 消费一个词法单元，返回 token、字面量与字节偏移。
//! 无法识别的输入产生 `Token::Illegal` 并保留原始字面量，错误由解析器决定如何报告。

use crate::token::{KEYWORDS, Keywords, Token};

/// 一个词法单元及其位置
#[derive(Debug, Clone, PartialEq)]
pub struct Lexeme {
    pub token: Token,
    pub literal: String,
    pub offset: usize,
}

impl Lexeme {
    fn new(token: Token, literal: impl Into<String>, offset: usize) -> Self {
        Self {
            token,
            literal: literal.into(),
            offset,
        }
    }
}

/// 词法分析器
///
/// 游标只包含源文本切片与偏移，克隆代价很低，解析器可以在克隆上做试探性扫描。
#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    keywords: &'a Keywords,
    last: Option<Lexeme>,
    pushed: Option<Lexeme>,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self::with_keywords(src, &KEYWORDS)
    }

    pub fn with_keywords(src: &'a str, keywords: &'a Keywords) -> Self {
        Self {
            src,
            pos: 0,
            keywords,
            last: None,
            pushed: None,
        }
    }

    /// 读取下一个词法单元
    pub fn next_token(&mut self) -> Lexeme {
        let lexeme = match self.pushed.take() {
            Some(l) => l,
            None => self.scan(),
        };
        self.last = Some(lexeme.clone());
        lexeme
    }

    /// 回退最近读取的一个词法单元
    pub fn reset(&mut self) {
        if let Some(l) = self.last.take() {
            self.pushed = Some(l);
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut it = self.src[self.pos..].chars();
        it.next();
        it.next()
    }

    fn bump(&mut self, ch: char) {
        self.pos += ch.len_utf8();
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.bump(expected);
            true
        } else {
            false
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if !pred(ch) {
                break;
            }
            self.bump(ch);
        }
        &self.src[start..self.pos]
    }

    fn skip_whitespace(&mut self) {
        self.take_while(char::is_whitespace);
    }

    fn scan(&mut self) -> Lexeme {
        self.skip_whitespace();
        let start = self.pos;
        let Some(ch) = self.peek_char() else {
            return Lexeme::new(Token::Eof, "", start);
        };
        self.bump(ch);

        let punct = |token: Token| Lexeme::new(token, token.as_str(), start);
        match ch {
            '(' => punct(Token::LParen),
            ')' => punct(Token::RParen),
            '[' => punct(Token::LBrack),
            ']' => punct(Token::RBrack),
            '{' => punct(Token::LBrace),
            '}' => punct(Token::RBrace),
            ',' => punct(Token::Comma),
            ':' => punct(Token::Colon),
            '+' => punct(Token::Add),
            '-' => punct(Token::Sub),
            '*' => punct(Token::Mul),
            '/' => punct(Token::Quo),
            '%' => punct(Token::Rem),
            '.' => {
                // `..` 作为一个区间分隔符
                if self.eat('.') {
                    Lexeme::new(Token::Period, "..", start)
                } else {
                    punct(Token::Period)
                }
            }
            '>' => {
                if self.eat('=') {
                    punct(Token::Geq)
                } else {
                    punct(Token::Gtr)
                }
            }
            '<' => {
                if self.eat('=') {
                    punct(Token::Leq)
                } else {
                    punct(Token::Lss)
                }
            }
            '!' => {
                if self.eat('=') {
                    punct(Token::Neq)
                } else {
                    Lexeme::new(Token::Illegal, "!", start)
                }
            }
            '=' => {
                self.eat('=');
                Lexeme::new(Token::Eql, &self.src[start..self.pos], start)
            }
            '@' => {
                let id = self.take_while(is_ref_char);
                if id.is_empty() {
                    Lexeme::new(Token::Illegal, "@", start)
                } else {
                    Lexeme::new(Token::Var, id, start)
                }
            }
            '"' | '\'' => self.scan_string(ch, start),
            c if c.is_ascii_digit() => self.scan_number(start),
            c if c.is_alphabetic() || c == '_' => self.scan_word(start),
            other => Lexeme::new(Token::Illegal, other.to_string(), start),
        }
    }

    fn scan_number(&mut self, start: usize) -> Lexeme {
        self.take_while(|c| c.is_ascii_digit());
        let is_float = self.peek_char() == Some('.')
            && self.peek_second().is_some_and(|c| c.is_ascii_digit());
        if is_float {
            self.bump('.');
            self.take_while(|c| c.is_ascii_digit());
            return Lexeme::new(Token::Float, &self.src[start..self.pos], start);
        }
        Lexeme::new(Token::Int, &self.src[start..self.pos], start)
    }

    fn scan_string(&mut self, quote: char, start: usize) -> Lexeme {
        let mut value = String::new();
        while let Some(ch) = self.peek_char() {
            self.bump(ch);
            match ch {
                c if c == quote => return Lexeme::new(Token::String, value, start),
                '\\' => match self.peek_char() {
                    Some(esc) => {
                        self.bump(esc);
                        value.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => other,
                        });
                    }
                    None => break,
                },
                c => value.push(c),
            }
        }
        // 未闭合的字符串
        Lexeme::new(Token::Illegal, &self.src[start..self.pos], start)
    }

    fn scan_word(&mut self, start: usize) -> Lexeme {
        self.take_while(is_word_char);
        let word = &self.src[start..self.pos];
        match self.keywords.lookup(word) {
            Some(Token::Not) => self.fold_not(start),
            Some(Token::Intersects) if self.take_box_suffix() => {
                Lexeme::new(Token::IntersectsBox, &self.src[start..self.pos], start)
            }
            Some(token) => Lexeme::new(token, word, start),
            None => Lexeme::new(Token::Illegal, word, start),
        }
    }

    /// 将 `NOT <op>` 折叠为单个复合 token，后继不是可取反运算符时回退
    fn fold_not(&mut self, start: usize) -> Lexeme {
        let after_not = self.pos;
        self.skip_whitespace();
        let next = self.take_while(is_word_char);
        let op = match self.keywords.lookup(next) {
            Some(Token::Intersects) if self.take_box_suffix() => Some(Token::IntersectsBox),
            other => other,
        };
        if let Some(negated) = op.and_then(Token::negated) {
            return Lexeme::new(negated, &self.src[start..self.pos], start);
        }
        self.pos = after_not;
        Lexeme::new(Token::Not, &self.src[start..after_not], start)
    }

    /// 紧跟在 `INTERSECTS` 后的 `-BOX`（不区分大小写），匹配时一并消费
    fn take_box_suffix(&mut self) -> bool {
        let Some(tail) = self.src[self.pos..].strip_prefix('-') else {
            return false;
        };
        let len = tail.find(|c: char| !is_word_char(c)).unwrap_or(tail.len());
        if !tail[..len].eq_ignore_ascii_case("box") {
            return false;
        }
        self.pos += 1 + len;
        true
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_ref_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<(Token, String)> {
        let mut lexer = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let l = lexer.next_token();
            if l.token == Token::Eof {
                break;
            }
            out.push((l.token, l.literal));
        }
        out
    }

    fn kinds(src: &str) -> Vec<Token> {
        tokens(src).into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_comparison_operators() {
        assert_eq!(
            kinds(">= > <= < != == ="),
            vec![
                Token::Geq,
                Token::Gtr,
                Token::Leq,
                Token::Lss,
                Token::Neq,
                Token::Eql,
                Token::Eql
            ]
        );
    }

    #[test]
    fn test_numbers_and_range_separator() {
        assert_eq!(
            tokens("[5..10]"),
            vec![
                (Token::LBrack, "[".to_string()),
                (Token::Int, "5".to_string()),
                (Token::Period, "..".to_string()),
                (Token::Int, "10".to_string()),
                (Token::RBrack, "]".to_string()),
            ]
        );
        assert_eq!(kinds("1.5 .. 2.5"), vec![Token::Float, Token::Period, Token::Float]);
    }

    #[test]
    fn test_time_is_three_tokens_at_lexer_level() {
        assert_eq!(kinds("14:30"), vec![Token::Int, Token::Colon, Token::Int]);
    }

    #[test]
    fn test_intersects_box() {
        assert_eq!(kinds("INTERSECTS-BOX"), vec![Token::IntersectsBox]);
        assert_eq!(kinds("intersects-box"), vec![Token::IntersectsBox]);
        assert_eq!(
            kinds("INTERSECTS - box"),
            vec![Token::Intersects, Token::Sub, Token::Illegal]
        );
        assert_eq!(
            kinds("INTERSECTS-5"),
            vec![Token::Intersects, Token::Sub, Token::Int]
        );
    }

    #[test]
    fn test_not_folding() {
        assert_eq!(kinds("NOT IN"), vec![Token::NotIn]);
        assert_eq!(kinds("not near"), vec![Token::NotNear]);
        assert_eq!(kinds("NOT intersects"), vec![Token::NotIntersects]);
        assert_eq!(kinds("NOT INTERSECTS-BOX"), vec![Token::NotIntersectsBox]);
        assert_eq!(kinds("NOT WITHIN"), vec![Token::NotWithin]);
        assert_eq!(kinds("NOT CONTAINS"), vec![Token::NotContains]);
        assert_eq!(kinds("NOT speed"), vec![Token::Not, Token::Speed]);
    }

    #[test]
    fn test_references_and_strings() {
        assert_eq!(
            tokens(r#"polygon(@poly-1, "x\"y")"#),
            vec![
                (Token::Polygon, "polygon".to_string()),
                (Token::LParen, "(".to_string()),
                (Token::Var, "poly-1".to_string()),
                (Token::Comma, ",".to_string()),
                (Token::String, "x\"y".to_string()),
                (Token::RParen, ")".to_string()),
            ]
        );
    }

    #[test]
    fn test_unknown_words_are_illegal_with_literal() {
        assert_eq!(
            tokens("every 10s"),
            vec![
                (Token::Illegal, "every".to_string()),
                (Token::Int, "10".to_string()),
                (Token::Illegal, "s".to_string()),
            ]
        );
    }

    #[test]
    fn test_malformed_input_never_panics() {
        assert_eq!(kinds("\"open"), vec![Token::Illegal]);
        assert_eq!(kinds("@"), vec![Token::Illegal]);
        assert_eq!(kinds("$ ! ¿"), vec![Token::Illegal, Token::Illegal, Token::Illegal]);
    }

    #[test]
    fn test_offsets_and_reset() {
        let mut lexer = Lexer::new("speed  >= 5");
        let first = lexer.next_token();
        assert_eq!(first.offset, 0);
        let op = lexer.next_token();
        assert_eq!((op.token, op.offset), (Token::Geq, 7));
        lexer.reset();
        assert_eq!(lexer.next_token(), op);
        assert_eq!(lexer.next_token().offset, 10);
        assert_eq!(lexer.next_token().token, Token::Eof);
    }
}
