//! 递归下降解析器
//!
//! 二元运算通过“右子树下推”的方式实现优先级：当前根节点是优先级不高于新运算符的
//! 二元表达式时，新运算符与右操作数被插入根节点的右子树，否则新建根节点包住整棵树。
//! 需要两个 token 以上的前瞻（时刻字面量、修饰符）时在词法分析器的克隆上试探扫描，
//! 成功后再整体提交。

use crate::ast::*;
use crate::duration::parse_duration;
use crate::error::ParseError;
use crate::geometry::MAX_DISTANCE_METERS;
use crate::lexer::{Lexeme, Lexer};
use crate::token::{LOWEST_PREC, Token};
use std::time::Duration;

/// 引用 ID 的最大长度
pub const MAX_REF_LEN: usize = 64;

type PResult<T> = std::result::Result<T, ParseError>;

/// 解析规则描述文本
pub fn parse(src: &str) -> PResult<Expr> {
    Parser::new(src).parse()
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
}

fn error_at(l: &Lexeme, message: impl Into<String>) -> ParseError {
    ParseError::new(l.token, l.literal.clone(), l.offset, message)
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            lexer: Lexer::new(src),
        }
    }

    pub fn parse(&mut self) -> PResult<Expr> {
        let expr = self.parse_binary(Token::Eof)?;
        let end = self.lexer.next_token();
        if end.token != Token::Eof {
            return Err(error_at(&end, "unexpected token"));
        }
        Ok(expr)
    }

    /// 解析一串由二元运算符连接的操作数，遇到 `stop` 时回退并返回
    fn parse_binary(&mut self, stop: Token) -> PResult<Expr> {
        let mut expr = self.parse_expr()?;
        loop {
            let l = self.lexer.next_token();
            match l.token {
                t if t == stop => {
                    self.lexer.reset();
                    return Ok(expr);
                }
                Token::Colon if stop == Token::Eof => {
                    return self.parse_spec(expr, &l);
                }
                Token::Eof => return Err(error_at(&l, "unexpected end of input")),
                op if op.precedence() > LOWEST_PREC => {
                    let rhs = self.parse_expr()?;
                    expr = push_down(expr, op, rhs, l.offset);
                }
                Token::Illegal => return Err(error_at(&l, "illegal token")),
                _ => return Err(error_at(&l, "expected binary operator")),
            }
        }
    }

    /// `:trigger ...` 子句，之后不允许再有任何内容
    fn parse_spec(&mut self, expr: Expr, colon: &Lexeme) -> PResult<Expr> {
        let kw = self.lexer.next_token();
        if kw.token != Token::Trigger {
            return Err(error_at(&kw, "expected trigger"));
        }
        let trigger = self.parse_trigger()?;
        let end = self.lexer.next_token();
        if end.token != Token::Eof {
            return Err(error_at(&end, "unexpected token after trigger"));
        }
        Ok(Expr::Spec(SpecExpr {
            expr: Box::new(expr),
            trigger,
            pos: colon.offset,
        }))
    }

    fn parse_trigger(&mut self) -> PResult<Trigger> {
        let l = self.lexer.next_token();
        match (l.token, l.literal.as_str()) {
            (Token::Illegal, "once") => Ok(Trigger::Once),
            (Token::Illegal, "every") => Ok(Trigger::Every(self.parse_duration_lit()?)),
            (Token::Int, _) => {
                let count: u32 = l
                    .literal
                    .parse()
                    .map_err(|_| error_at(&l, "invalid repeat count"))?;
                if count == 0 {
                    return Err(error_at(&l, "repeat count must be positive"));
                }
                let times = self.lexer.next_token();
                if !(times.token == Token::Illegal && matches!(times.literal.as_str(), "times" | "time"))
                {
                    return Err(error_at(&times, "expected times"));
                }
                let sep = self.lexer.next_token();
                let is_sep = matches!(sep.token, Token::In | Token::Within)
                    || (sep.token == Token::Illegal
                        && matches!(sep.literal.as_str(), "every" | "per"));
                if !is_sep {
                    self.lexer.reset();
                }
                let interval = self.parse_duration_lit()?;
                Ok(Trigger::Times { count, interval })
            }
            _ => Err(error_at(&l, "expected once, every or N times")),
        }
    }

    /// 单个操作数
    fn parse_expr(&mut self) -> PResult<Expr> {
        let l = self.lexer.next_token();
        match l.token {
            Token::Int => {
                if let Some(value) = self.try_time(&l)? {
                    return Ok(Expr::Time(TimeLit {
                        value,
                        pos: l.offset,
                    }));
                }
                Ok(Expr::Int(IntLit {
                    value: parse_int(&l, false)?,
                    pos: l.offset,
                }))
            }
            Token::Float => Ok(Expr::Float(FloatLit {
                value: parse_float(&l, false)?,
                pos: l.offset,
            })),
            Token::Sub => match self.parse_negative(&l)? {
                Scalar::Int(value) => Ok(Expr::Int(IntLit {
                    value,
                    pos: l.offset,
                })),
                Scalar::Float(value) => Ok(Expr::Float(FloatLit {
                    value,
                    pos: l.offset,
                })),
                _ => Err(error_at(&l, "expected number")),
            },
            Token::String => Ok(Expr::String(StringLit {
                value: l.literal,
                pos: l.offset,
            })),
            Token::True | Token::False => Ok(Expr::Bool(BoolLit {
                value: l.token == Token::True,
                pos: l.offset,
            })),
            Token::LParen => {
                let inner = self.parse_binary(Token::RParen)?;
                self.expect(Token::RParen, "expected )")?;
                Ok(Expr::Paren(ParenExpr {
                    expr: Box::new(inner),
                    pos: l.offset,
                }))
            }
            Token::LBrack => self.parse_list(&l),
            Token::LBrace => self.parse_braced(&l),
            Token::Device => {
                let (qualifier, after) = self.parse_qualifiers(false)?;
                debug_assert!(after.is_none());
                Ok(Expr::Device(DeviceLit {
                    qualifier,
                    pos: l.offset,
                }))
            }
            Token::Devices => {
                let refs = self.parse_refs()?;
                let (qualifier, after) = self.parse_qualifiers(true)?;
                Ok(Expr::Devices(DevicesLit {
                    refs,
                    qualifier,
                    after,
                    pos: l.offset,
                }))
            }
            t if t.is_object_ref() => {
                let refs = self.parse_refs()?;
                let (qualifier, after) = self.parse_qualifiers(true)?;
                Ok(Expr::Object(ObjectLit {
                    kind: t,
                    refs,
                    qualifier,
                    after,
                    pos: l.offset,
                }))
            }
            t if t.is_property() => Ok(Expr::Ident(IdentLit {
                kind: t,
                pos: l.offset,
            })),
            Token::Eof => Err(error_at(&l, "unexpected end of input")),
            Token::Illegal => Err(error_at(&l, "illegal token")),
            _ => Err(error_at(&l, "unexpected token")),
        }
    }

    fn expect(&mut self, token: Token, message: &str) -> PResult<Lexeme> {
        let l = self.lexer.next_token();
        if l.token != token {
            return Err(error_at(&l, message));
        }
        Ok(l)
    }

    /// `INT : INT` 组成时刻字面量
    fn try_time(&mut self, hour: &Lexeme) -> PResult<Option<TimeOfDay>> {
        let mut ahead = self.lexer.clone();
        if ahead.next_token().token != Token::Colon {
            return Ok(None);
        }
        let minute = ahead.next_token();
        if minute.token != Token::Int {
            return Ok(None);
        }
        self.lexer = ahead;

        let h: u8 = hour
            .literal
            .parse()
            .map_err(|_| error_at(hour, "invalid hour"))?;
        let m: u8 = minute
            .literal
            .parse()
            .map_err(|_| error_at(&minute, "invalid minute"))?;
        if h >= 24 {
            return Err(error_at(hour, "hour out of range"));
        }
        if m >= 60 {
            return Err(error_at(&minute, "minute out of range"));
        }
        Ok(Some(TimeOfDay { hour: h, minute: m }))
    }

    fn parse_negative(&mut self, sign: &Lexeme) -> PResult<Scalar> {
        let l = self.lexer.next_token();
        match l.token {
            Token::Int => Ok(Scalar::Int(parse_int(&l, true)?)),
            Token::Float => Ok(Scalar::Float(parse_float(&l, true)?)),
            _ => Err(error_at(sign, "expected number after -")),
        }
    }

    /// `{device.speed}`
    fn parse_braced(&mut self, open: &Lexeme) -> PResult<Expr> {
        self.expect(Token::Device, "expected device")?;
        let dot = self.expect(Token::Period, "expected .")?;
        if dot.literal != "." {
            return Err(error_at(&dot, "expected ."));
        }
        let field = self.lexer.next_token();
        if !field.token.is_property() {
            return Err(error_at(&field, "expected device property"));
        }
        self.expect(Token::RBrace, "expected }")?;
        Ok(Expr::Ident(IdentLit {
            kind: field.token,
            pos: open.offset,
        }))
    }

    fn parse_scalar(&mut self) -> PResult<(Scalar, Lexeme)> {
        let l = self.lexer.next_token();
        let item = match l.token {
            Token::Int => match self.try_time(&l)? {
                Some(t) => Scalar::Time(t),
                None => Scalar::Int(parse_int(&l, false)?),
            },
            Token::Float => Scalar::Float(parse_float(&l, false)?),
            Token::String => Scalar::String(l.literal.clone()),
            Token::Sub => self.parse_negative(&l)?,
            Token::Eof => return Err(error_at(&l, "unterminated list")),
            _ => return Err(error_at(&l, "expected list item")),
        };
        Ok((item, l))
    }

    /// `[a, b, c]` 或 `[a .. b]`
    fn parse_list(&mut self, open: &Lexeme) -> PResult<Expr> {
        let mut ahead = self.lexer.clone();
        let first = ahead.next_token();
        if first.token == Token::RBrack {
            return Err(error_at(&first, "empty list"));
        }

        let mut kind = ListKind::List;
        let mut typ: Option<Token> = None;
        let mut items = Vec::new();
        loop {
            let (item, at) = self.parse_scalar()?;
            match typ {
                None => typ = Some(item.token()),
                Some(t) if t != item.token() => {
                    return Err(error_at(&at, "mixed item types in list"));
                }
                _ => {}
            }
            items.push(item);

            let sep = self.lexer.next_token();
            match sep.token {
                Token::RBrack => break,
                Token::Comma if kind == ListKind::List => {}
                Token::Period if kind == ListKind::List && items.len() == 1 => {
                    kind = ListKind::Range;
                }
                Token::Eof => return Err(error_at(&sep, "unterminated list")),
                _ => return Err(error_at(&sep, "unexpected token in list")),
            }
        }

        let typ = typ.unwrap_or(Token::Int);
        if kind == ListKind::Range {
            if items.len() != 2 {
                return Err(error_at(open, "range requires exactly two items"));
            }
            if !ascending(&items[0], &items[1]) {
                return Err(error_at(open, "range begin must be less than end"));
            }
        }
        Ok(Expr::List(ListLit {
            kind,
            typ,
            items,
            pos: open.offset,
        }))
    }

    /// `(@a, @b, ...)`，重复的引用被去重，保持首次出现的顺序
    fn parse_refs(&mut self) -> PResult<Vec<String>> {
        self.expect(Token::LParen, "expected (")?;
        let mut refs: Vec<String> = Vec::new();
        loop {
            let l = self.lexer.next_token();
            match l.token {
                Token::RParen if refs.is_empty() => {
                    return Err(error_at(&l, "empty argument list"));
                }
                Token::Var | Token::String | Token::Illegal | Token::Int
                    if is_ref_literal(&l) =>
                {
                    if l.literal.chars().count() > MAX_REF_LEN {
                        return Err(error_at(&l, "reference id too long"));
                    }
                    if !refs.contains(&l.literal) {
                        refs.push(l.literal);
                    }
                }
                Token::Eof => return Err(error_at(&l, "expected )")),
                _ => return Err(error_at(&l, "expected reference")),
            }

            let sep = self.lexer.next_token();
            match sep.token {
                Token::Comma => {}
                Token::RParen => return Ok(refs),
                _ => return Err(error_at(&sep, "expected , or )")),
            }
        }
    }

    /// 尾随修饰符：`:radius|:distance|:bbox N(m|km)` 与 `:after|:duration <d>`
    fn parse_qualifiers(
        &mut self,
        allow_after: bool,
    ) -> PResult<(Option<Qualifier>, Option<Duration>)> {
        let mut qualifier = None;
        let mut after = None;
        loop {
            let mut ahead = self.lexer.clone();
            if ahead.next_token().token != Token::Colon {
                break;
            }
            let kw = ahead.next_token();
            match kw.token {
                Token::Radius | Token::Distance | Token::BBox => {
                    self.lexer = ahead;
                    if qualifier.is_some() {
                        return Err(error_at(&kw, "duplicate distance qualifier"));
                    }
                    let meters = self.parse_distance()?;
                    qualifier = Some(if kw.token == Token::BBox {
                        Qualifier::BBox(meters)
                    } else {
                        Qualifier::Radius(meters)
                    });
                }
                Token::After | Token::Duration if allow_after => {
                    self.lexer = ahead;
                    if after.is_some() {
                        return Err(error_at(&kw, "duplicate duration qualifier"));
                    }
                    after = Some(self.parse_duration_lit()?);
                }
                _ => break,
            }
        }
        Ok((qualifier, after))
    }

    /// `500m`、`1.5km`，返回米
    fn parse_distance(&mut self) -> PResult<f64> {
        let l = self.lexer.next_token();
        let value = match l.token {
            Token::Int | Token::Float => parse_float(&l, false)?,
            Token::Sub => return Err(error_at(&l, "negative distance")),
            _ => return Err(error_at(&l, "expected distance")),
        };
        let unit = self.lexer.next_token();
        let meters = match (unit.token, unit.literal.as_str()) {
            (Token::Illegal, "m") => value,
            (Token::Illegal, "km") => value * 1000.0,
            _ => return Err(error_at(&unit, "missing distance unit")),
        };
        if !meters.is_finite() {
            return Err(error_at(&l, "distance out of range"));
        }
        if meters <= 0.0 {
            return Err(error_at(&l, "distance must be positive"));
        }
        Ok(meters.min(MAX_DISTANCE_METERS))
    }

    /// 时长字面量：累积 “数值 + 单位” 直到遇到非数值 token
    fn parse_duration_lit(&mut self) -> PResult<Duration> {
        let mut text = String::new();
        let mut first: Option<Lexeme> = None;
        loop {
            let l = self.lexer.next_token();
            if !matches!(l.token, Token::Int | Token::Float) {
                self.lexer.reset();
                if first.is_none() {
                    return Err(error_at(&l, "expected duration"));
                }
                break;
            }
            text.push_str(&l.literal);
            let unit = self.lexer.next_token();
            if unit.token != Token::Illegal {
                return Err(error_at(&unit, "missing duration unit"));
            }
            text.push_str(&unit.literal);
            first.get_or_insert(l);
        }

        let at = first.ok_or_else(|| ParseError::new(Token::Illegal, "", 0, "expected duration"))?;
        match parse_duration(&text) {
            Some(d) if !d.is_zero() => Ok(d),
            _ => Err(ParseError::new(at.token, text, at.offset, "invalid duration")),
        }
    }
}

/// 新运算符下推到右子树或包住整棵树
fn push_down(lhs: Expr, op: Token, rhs: Expr, pos: usize) -> Expr {
    match lhs {
        Expr::Binary(b) if b.op.precedence() <= op.precedence() => Expr::Binary(BinaryExpr {
            op: b.op,
            lhs: b.lhs,
            rhs: Box::new(push_down(*b.rhs, op, rhs, pos)),
            pos: b.pos,
        }),
        other => Expr::Binary(BinaryExpr {
            op,
            lhs: Box::new(other),
            rhs: Box::new(rhs),
            pos,
        }),
    }
}

fn parse_int(l: &Lexeme, negative: bool) -> PResult<i64> {
    let text = if negative {
        format!("-{}", l.literal)
    } else {
        l.literal.clone()
    };
    text.parse().map_err(|_| error_at(l, "integer out of range"))
}

fn parse_float(l: &Lexeme, negative: bool) -> PResult<f64> {
    let v: f64 = l
        .literal
        .parse()
        .map_err(|_| error_at(l, "invalid number"))?;
    Ok(if negative { -v } else { v })
}

fn is_ref_literal(l: &Lexeme) -> bool {
    match l.token {
        Token::Illegal => {
            !l.literal.is_empty()
                && l
                    .literal
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        }
        _ => !l.literal.is_empty(),
    }
}

/// 区间端点严格递增
fn ascending(begin: &Scalar, end: &Scalar) -> bool {
    match (begin, end) {
        (Scalar::Int(a), Scalar::Int(b)) => a < b,
        (Scalar::Float(a), Scalar::Float(b)) => a < b,
        (Scalar::String(a), Scalar::String(b)) => a < b,
        (Scalar::Time(a), Scalar::Time(b)) => a < b,
        _ => false,
    }
}
