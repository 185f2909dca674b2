//! 规则描述语言的语法树
//!
//! `Expr` 是一个封闭的和类型，编译器、打印器都对它做穷尽匹配。

use crate::duration::format_duration;
use crate::token::Token;
use std::fmt;
use std::time::Duration;

/// 语法树节点
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Ident(IdentLit),
    Binary(BinaryExpr),
    Paren(ParenExpr),
    Object(ObjectLit),
    Device(DeviceLit),
    Devices(DevicesLit),
    List(ListLit),
    String(StringLit),
    Int(IntLit),
    Float(FloatLit),
    Bool(BoolLit),
    Time(TimeLit),
    Spec(SpecExpr),
}

impl Expr {
    /// 节点在源文本中的字节偏移
    pub fn pos(&self) -> usize {
        match self {
            Self::Ident(e) => e.pos,
            Self::Binary(e) => e.pos,
            Self::Paren(e) => e.pos,
            Self::Object(e) => e.pos,
            Self::Device(e) => e.pos,
            Self::Devices(e) => e.pos,
            Self::List(e) => e.pos,
            Self::String(e) => e.pos,
            Self::Int(e) => e.pos,
            Self::Float(e) => e.pos,
            Self::Bool(e) => e.pos,
            Self::Time(e) => e.pos,
            Self::Spec(e) => e.pos,
        }
    }

    /// 叶子节点：不再包含子表达式
    pub fn is_leaf(&self) -> bool {
        !matches!(self, Self::Binary(_) | Self::Paren(_) | Self::Spec(_))
    }
}

/// 设备属性引用，如 `speed` 或 `{device.speed}`
#[derive(Debug, Clone, PartialEq)]
pub struct IdentLit {
    pub kind: Token,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: Token,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParenExpr {
    pub expr: Box<Expr>,
    pub pos: usize,
}

/// 距离修饰符，单位为米
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Qualifier {
    Radius(f64),
    BBox(f64),
}

impl Qualifier {
    pub fn meters(self) -> f64 {
        match self {
            Self::Radius(m) | Self::BBox(m) => m,
        }
    }
}

/// 几何对象引用，如 `polygon(@a, @b) :distance 200m :after 5m`
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectLit {
    pub kind: Token,
    pub refs: Vec<String>,
    pub qualifier: Option<Qualifier>,
    pub after: Option<Duration>,
    pub pos: usize,
}

/// 当前设备，如 `device :radius 500m`
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLit {
    pub qualifier: Option<Qualifier>,
    pub pos: usize,
}

/// 设备集合引用，如 `devices(@d1, @d2)`
#[derive(Debug, Clone, PartialEq)]
pub struct DevicesLit {
    pub refs: Vec<String>,
    pub qualifier: Option<Qualifier>,
    pub after: Option<Duration>,
    pub pos: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    List,
    Range,
}

/// 一天中的时刻
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn minutes(self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }
}

/// 列表或区间中的元素
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    String(String),
    Time(TimeOfDay),
}

impl Scalar {
    /// 元素的字面量类型
    pub fn token(&self) -> Token {
        match self {
            Self::Int(_) => Token::Int,
            Self::Float(_) => Token::Float,
            Self::String(_) => Token::String,
            Self::Time(_) => Token::Time,
        }
    }
}

/// 列表 `[1, 2, 3]` 或区间 `[5 .. 10]`
#[derive(Debug, Clone, PartialEq)]
pub struct ListLit {
    pub kind: ListKind,
    /// 元素类型：INT、FLOAT、STRING 或 TIME
    pub typ: Token,
    pub items: Vec<Scalar>,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringLit {
    pub value: String,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntLit {
    pub value: i64,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatLit {
    pub value: f64,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoolLit {
    pub value: bool,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeLit {
    pub value: TimeOfDay,
    pub pos: usize,
}

/// 触发频率
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// 每个 (设备, 规则) 只触发一次
    Once,
    /// 触发后在给定时长内静默
    Every(Duration),
    /// 在滚动窗口内满足 N 次才触发
    Times { count: u32, interval: Duration },
}

/// 规则整体：表达式 + 尾部的 `:trigger` 子句
#[derive(Debug, Clone, PartialEq)]
pub struct SpecExpr {
    pub expr: Box<Expr>,
    pub trigger: Trigger,
    pub pos: usize,
}

fn write_refs(f: &mut fmt::Formatter<'_>, refs: &[String]) -> fmt::Result {
    for (i, r) in refs.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "@{r}")?;
    }
    Ok(())
}

fn write_meters(f: &mut fmt::Formatter<'_>, meters: f64) -> fmt::Result {
    if meters >= 1000.0 && (meters / 1000.0).fract() == 0.0 {
        write!(f, "{}km", meters / 1000.0)
    } else {
        write!(f, "{meters}m")
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Radius(m) => {
                f.write_str(":radius ")?;
                write_meters(f, *m)
            }
            Self::BBox(m) => {
                f.write_str(":bbox ")?;
                write_meters(f, *m)
            }
        }
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Time(v) => write!(f, "{v}"),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Once => f.write_str("once"),
            Self::Every(d) => write!(f, "every {}", format_duration(*d)),
            Self::Times { count, interval } => {
                write!(f, "{count} times {}", format_duration(*interval))
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(e) => f.write_str(e.kind.as_str()),
            Self::Binary(e) => write!(f, "{} {} {}", e.lhs, e.op, e.rhs),
            Self::Paren(e) => write!(f, "({})", e.expr),
            Self::Object(e) => {
                write!(f, "{}(", e.kind)?;
                write_refs(f, &e.refs)?;
                f.write_str(")")?;
                if let Some(q) = e.qualifier {
                    write!(f, " {q}")?;
                }
                if let Some(d) = e.after {
                    write!(f, " :after {}", format_duration(d))?;
                }
                Ok(())
            }
            Self::Device(e) => {
                f.write_str("device")?;
                if let Some(q) = e.qualifier {
                    write!(f, " {q}")?;
                }
                Ok(())
            }
            Self::Devices(e) => {
                f.write_str("devices(")?;
                write_refs(f, &e.refs)?;
                f.write_str(")")?;
                if let Some(q) = e.qualifier {
                    write!(f, " {q}")?;
                }
                if let Some(d) = e.after {
                    write!(f, " :after {}", format_duration(d))?;
                }
                Ok(())
            }
            Self::List(e) => {
                let sep = match e.kind {
                    ListKind::List => ", ",
                    ListKind::Range => " .. ",
                };
                f.write_str("[")?;
                for (i, item) in e.items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::String(e) => write!(f, "{:?}", e.value),
            Self::Int(e) => write!(f, "{}", e.value),
            Self::Float(e) => write!(f, "{:?}", e.value),
            Self::Bool(e) => write!(f, "{}", e.value),
            Self::Time(e) => write!(f, "{}", e.value),
            Self::Spec(e) => write!(f, "{} :trigger {}", e.expr, e.trigger),
        }
    }
}
