//! 求值节点定义
//!
//! 每个节点由语法树中一对叶子操作数与连接它们的运算符编译而来，创建后不可变。

use crate::ast::{Qualifier, TimeOfDay};
use crate::token::Token;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// 设备属性的值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Numeric,
    Text,
    Time,
}

impl Family {
    /// 属性关键字所属的值类型
    pub fn of(field: Token) -> Option<Self> {
        match field {
            Token::Speed
            | Token::Battery
            | Token::Temperature
            | Token::Humidity
            | Token::Luminosity
            | Token::Pressure
            | Token::FuelLevel
            | Token::Altitude
            | Token::Latitude
            | Token::Longitude
            | Token::Status
            | Token::Year
            | Token::Month
            | Token::Week
            | Token::Day
            | Token::Hour
            | Token::Minute => Some(Self::Numeric),
            Token::Imei | Token::Owner | Token::Brand | Token::Model | Token::Date => {
                Some(Self::Text)
            }
            Token::Time => Some(Self::Time),
            _ => None,
        }
    }

    /// 用于错误提示的期望字面量分组
    pub fn expected(self) -> &'static str {
        match self {
            Self::Numeric => "INT|FLOAT",
            Self::Text => "STRING",
            Self::Time => "TIME",
        }
    }
}

/// 比较节点右侧的常量
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Number(f64),
    Text(String),
    Time(TimeOfDay),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Time(v) => write!(f, "{v}"),
        }
    }
}

/// IN 运算的取值集合
#[derive(Debug, Clone, PartialEq)]
pub enum ValueSet {
    Numbers(Vec<f64>),
    Texts(HashSet<String>),
    Times(HashSet<TimeOfDay>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompareNode {
    pub field: Token,
    pub op: Token,
    pub value: Operand,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MembershipNode {
    pub field: Token,
    pub negate: bool,
    pub set: ValueSet,
    pub pos: usize,
}

/// 闭区间 `[begin, end]`
#[derive(Debug, Clone, PartialEq)]
pub struct RangeNode {
    pub field: Token,
    pub negate: bool,
    pub begin: Operand,
    pub end: Operand,
    pub pos: usize,
}

/// 空间运算的目标
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// 几何对象引用
    Objects {
        kind: Token,
        refs: Vec<String>,
        qualifier: Option<Qualifier>,
        after: Option<Duration>,
    },
    /// 指定设备集合
    Devices {
        refs: Vec<String>,
        qualifier: Option<Qualifier>,
        after: Option<Duration>,
    },
    /// 半径范围内的任意其它设备
    Nearby { qualifier: Qualifier },
}

impl Target {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Objects { kind, .. } => kind.as_str(),
            Self::Devices { .. } => Token::Devices.as_str(),
            Self::Nearby { .. } => Token::Device.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpatialNode {
    /// NEAR / INTERSECTS / WITHIN / CONTAINS 及其取反形式，主语总是当前设备
    pub op: Token,
    pub device: Option<Qualifier>,
    pub target: Target,
    pub pos: usize,
}

impl SpatialNode {
    pub fn negated(&self) -> bool {
        matches!(
            self.op,
            Token::NotNear
                | Token::NotIntersects
                | Token::NotIntersectsBox
                | Token::NotWithin
                | Token::NotContains
        )
    }

    /// 只比较包围盒的运算符
    pub fn by_box(&self) -> bool {
        matches!(self.op, Token::IntersectsBox | Token::NotIntersectsBox)
    }
}

/// 编译后的求值节点
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Compare(CompareNode),
    Membership(MembershipNode),
    Range(RangeNode),
    Spatial(SpatialNode),
}

impl Node {
    pub fn operator(&self) -> Token {
        match self {
            Self::Compare(n) => n.op,
            Self::Membership(MembershipNode { negate, .. })
            | Self::Range(RangeNode { negate, .. }) => {
                if *negate {
                    Token::NotIn
                } else {
                    Token::In
                }
            }
            Self::Spatial(n) => n.op,
        }
    }

    pub fn pos(&self) -> usize {
        match self {
            Self::Compare(n) => n.pos,
            Self::Membership(n) => n.pos,
            Self::Range(n) => n.pos,
            Self::Spatial(n) => n.pos,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare(n) => write!(f, "{} {} {}", n.field, n.op, n.value),
            Self::Membership(n) => {
                let len = match &n.set {
                    ValueSet::Numbers(v) => v.len(),
                    ValueSet::Texts(v) => v.len(),
                    ValueSet::Times(v) => v.len(),
                };
                write!(f, "{} {} <{} values>", n.field, self.operator(), len)
            }
            Self::Range(n) => {
                write!(f, "{} {} [{} .. {}]", n.field, self.operator(), n.begin, n.end)
            }
            Self::Spatial(n) => write!(f, "device {} {}", n.op, n.target.keyword()),
        }
    }
}
