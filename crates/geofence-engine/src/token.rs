//! 规则描述语言的词法单元
//!
//! `Token` 是一个封闭的枚举，每个变体都有固定的规范字符串；
//! 关键字反查表 [`Keywords`] 只在启动时构建一次，并显式传给词法分析器。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

/// 词法单元
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Token {
    Illegal,
    Eof,

    // 字面量
    Int,
    Float,
    String,
    Var,

    // 标点
    LParen,
    RParen,
    LBrack,
    RBrack,
    LBrace,
    RBrace,
    Comma,
    Period,
    Colon,

    // 算术
    Add,
    Sub,
    Mul,
    Quo,
    Rem,

    // 逻辑
    Or,
    And,
    Not,

    // 比较
    Eql,
    Neq,
    Lss,
    Gtr,
    Leq,
    Geq,

    // 集合与空间
    In,
    NotIn,
    Near,
    NotNear,
    Intersects,
    NotIntersects,
    /// 仅比较包围盒的相交
    IntersectsBox,
    NotIntersectsBox,
    Within,
    NotWithin,
    Contains,
    NotContains,

    // 布尔
    True,
    False,

    // 设备与对象引用
    Device,
    Devices,
    Polygon,
    MultiPolygon,
    Line,
    MultiLine,
    Point,
    MultiPoint,
    Rect,
    Circle,
    Collection,
    FeatureCollection,
    Objects,

    // 修饰符
    Radius,
    Distance,
    BBox,
    Duration,
    After,
    Trigger,

    // 设备属性
    Imei,
    Owner,
    Brand,
    Model,
    Status,
    Speed,
    Battery,
    Temperature,
    Humidity,
    Luminosity,
    Pressure,
    FuelLevel,
    Altitude,
    Latitude,
    Longitude,
    Year,
    Month,
    Week,
    Day,
    Hour,
    Minute,
    Time,
    Date,
}

/// 运算符优先级
pub const LOWEST_PREC: u8 = 0;

impl Token {
    /// 规范字符串
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Illegal => "ILLEGAL",
            Self::Eof => "EOF",
            Self::Int => "INT",
            Self::Float => "FLOAT",
            Self::String => "STRING",
            Self::Var => "@",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBrack => "[",
            Self::RBrack => "]",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::Comma => ",",
            Self::Period => ".",
            Self::Colon => ":",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Quo => "/",
            Self::Rem => "%",
            Self::Or => "OR",
            Self::And => "AND",
            Self::Not => "NOT",
            Self::Eql => "==",
            Self::Neq => "!=",
            Self::Lss => "<",
            Self::Gtr => ">",
            Self::Leq => "<=",
            Self::Geq => ">=",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Near => "NEAR",
            Self::NotNear => "NOT NEAR",
            Self::Intersects => "INTERSECTS",
            Self::NotIntersects => "NOT INTERSECTS",
            Self::IntersectsBox => "INTERSECTS-BOX",
            Self::NotIntersectsBox => "NOT INTERSECTS-BOX",
            Self::Within => "WITHIN",
            Self::NotWithin => "NOT WITHIN",
            Self::Contains => "CONTAINS",
            Self::NotContains => "NOT CONTAINS",
            Self::True => "true",
            Self::False => "false",
            Self::Device => "device",
            Self::Devices => "devices",
            Self::Polygon => "polygon",
            Self::MultiPolygon => "multiPolygon",
            Self::Line => "line",
            Self::MultiLine => "multiLine",
            Self::Point => "point",
            Self::MultiPoint => "multiPoint",
            Self::Rect => "rect",
            Self::Circle => "circle",
            Self::Collection => "collection",
            Self::FeatureCollection => "featureCollection",
            Self::Objects => "objects",
            Self::Radius => "radius",
            Self::Distance => "distance",
            Self::BBox => "bbox",
            Self::Duration => "duration",
            Self::After => "after",
            Self::Trigger => "trigger",
            Self::Imei => "imei",
            Self::Owner => "owner",
            Self::Brand => "brand",
            Self::Model => "model",
            Self::Status => "status",
            Self::Speed => "speed",
            Self::Battery => "battery",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Luminosity => "luminosity",
            Self::Pressure => "pressure",
            Self::FuelLevel => "fuelLevel",
            Self::Altitude => "altitude",
            Self::Latitude => "latitude",
            Self::Longitude => "longitude",
            Self::Year => "year",
            Self::Month => "month",
            Self::Week => "week",
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Minute => "minute",
            Self::Time => "time",
            Self::Date => "date",
        }
    }

    /// 二元运算符优先级：OR(1) < AND(2) < 比较/集合/空间(3)，其余为 0
    pub fn precedence(self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And => 2,
            t if t.is_comparison() || t.is_membership() || t.is_spatial() => 3,
            _ => LOWEST_PREC,
        }
    }

    pub fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eql | Self::Neq | Self::Lss | Self::Gtr | Self::Leq | Self::Geq
        )
    }

    pub fn is_membership(self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }

    pub fn is_spatial(self) -> bool {
        matches!(
            self,
            Self::Near
                | Self::NotNear
                | Self::Intersects
                | Self::NotIntersects
                | Self::IntersectsBox
                | Self::NotIntersectsBox
                | Self::Within
                | Self::NotWithin
                | Self::Contains
                | Self::NotContains
        )
    }

    /// 几何对象引用关键字，如 `polygon(@id)`
    pub fn is_object_ref(self) -> bool {
        matches!(
            self,
            Self::Polygon
                | Self::MultiPolygon
                | Self::Line
                | Self::MultiLine
                | Self::Point
                | Self::MultiPoint
                | Self::Rect
                | Self::Circle
                | Self::Collection
                | Self::FeatureCollection
                | Self::Objects
        )
    }

    /// 设备属性关键字
    pub fn is_property(self) -> bool {
        matches!(
            self,
            Self::Imei
                | Self::Owner
                | Self::Brand
                | Self::Model
                | Self::Status
                | Self::Speed
                | Self::Battery
                | Self::Temperature
                | Self::Humidity
                | Self::Luminosity
                | Self::Pressure
                | Self::FuelLevel
                | Self::Altitude
                | Self::Latitude
                | Self::Longitude
                | Self::Year
                | Self::Month
                | Self::Week
                | Self::Day
                | Self::Hour
                | Self::Minute
                | Self::Time
                | Self::Date
        )
    }

    /// 取反形式的复合运算符
    pub fn negated(self) -> Option<Token> {
        match self {
            Self::In => Some(Self::NotIn),
            Self::Near => Some(Self::NotNear),
            Self::Intersects => Some(Self::NotIntersects),
            Self::IntersectsBox => Some(Self::NotIntersectsBox),
            Self::Within => Some(Self::NotWithin),
            Self::Contains => Some(Self::NotContains),
            _ => None,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 不区分大小写的关键字
const FOLDED: &[Token] = &[
    Token::And,
    Token::Or,
    Token::Not,
    Token::In,
    Token::Near,
    Token::Intersects,
    Token::Within,
    Token::Contains,
    Token::True,
    Token::False,
];

/// 区分大小写的关键字
const EXACT: &[Token] = &[
    Token::Device,
    Token::Devices,
    Token::Polygon,
    Token::MultiPolygon,
    Token::Line,
    Token::MultiLine,
    Token::Point,
    Token::MultiPoint,
    Token::Rect,
    Token::Circle,
    Token::Collection,
    Token::FeatureCollection,
    Token::Objects,
    Token::Radius,
    Token::Distance,
    Token::BBox,
    Token::Duration,
    Token::After,
    Token::Trigger,
    Token::Imei,
    Token::Owner,
    Token::Brand,
    Token::Model,
    Token::Status,
    Token::Speed,
    Token::Battery,
    Token::Temperature,
    Token::Humidity,
    Token::Luminosity,
    Token::Pressure,
    Token::FuelLevel,
    Token::Altitude,
    Token::Latitude,
    Token::Longitude,
    Token::Year,
    Token::Month,
    Token::Week,
    Token::Day,
    Token::Hour,
    Token::Minute,
    Token::Time,
    Token::Date,
];

/// 关键字反查表
#[derive(Debug)]
pub struct Keywords {
    exact: HashMap<&'static str, Token>,
    folded: HashMap<String, Token>,
}

impl Keywords {
    pub fn new() -> Self {
        let exact = EXACT.iter().map(|t| (t.as_str(), *t)).collect();
        let folded = FOLDED
            .iter()
            .map(|t| (t.as_str().to_ascii_lowercase(), *t))
            .collect();
        Self { exact, folded }
    }

    /// 查找关键字，逻辑/空间运算符不区分大小写
    pub fn lookup(&self, word: &str) -> Option<Token> {
        if let Some(t) = self.exact.get(word) {
            return Some(*t);
        }
        self.folded.get(&word.to_ascii_lowercase()).copied()
    }
}

impl Default for Keywords {
    fn default() -> Self {
        Self::new()
    }
}

/// 进程级只读关键字表
pub static KEYWORDS: LazyLock<Keywords> = LazyLock::new(Keywords::new);
