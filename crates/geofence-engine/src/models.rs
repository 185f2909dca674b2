//! 规则引擎领域模型

use crate::ast::TimeOfDay;
use crate::rule::Rule;
use crate::token::Token;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use uuid::Uuid;

/// 设备状态快照
///
/// 由外部系统推送，引擎只读；时间戳为 Unix 秒，0 表示未知（评估时取当前时间）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Device {
    pub imei: String,
    pub owner: String,
    pub brand: String,
    pub model: String,
    pub status: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub speed: f64,
    pub battery: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub luminosity: f64,
    pub pressure: f64,
    pub fuel_level: f64,
    pub date_time: i64,
}

impl Device {
    pub fn new(imei: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            imei: imei.into(),
            latitude,
            longitude,
            ..Default::default()
        }
    }

    /// 快照时间，未设置时取当前时间
    pub fn timestamp(&self) -> DateTime<Utc> {
        if self.date_time == 0 {
            return Utc::now();
        }
        DateTime::from_timestamp(self.date_time, 0).unwrap_or_else(Utc::now)
    }

    /// 数值型属性
    pub fn number(&self, field: Token) -> Option<f64> {
        let v = match field {
            Token::Speed => self.speed,
            Token::Battery => self.battery,
            Token::Temperature => self.temperature,
            Token::Humidity => self.humidity,
            Token::Luminosity => self.luminosity,
            Token::Pressure => self.pressure,
            Token::FuelLevel => self.fuel_level,
            Token::Altitude => self.altitude,
            Token::Latitude => self.latitude,
            Token::Longitude => self.longitude,
            Token::Status => self.status as f64,
            Token::Year => f64::from(self.timestamp().year()),
            Token::Month => f64::from(self.timestamp().month()),
            Token::Week => f64::from(self.timestamp().iso_week().week()),
            Token::Day => f64::from(self.timestamp().day()),
            Token::Hour => f64::from(self.timestamp().hour()),
            Token::Minute => f64::from(self.timestamp().minute()),
            _ => return None,
        };
        Some(v)
    }

    /// 文本型属性
    pub fn text(&self, field: Token) -> Option<Cow<'_, str>> {
        match field {
            Token::Imei => Some(Cow::Borrowed(&self.imei)),
            Token::Owner => Some(Cow::Borrowed(&self.owner)),
            Token::Brand => Some(Cow::Borrowed(&self.brand)),
            Token::Model => Some(Cow::Borrowed(&self.model)),
            Token::Date => Some(Cow::Owned(self.timestamp().format("%Y-%m-%d").to_string())),
            _ => None,
        }
    }

    /// 一天中的时刻（UTC）
    pub fn time_of_day(&self) -> TimeOfDay {
        let ts = self.timestamp();
        TimeOfDay {
            hour: ts.hour() as u8,
            minute: ts.minute() as u8,
        }
    }
}

/// 匹配结果中的一侧声明：关键字 + 引用 ID
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decl {
    pub keyword: String,
    pub refs: Vec<String>,
}

impl Decl {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            refs: Vec::new(),
        }
    }

    pub fn with_refs(keyword: impl Into<String>, refs: Vec<String>) -> Self {
        Self {
            keyword: keyword.into(),
            refs,
        }
    }
}

/// 单个求值节点的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub ok: bool,
    pub left: Decl,
    pub right: Decl,
    pub operator: Token,
    pub pos: usize,
}

/// 规则评估结果
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub matched: bool,
    pub rule_id: String,
    pub rule_name: String,
    pub matches: Vec<Match>,
    pub evaluation_trace: Vec<String>,
    pub evaluation_time_us: u64,
}

impl EvaluationResult {
    pub fn new(rule_id: String, rule_name: String) -> Self {
        Self {
            matched: false,
            rule_id,
            rule_name,
            matches: Vec::new(),
            evaluation_trace: Vec::new(),
            evaluation_time_us: 0,
        }
    }
}

/// 规则触发事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub imei: String,
    pub latitude: f64,
    pub longitude: f64,
    pub matches: Vec<Match>,
    pub date_time: DateTime<Utc>,
}

impl Event {
    pub fn new(rule: &Rule, device: &Device, matches: Vec<Match>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            imei: device.imei.clone(),
            latitude: device.latitude,
            longitude: device.longitude,
            matches,
            date_time: device.timestamp(),
        }
    }
}

/// 规则所在的网格层
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Fine,
    Coarse,
}

impl Tier {
    /// 网格精度
    pub fn level(self) -> u8 {
        match self {
            Self::Fine => crate::grid::FINE_LEVEL,
            Self::Coarse => crate::grid::COARSE_LEVEL,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            crate::grid::FINE_LEVEL => Some(Self::Fine),
            crate::grid::COARSE_LEVEL => Some(Self::Coarse),
            _ => None,
        }
    }
}

/// 规则注册请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(default)]
    pub name: String,
    pub specification: String,
    pub latitude: f64,
    pub longitude: f64,
    /// 作用半径（米）
    pub radius: f64,
}

impl RuleSpec {
    pub fn new(
        name: impl Into<String>,
        specification: impl Into<String>,
        latitude: f64,
        longitude: f64,
        radius: f64,
    ) -> Self {
        Self {
            name: name.into(),
            specification: specification.into(),
            latitude,
            longitude,
            radius,
        }
    }
}

/// 规则的持久化/传输编码
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRecord {
    pub rule_id: String,
    pub name: String,
    /// 覆盖网格的精度
    pub region_size: u8,
    pub specification: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
    pub region_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_deserialization_defaults() {
        let device: Device = serde_json::from_value(json!({
            "imei": "860000000000001",
            "latitude": 42.33,
            "longitude": -72.23,
            "fuelLevel": 55.5,
            "dateTime": 1_700_000_000
        }))
        .unwrap();
        assert_eq!(device.imei, "860000000000001");
        assert_eq!(device.fuel_level, 55.5);
        assert_eq!(device.speed, 0.0);
    }

    #[test]
    fn test_time_derived_fields() {
        // 2023-11-14T22:13:20Z
        let mut device = Device::new("1", 0.0, 0.0);
        device.date_time = 1_700_000_000;
        assert_eq!(device.number(Token::Year), Some(2023.0));
        assert_eq!(device.number(Token::Month), Some(11.0));
        assert_eq!(device.number(Token::Day), Some(14.0));
        assert_eq!(device.number(Token::Hour), Some(22.0));
        assert_eq!(device.number(Token::Minute), Some(13.0));
        assert_eq!(device.number(Token::Week), Some(46.0));
        assert_eq!(device.text(Token::Date).as_deref(), Some("2023-11-14"));
        assert_eq!(device.time_of_day(), TimeOfDay { hour: 22, minute: 13 });
    }

    #[test]
    fn test_field_families_are_disjoint() {
        let device = Device::new("1", 1.0, 2.0);
        assert!(device.number(Token::Imei).is_none());
        assert!(device.text(Token::Speed).is_none());
        assert_eq!(device.number(Token::Longitude), Some(2.0));
    }

    #[test]
    fn test_rule_record_serialization() {
        let record = RuleRecord {
            rule_id: "r1".into(),
            name: "slow".into(),
            region_size: 9,
            specification: "speed < 5".into(),
            latitude: 1.0,
            longitude: 2.0,
            radius: 1000.0,
            region_ids: vec!["123".into()],
        };
        let text = serde_json::to_string(&record).unwrap();
        assert!(text.contains("\"regionSize\":9"));
        let back: RuleRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }
}
