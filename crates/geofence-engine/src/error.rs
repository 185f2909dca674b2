//! 规则引擎错误类型

use crate::token::Token;
use thiserror::Error;

/// 规则描述的语法错误
///
/// 携带出错的 token、原始字面量与字节偏移，便于规则作者定位问题。
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}: token={token}, literal={literal:?}, offset={offset}")]
pub struct ParseError {
    pub token: Token,
    pub literal: String,
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(
        token: Token,
        literal: impl Into<String>,
        offset: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            token,
            literal: literal.into(),
            offset,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("规则解析失败: {0}")]
    Parse(#[from] ParseError),

    #[error("无效的表达式: {message}, 期望 {expected} (offset={offset})")]
    InvalidExpr {
        expected: String,
        offset: usize,
        message: String,
    },

    #[error("无效的规则: {0}")]
    InvalidRule(String),

    #[error("无效的设备: {0}")]
    InvalidDevice(String),

    #[error("规则未找到: {0}")]
    RuleNotFound(String),

    #[error("设备未找到: {0}")]
    DeviceNotFound(String),

    #[error("对象未找到: {0}")]
    ObjectNotFound(String),

    #[error("状态未找到: imei={imei} rule_id={rule_id}")]
    StateNotFound { imei: String, rule_id: String },

    #[error("评估已取消")]
    Cancelled,
}

impl RuleError {
    pub(crate) fn invalid_expr(
        expected: impl Into<String>,
        offset: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidExpr {
            expected: expected.into(),
            offset,
            message: message.into(),
        }
    }

    /// 是否为“引用目标不存在”类错误，调用方可据此跳过而非中止
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RuleNotFound(_)
                | Self::DeviceNotFound(_)
                | Self::ObjectNotFound(_)
                | Self::StateNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RuleError>;
