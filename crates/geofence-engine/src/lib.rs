//! 地理围栏规则引擎
//!
//! 提供基于规格文本的设备遥测规则评估能力，支持：
//! - 规格语言的词法/语法分析
//! - 编译为类型化的求值节点与短路求值执行
//! - 细/粗两层网格分桶的规则空间索引与设备空间索引
//! - (设备, 规则) 状态跟踪与触发频率控制

pub mod ast;
pub mod compiler;
pub mod duration;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod geometry;
pub mod grid;
pub mod lexer;
pub mod models;
pub mod objects;
pub mod operators;
pub mod parser;
pub mod rule;
pub mod sharded;
pub mod spatial;
pub mod state;
pub mod token;

pub use ast::{Expr, Qualifier, Trigger};
pub use compiler::{Program, RuleCompiler, Step};
pub use engine::{Engine, EngineStats};
pub use error::{ParseError, Result, RuleError};
pub use evaluator::{EvalContext, NodeEvaluator, float64_equal};
pub use executor::RuleExecutor;
pub use models::{Decl, Device, EvaluationResult, Event, Match, RuleRecord, RuleSpec, Tier};
pub use objects::{GeoObject, MemoryObjectStore, ObjectStore};
pub use operators::Node;
pub use parser::parse;
pub use rule::Rule;
pub use spatial::{DeviceIndex, RuleIndex};
pub use state::{State, StateId, StateIndex};
pub use token::Token;
