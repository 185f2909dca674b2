//! 规则编译器
//!
//! 遍历语法树：逻辑连接符 AND/OR 依次记入 `ops`，两侧均为叶子的二元表达式
//! 编译为一个求值节点记入 `nodes`。同时保留一棵只含节点下标与 AND/OR 的布尔树，
//! 执行器据此短路求值，括号分组的语义因此得以保留。

use crate::ast::{Expr, ListKind, ListLit, Qualifier, Scalar, Trigger};
use crate::error::{Result, RuleError};
use crate::operators::*;
use crate::parser::parse;
use crate::token::Token;
use std::collections::HashSet;

/// 布尔组合树
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// `nodes` 中的下标
    Node(usize),
    And(Box<Step>, Box<Step>),
    Or(Box<Step>, Box<Step>),
}

/// 编译结果
#[derive(Debug, Clone)]
pub struct Program {
    /// 按从左到右顺序排列的求值节点
    pub nodes: Vec<Node>,
    /// 节点之间的连接符，长度恒为 `nodes.len() - 1`
    pub ops: Vec<Token>,
    pub root: Step,
    pub trigger: Option<Trigger>,
}

impl Program {
    /// 解析并编译规格文本
    pub fn from_source(src: &str) -> Result<Self> {
        let expr = parse(src)?;
        RuleCompiler::new().compile(&expr)
    }

    /// 是否包含需要访问空间索引的节点
    pub fn is_spatial(&self) -> bool {
        self.nodes.iter().any(|n| matches!(n, Node::Spatial(_)))
    }
}

/// 规则编译器
#[derive(Default)]
pub struct RuleCompiler {
    nodes: Vec<Node>,
    ops: Vec<Token>,
}

impl RuleCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 编译语法树
    pub fn compile(mut self, expr: &Expr) -> Result<Program> {
        let (body, trigger) = match expr {
            Expr::Spec(spec) => (spec.expr.as_ref(), Some(spec.trigger)),
            other => (other, None),
        };
        let root = self.walk(body)?;

        if self.nodes.len() != self.ops.len() + 1 {
            return Err(RuleError::invalid_expr(
                "BINARY",
                expr.pos(),
                format!(
                    "{} nodes joined by {} connectives",
                    self.nodes.len(),
                    self.ops.len()
                ),
            ));
        }

        Ok(Program {
            nodes: self.nodes,
            ops: self.ops,
            root,
            trigger,
        })
    }

    fn walk(&mut self, expr: &Expr) -> Result<Step> {
        match expr {
            Expr::Binary(b) if b.op.is_logical() => {
                let lhs = self.walk(&b.lhs)?;
                self.ops.push(b.op);
                let rhs = self.walk(&b.rhs)?;
                Ok(match b.op {
                    Token::And => Step::And(Box::new(lhs), Box::new(rhs)),
                    _ => Step::Or(Box::new(lhs), Box::new(rhs)),
                })
            }
            Expr::Binary(b) => {
                let (lhs, rhs) = (unwrap_leaf(&b.lhs), unwrap_leaf(&b.rhs));
                if !lhs.is_leaf() || !rhs.is_leaf() {
                    return Err(RuleError::invalid_expr(
                        "LEAF",
                        b.pos,
                        format!("operands of {} must be literals or identifiers", b.op),
                    ));
                }
                let node = make_op(lhs, b.op, rhs, b.pos)?;
                self.nodes.push(node);
                Ok(Step::Node(self.nodes.len() - 1))
            }
            Expr::Paren(p) => self.walk(&p.expr),
            Expr::Spec(s) => Err(RuleError::invalid_expr(
                "BINARY",
                s.pos,
                "trigger clause must close the specification",
            )),
            leaf => Err(RuleError::invalid_expr(
                "BINARY",
                leaf.pos(),
                format!("dangling operand {leaf}"),
            )),
        }
    }
}

/// 去掉只包住一个叶子的括号
fn unwrap_leaf(expr: &Expr) -> &Expr {
    match expr {
        Expr::Paren(p) if unwrap_leaf(&p.expr).is_leaf() => unwrap_leaf(&p.expr),
        other => other,
    }
}

/// 由 (左叶子, 运算符, 右叶子) 构造求值节点，并做类型检查
pub fn make_op(lhs: &Expr, op: Token, rhs: &Expr, pos: usize) -> Result<Node> {
    if op.is_comparison() {
        return match (lhs, rhs) {
            (Expr::Ident(id), value) => compare(id.kind, op, value, pos),
            (value, Expr::Ident(id)) => compare(id.kind, mirror(op), value, pos),
            _ => Err(RuleError::invalid_expr(
                "IDENT",
                pos,
                format!("{op} needs a device property on one side"),
            )),
        };
    }
    if op.is_membership() {
        return match (lhs, rhs) {
            (Expr::Ident(id), Expr::List(list)) => membership(id.kind, op == Token::NotIn, list),
            _ => Err(RuleError::invalid_expr(
                "IDENT IN LIST",
                pos,
                format!("{op} needs a device property and a list"),
            )),
        };
    }
    if op.is_spatial() {
        return spatial(lhs, op, rhs, pos);
    }
    Err(RuleError::invalid_expr(
        "OPERATOR",
        pos,
        format!("unsupported operator {op}"),
    ))
}

fn family(field: Token, pos: usize) -> Result<Family> {
    Family::of(field).ok_or_else(|| {
        RuleError::invalid_expr("IDENT", pos, format!("{field} is not a device property"))
    })
}

fn compare(field: Token, op: Token, value: &Expr, pos: usize) -> Result<Node> {
    let family = family(field, pos)?;
    let value = match (family, value) {
        (Family::Numeric, Expr::Int(v)) => Operand::Number(v.value as f64),
        (Family::Numeric, Expr::Float(v)) => Operand::Number(v.value),
        (Family::Text, Expr::String(v)) => Operand::Text(v.value.clone()),
        (Family::Time, Expr::Time(v)) => Operand::Time(v.value),
        (family, other) => {
            return Err(RuleError::invalid_expr(
                family.expected(),
                other.pos(),
                format!("{field} cannot be compared with {other}"),
            ));
        }
    };
    Ok(Node::Compare(CompareNode {
        field,
        op,
        value,
        pos,
    }))
}

fn membership(field: Token, negate: bool, list: &ListLit) -> Result<Node> {
    let family = family(field, list.pos)?;
    let compatible = matches!(
        (family, list.typ),
        (Family::Numeric, Token::Int | Token::Float)
            | (Family::Text, Token::String)
            | (Family::Time, Token::Time)
    );
    if !compatible {
        return Err(RuleError::invalid_expr(
            family.expected(),
            list.pos,
            format!("{field} cannot be matched against a {} list", list.typ),
        ));
    }

    if list.kind == ListKind::Range {
        let [begin, end] = [&list.items[0], &list.items[1]].map(operand);
        return Ok(Node::Range(RangeNode {
            field,
            negate,
            begin,
            end,
            pos: list.pos,
        }));
    }

    let set = match family {
        Family::Numeric => ValueSet::Numbers(list.items.iter().filter_map(as_number).collect()),
        Family::Text => ValueSet::Texts(
            list.items
                .iter()
                .filter_map(|s| match s {
                    Scalar::String(v) => Some(v.clone()),
                    _ => None,
                })
                .collect::<HashSet<_>>(),
        ),
        Family::Time => ValueSet::Times(
            list.items
                .iter()
                .filter_map(|s| match s {
                    Scalar::Time(t) => Some(*t),
                    _ => None,
                })
                .collect(),
        ),
    };
    Ok(Node::Membership(MembershipNode {
        field,
        negate,
        set,
        pos: list.pos,
    }))
}

fn as_number(s: &Scalar) -> Option<f64> {
    match s {
        Scalar::Int(v) => Some(*v as f64),
        Scalar::Float(v) => Some(*v),
        _ => None,
    }
}

fn operand(s: &Scalar) -> Operand {
    match s {
        Scalar::Int(v) => Operand::Number(*v as f64),
        Scalar::Float(v) => Operand::Number(*v),
        Scalar::String(v) => Operand::Text(v.clone()),
        Scalar::Time(t) => Operand::Time(*t),
    }
}

fn spatial(lhs: &Expr, op: Token, rhs: &Expr, pos: usize) -> Result<Node> {
    let (op, device, target) = match (lhs, rhs) {
        (Expr::Device(d), Expr::Object(o)) => (op, d.qualifier, object_target(o)),
        (Expr::Object(o), Expr::Device(d)) => (mirror(op), d.qualifier, object_target(o)),
        (Expr::Device(d), Expr::Devices(ds)) | (Expr::Devices(ds), Expr::Device(d)) => {
            only_proximity(op, pos)?;
            (
                op,
                d.qualifier,
                Target::Devices {
                    refs: ds.refs.clone(),
                    qualifier: ds.qualifier,
                    after: ds.after,
                },
            )
        }
        (Expr::Device(a), Expr::Device(b)) => {
            only_proximity(op, pos)?;
            let qualifier = a.qualifier.or(b.qualifier).ok_or_else(|| {
                RuleError::invalid_expr(
                    ":radius|:bbox",
                    pos,
                    "device to device proximity needs a radius or bbox",
                )
            })?;
            (op, None, Target::Nearby { qualifier })
        }
        _ => {
            return Err(RuleError::invalid_expr(
                "DEVICE",
                pos,
                format!("{op} needs device on one side and objects, devices or device on the other"),
            ));
        }
    };
    Ok(Node::Spatial(SpatialNode {
        op,
        device,
        target,
        pos,
    }))
}

fn object_target(o: &crate::ast::ObjectLit) -> Target {
    Target::Objects {
        kind: o.kind,
        refs: o.refs.clone(),
        qualifier: o.qualifier,
        after: o.after,
    }
}

/// WITHIN/CONTAINS 只对几何对象有意义
fn only_proximity(op: Token, pos: usize) -> Result<()> {
    match op {
        Token::Near
        | Token::NotNear
        | Token::Intersects
        | Token::NotIntersects
        | Token::IntersectsBox
        | Token::NotIntersectsBox => Ok(()),
        _ => Err(RuleError::invalid_expr(
            "NEAR|INTERSECTS",
            pos,
            format!("{op} is only defined against objects"),
        )),
    }
}

/// 交换左右操作数后的等价运算符
fn mirror(op: Token) -> Token {
    match op {
        Token::Lss => Token::Gtr,
        Token::Gtr => Token::Lss,
        Token::Leq => Token::Geq,
        Token::Geq => Token::Leq,
        Token::Within => Token::Contains,
        Token::Contains => Token::Within,
        Token::NotWithin => Token::NotContains,
        Token::NotContains => Token::NotWithin,
        other => other,
    }
}

/// 合并设备与对象两侧的距离修饰符：半径相加，任一侧为 bbox 时结果为 bbox
pub fn widen(device: Option<Qualifier>, object: Option<Qualifier>) -> Option<Qualifier> {
    match (device, object) {
        (None, None) => None,
        (Some(q), None) | (None, Some(q)) => Some(q),
        (Some(a), Some(b)) => {
            let meters = a.meters() + b.meters();
            if matches!(a, Qualifier::BBox(_)) || matches!(b, Qualifier::BBox(_)) {
                Some(Qualifier::BBox(meters))
            } else {
                Some(Qualifier::Radius(meters))
            }
        }
    }
}
