//! 规则执行器
//!
//! 按布尔树短路求值编译后的规则，返回匹配结果和评估追踪信息；
//! 规则匹配后再由 [`fire`] 依据触发频率决定是否产生事件。

use crate::ast::Trigger;
use crate::compiler::{Program, Step};
use crate::error::Result;
use crate::evaluator::{EvalContext, NodeEvaluator};
use crate::models::EvaluationResult;
use crate::state::{StateId, StateIndex};
use std::time::Instant;

/// 规则执行器
pub struct RuleExecutor {
    /// 是否记录详细评估追踪
    trace_enabled: bool,
}

impl RuleExecutor {
    pub fn new() -> Self {
        Self {
            trace_enabled: false,
        }
    }

    /// 启用评估追踪
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    /// 执行规则评估
    pub fn execute(
        &self,
        rule_id: &str,
        rule_name: &str,
        program: &Program,
        ctx: &EvalContext<'_>,
    ) -> Result<EvaluationResult> {
        let start = Instant::now();
        let mut result = EvaluationResult::new(rule_id.to_string(), rule_name.to_string());

        result.matched = self.evaluate_step(&program.root, program, ctx, &mut result)?;
        if !result.matched {
            result.matches.clear();
        }
        result.evaluation_time_us = start.elapsed().as_micros() as u64;

        Ok(result)
    }

    fn evaluate_step(
        &self,
        step: &Step,
        program: &Program,
        ctx: &EvalContext<'_>,
        result: &mut EvaluationResult,
    ) -> Result<bool> {
        match step {
            Step::Node(idx) => {
                let node = &program.nodes[*idx];
                let m = NodeEvaluator::evaluate(node, ctx)?;
                let ok = m.ok;

                if self.trace_enabled {
                    result.evaluation_trace.push(format!(
                        "node[{}] @{}: {} => {}",
                        idx,
                        node.pos(),
                        node,
                        if ok { "MATCHED" } else { "NOT_MATCHED" }
                    ));
                }
                if ok {
                    result.matches.push(m);
                }
                Ok(ok)
            }
            Step::And(lhs, rhs) => {
                // AND: 左侧不满足时右侧不再求值
                if !self.evaluate_step(lhs, program, ctx, result)? {
                    if self.trace_enabled {
                        result.evaluation_trace.push("AND 短路".to_string());
                    }
                    return Ok(false);
                }
                self.evaluate_step(rhs, program, ctx, result)
            }
            Step::Or(lhs, rhs) => {
                // OR: 左侧满足时右侧不再求值
                if self.evaluate_step(lhs, program, ctx, result)? {
                    if self.trace_enabled {
                        result.evaluation_trace.push("OR 短路".to_string());
                    }
                    return Ok(true);
                }
                self.evaluate_step(rhs, program, ctx, result)
            }
        }
    }
}

impl Default for RuleExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// 已匹配的规则是否产生事件
///
/// 无 `:trigger` 子句时每次匹配都触发；否则读取并更新 (设备, 规则) 状态。
pub fn fire(states: &StateIndex, id: &StateId, trigger: Option<Trigger>, now: i64) -> Result<bool> {
    let Some(trigger) = trigger else {
        return Ok(true);
    };

    states.modify(id, |state| {
        state.last_seen = now;
        let fired = match trigger {
            Trigger::Once => {
                let first = state.hits == 0;
                state.hits = 1;
                first
            }
            Trigger::Every(period) => {
                state.last_fired == 0 || (now - state.last_fired) as f64 >= period.as_secs_f64()
            }
            Trigger::Times { count, interval } => {
                if state.window_start == 0
                    || (now - state.window_start) as f64 >= interval.as_secs_f64()
                {
                    state.window_start = now;
                    state.hits = 0;
                }
                state.hits += 1;
                if state.hits >= count {
                    state.hits = 0;
                    state.window_start = 0;
                    true
                } else {
                    false
                }
            }
        };
        if fired {
            state.last_fired = now;
        }
        fired
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Device;
    use crate::objects::MemoryObjectStore;
    use crate::spatial::DeviceIndex;
    use crate::token::Token;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        objects: MemoryObjectStore,
        devices: DeviceIndex,
        states: StateIndex,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                objects: MemoryObjectStore::new(),
                devices: DeviceIndex::new(36),
                states: StateIndex::new(),
                cancel: CancellationToken::new(),
            }
        }

        fn run(&self, executor: &RuleExecutor, src: &str, device: &Device) -> EvaluationResult {
            let program = Program::from_source(src).unwrap();
            let ctx = EvalContext {
                device,
                rule_id: "r1",
                objects: &self.objects,
                devices: &self.devices,
                states: &self.states,
                cancel: &self.cancel,
                circle_steps: 36,
                now: 0,
            };
            executor.execute("r1", "test", &program, &ctx).unwrap()
        }
    }

    fn device(speed: f64, battery: f64) -> Device {
        Device {
            speed,
            battery,
            ..Device::new("d1", 10.0, 20.0)
        }
    }

    #[test]
    fn test_and_short_circuit() {
        let f = Fixture::new();
        let executor = RuleExecutor::new().with_trace();
        let result = f.run(
            &executor,
            "speed > 1 AND battery > 50 AND speed < 100",
            &device(10.0, 20.0),
        );

        assert!(!result.matched);
        assert!(result.matches.is_empty());
        // 第三个节点未被求值
        let evaluated = result
            .evaluation_trace
            .iter()
            .filter(|t| t.starts_with("node["))
            .count();
        assert_eq!(evaluated, 2);
        assert!(result.evaluation_trace.iter().any(|t| t.contains("AND 短路")));
    }

    #[test]
    fn test_or_short_circuit_collects_matches() {
        let f = Fixture::new();
        let executor = RuleExecutor::new().with_trace();
        let result = f.run(&executor, "speed > 1 OR battery > 50", &device(10.0, 20.0));

        assert!(result.matched);
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].operator, Token::Gtr);
        assert_eq!(result.matches[0].left.keyword, "speed");
        assert!(!result.evaluation_trace.iter().any(|t| t.starts_with("node[1]")));
    }

    #[test]
    fn test_parentheses_change_grouping() {
        let f = Fixture::new();
        let executor = RuleExecutor::new();
        let d = device(0.0, 20.0);

        // speed > 1 OR (battery > 10 AND speed == 0)
        assert!(f.run(&executor, "speed > 1 OR battery > 10 AND speed == 0", &d).matched);
        assert!(!f.run(&executor, "(speed > 1 OR battery > 10) AND speed > 0", &d).matched);
        assert!(f.run(&executor, "(speed > 1 OR battery > 10) AND speed == 0", &d).matched);
    }

    #[test]
    fn test_trace_disabled_by_default() {
        let f = Fixture::new();
        let result = f.run(&RuleExecutor::default(), "speed > 1", &device(10.0, 0.0));
        assert!(result.matched);
        assert!(result.evaluation_trace.is_empty());
    }

    #[test]
    fn test_fire_without_trigger() {
        let states = StateIndex::new();
        let id = StateId::new("d1", "r1");
        assert!(fire(&states, &id, None, 100).unwrap());
        assert!(fire(&states, &id, None, 100).unwrap());
        assert!(states.is_empty());
    }

    #[test]
    fn test_fire_once() {
        let states = StateIndex::new();
        let id = StateId::new("d1", "r1");
        assert!(fire(&states, &id, Some(Trigger::Once), 100).unwrap());
        assert!(!fire(&states, &id, Some(Trigger::Once), 200).unwrap());
        assert!(!fire(&states, &id, Some(Trigger::Once), 300).unwrap());
        // 其它设备独立计数
        assert!(fire(&states, &StateId::new("d2", "r1"), Some(Trigger::Once), 300).unwrap());
    }

    #[test]
    fn test_fire_every() {
        let states = StateIndex::new();
        let id = StateId::new("d1", "r1");
        let every = Some(Trigger::Every(Duration::from_secs(60)));
        assert!(fire(&states, &id, every, 1_000).unwrap());
        assert!(!fire(&states, &id, every, 1_030).unwrap());
        assert!(fire(&states, &id, every, 1_060).unwrap());
        assert!(!fire(&states, &id, every, 1_100).unwrap());
        assert_eq!(states.lookup(&id).unwrap().last_fired, 1_060);
    }

    #[test]
    fn test_fire_times_in_window() {
        let states = StateIndex::new();
        let id = StateId::new("d1", "r1");
        let times = Some(Trigger::Times {
            count: 3,
            interval: Duration::from_secs(100),
        });
        assert!(!fire(&states, &id, times, 1_000).unwrap());
        assert!(!fire(&states, &id, times, 1_010).unwrap());
        assert!(fire(&states, &id, times, 1_020).unwrap());

        // 窗口过期后重新计数
        assert!(!fire(&states, &id, times, 1_030).unwrap());
        assert!(!fire(&states, &id, times, 1_200).unwrap());
        assert!(!fire(&states, &id, times, 1_210).unwrap());
        assert!(fire(&states, &id, times, 1_220).unwrap());
    }

    fn fire_from_threads(
        states: &Arc<StateIndex>,
        trigger: Trigger,
        threads: usize,
        calls: usize,
    ) -> usize {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let states = Arc::clone(states);
                std::thread::spawn(move || {
                    let id = StateId::new("d1", "r1");
                    (0..calls)
                        .filter(|_| fire(&states, &id, Some(trigger), 1_000).unwrap())
                        .count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    }

    #[test]
    fn test_concurrent_fire_once() {
        let states = Arc::new(StateIndex::new());
        assert_eq!(fire_from_threads(&states, Trigger::Once, 8, 20), 1);
    }

    #[test]
    fn test_concurrent_fire_times_counts_every_hit() {
        let states = Arc::new(StateIndex::new());
        let times = Trigger::Times {
            count: 4,
            interval: Duration::from_secs(100),
        };
        assert_eq!(fire_from_threads(&states, times, 8, 50), 100);
        assert_eq!(states.lookup(&StateId::new("d1", "r1")).unwrap().hits, 0);
    }
}
