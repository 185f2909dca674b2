//! 地理围栏引擎
//!
//! 把规则注册、设备快照与状态索引组织在一起：设备上报时查出其位置上的候选规则，
//! 逐条评估，匹配且通过触发频率检查的规则生成事件。

use crate::error::{Result, RuleError};
use crate::evaluator::EvalContext;
use crate::executor::{RuleExecutor, fire};
use crate::models::{Device, EvaluationResult, Event, RuleRecord, RuleSpec};
use crate::objects::ObjectStore;
use crate::rule::Rule;
use crate::spatial::{DeviceIndex, RuleIndex};
use crate::state::{StateId, StateIndex};
use geofence_shared::config::EngineConfig;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// 地理围栏引擎
pub struct Engine {
    config: EngineConfig,
    rules: RuleIndex,
    devices: DeviceIndex,
    states: StateIndex,
    objects: Arc<dyn ObjectStore>,
    executor: RuleExecutor,
}

impl Engine {
    /// 使用默认配置创建引擎
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self::with_config(EngineConfig::default(), objects)
    }

    pub fn with_config(config: EngineConfig, objects: Arc<dyn ObjectStore>) -> Self {
        let devices = DeviceIndex::new(config.circle_steps);
        Self {
            config,
            rules: RuleIndex::new(),
            devices,
            states: StateIndex::new(),
            objects,
            executor: RuleExecutor::new(),
        }
    }

    /// 启用评估追踪
    pub fn with_trace(mut self) -> Self {
        self.executor = RuleExecutor::new().with_trace();
        self
    }

    /// 注册规则：解析、编译并写入空间索引
    ///
    /// 编译失败的规则不会进入任何索引，错误原样返回（含字节偏移）。
    #[instrument(skip(self, spec), fields(rule_name = %spec.name))]
    pub fn register(&self, spec: RuleSpec) -> Result<Arc<Rule>> {
        let rule = Arc::new(Rule::new(spec, &self.config)?);
        self.rules.insert(Arc::clone(&rule))?;
        info!("规则已注册: {}", rule.id);
        Ok(rule)
    }

    /// 批量注册，返回成功的规则 ID；失败的规则记录日志后跳过
    #[instrument(skip(self, specs))]
    pub fn register_batch(&self, specs: Vec<RuleSpec>) -> Result<Vec<String>> {
        let mut loaded_ids = Vec::with_capacity(specs.len());
        let mut errors = Vec::new();

        for spec in specs {
            let name = spec.name.clone();
            match self.register(spec) {
                Ok(rule) => loaded_ids.push(rule.id.clone()),
                Err(e) => errors.push((name, e)),
            }
        }

        if !errors.is_empty() {
            warn!("批量注册部分失败: {:?}", errors);
        }

        info!("批量注册完成: {} 成功, {} 失败", loaded_ids.len(), errors.len());
        Ok(loaded_ids)
    }

    /// 从编码恢复规则，保留原规则 ID 与区域 ID
    #[instrument(skip(self, record), fields(rule_id = %record.rule_id))]
    pub fn insert_rule(&self, record: RuleRecord) -> Result<Arc<Rule>> {
        let rule = Arc::new(Rule::from_record(record, &self.config)?);
        self.rules.insert(Arc::clone(&rule))?;
        Ok(rule)
    }

    /// 删除规则，级联删除其全部状态
    #[instrument(skip(self))]
    pub fn delete_rule(&self, rule_id: &str) -> Result<Arc<Rule>> {
        let rule = self.rules.delete(rule_id)?;
        let removed = self.states.remove_by_rule(rule_id);
        debug!(states = removed, "已级联删除规则状态");
        Ok(rule)
    }

    pub fn find_rule(&self, rule_id: &str) -> Result<Arc<Rule>> {
        self.rules.lookup(rule_id)
    }

    /// 按条件筛选规则
    pub fn find_rules(&self, filter: impl Fn(&Rule) -> bool) -> Vec<Arc<Rule>> {
        let mut out = Vec::new();
        self.rules.walk(|rule| {
            if filter(rule) {
                out.push(Arc::clone(rule));
            }
            true
        });
        out
    }

    /// 访问设备当前位置上的候选规则，回调返回 false 时停止
    pub fn walk(&self, device: &Device, mut visit: impl FnMut(&Arc<Rule>) -> bool) {
        for rule in self.rules.find_candidates(device.latitude, device.longitude) {
            if !visit(&rule) {
                break;
            }
        }
    }

    /// 写入或替换设备快照
    pub fn upsert_device(&self, device: Device) -> Result<Arc<Device>> {
        self.devices.upsert(device)
    }

    /// 删除设备，级联删除其全部状态
    #[instrument(skip(self))]
    pub fn delete_device(&self, imei: &str) -> Result<Arc<Device>> {
        let device = self.devices.delete(imei)?;
        let removed = self.states.remove_by_device(imei);
        debug!(states = removed, "已级联删除设备状态");
        Ok(device)
    }

    pub fn lookup_device(&self, imei: &str) -> Result<Arc<Device>> {
        self.devices.lookup(imei)
    }

    /// 对单条规则评估设备快照，不经过触发频率检查
    pub fn evaluate(
        &self,
        cancel: &CancellationToken,
        rule: &Rule,
        device: &Device,
    ) -> Result<EvaluationResult> {
        self.evaluate_at(cancel, rule, device, device.timestamp().timestamp())
    }

    fn evaluate_at(
        &self,
        cancel: &CancellationToken,
        rule: &Rule,
        device: &Device,
        now: i64,
    ) -> Result<EvaluationResult> {
        let ctx = EvalContext {
            device,
            rule_id: &rule.id,
            objects: self.objects.as_ref(),
            devices: &self.devices,
            states: &self.states,
            cancel,
            circle_steps: self.config.circle_steps,
            now,
        };
        let result = self.executor.execute(&rule.id, &rule.name, &rule.program, &ctx);
        self.discard_orphan(&StateId::new(device.imei.as_str(), rule.id.as_str()), false);
        result
    }

    /// 评估期间规则（或已索引的设备）被删除时，丢弃这次评估写入的状态
    ///
    /// 状态写入先于这里的检查完成：若检查时规则仍在，之后的删除一定会级联到它。
    fn discard_orphan(&self, id: &StateId, device_indexed: bool) {
        let orphaned = !self.rules.contains(&id.rule_id)
            || (device_indexed && self.devices.lookup(&id.imei).is_err());
        if orphaned && self.states.remove(id).is_ok() {
            debug!(imei = %id.imei, rule_id = %id.rule_id, "规则或设备已删除，丢弃评估状态");
        }
    }

    /// 处理一次设备上报，返回触发的事件
    ///
    /// 单条规则评估失败只记录日志并跳过；取消会中止整个检测。
    #[instrument(skip(self, cancel, device), fields(imei = %device.imei))]
    pub fn detect(&self, cancel: &CancellationToken, device: Device) -> Result<Vec<Event>> {
        let start = Instant::now();
        let device = self.upsert_device(device)?;
        let now = device.timestamp().timestamp();
        let mut events = Vec::new();

        for rule in self.rules.find_candidates(device.latitude, device.longitude) {
            if cancel.is_cancelled() {
                return Err(RuleError::Cancelled);
            }
            counter!("geofence_rule_evaluations_total").increment(1);

            let result = match self.evaluate_at(cancel, &rule, &device, now) {
                Ok(result) => result,
                Err(RuleError::Cancelled) => return Err(RuleError::Cancelled),
                Err(e) => {
                    counter!("geofence_rule_errors_total").increment(1);
                    warn!(rule_id = %rule.id, error = %e, "规则评估失败，已跳过");
                    continue;
                }
            };
            if !result.matched {
                continue;
            }

            let id = StateId::new(device.imei.as_str(), rule.id.as_str());
            let fired = fire(&self.states, &id, rule.trigger(), now);
            self.discard_orphan(&id, true);
            match fired {
                Ok(true) => {}
                Ok(false) => {
                    debug!(rule_id = %rule.id, "触发频率限制，事件被抑制");
                    continue;
                }
                Err(e) => {
                    counter!("geofence_rule_errors_total").increment(1);
                    warn!(rule_id = %rule.id, error = %e, "触发状态更新失败，已跳过");
                    continue;
                }
            }

            counter!("geofence_events_total").increment(1);
            events.push(Event::new(&rule, &device, result.matches));
        }

        histogram!("geofence_detect_duration_seconds").record(start.elapsed().as_secs_f64());
        debug!(events = events.len(), "检测完成");
        Ok(events)
    }

    /// 获取引擎统计信息
    pub fn stats(&self) -> EngineStats {
        let (fine_cells, coarse_cells) = self.rules.cell_counts();
        EngineStats {
            rules_count: self.rules.len(),
            devices_count: self.devices.len(),
            states_count: self.states.len(),
            fine_cells,
            coarse_cells,
            device_cells: self.devices.cell_count(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn states(&self) -> &StateIndex {
        &self.states
    }
}

/// 引擎统计信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub rules_count: usize,
    pub devices_count: usize,
    pub states_count: usize,
    /// 细粒度层非空单元数
    pub fine_cells: usize,
    /// 粗粒度层非空单元数
    pub coarse_cells: usize,
    pub device_cells: usize,
}
