//! Fan-out planning: one request becomes concrete tasks.
//!
//! Per-input operations get one task per qualifying input; batch operations
//! get a single task over the whole selection. When the operation declares
//! a fan-in step and the request enables it, one more task is appended that
//! waits for every planned task.

use serde_json::Value;

use crate::core::{framework_keys, Artifact, ConcreteTask, TaskParams, TaskRequest};
use crate::registry::{FanInSpec, FanOutMode, OperationDescriptor, OperationRegistry, SortKey};
use crate::validation::FinalParams;
use crate::{Error, Result};

pub struct FanOutPlanner<'a> {
    registry: &'a OperationRegistry,
}

impl<'a> FanOutPlanner<'a> {
    pub fn new(registry: &'a OperationRegistry) -> Self {
        Self { registry }
    }

    /// Expand `request` into tasks and seal it.
    ///
    /// Nothing is created when no input qualifies. Every task owns its own
    /// copy of the shared parameters.
    pub fn plan(&self, request: &mut TaskRequest, params: &FinalParams) -> Result<Vec<ConcreteTask>> {
        if request.is_sealed() {
            return Err(Error::Validation(format!(
                "Request {} has already been planned",
                request.id.short()
            )));
        }
        let descriptor = self.registry.get(&request.operation)?;

        let inputs = ordered(&params.inputs, descriptor.sort_key);
        let batch_without_inputs = descriptor.mode == FanOutMode::Batch && descriptor.min_inputs == 0;
        if inputs.is_empty() && !batch_without_inputs {
            return Err(Error::NoQualifyingInput {
                operation: descriptor.id.clone(),
            });
        }

        let mut tasks = match descriptor.mode {
            FanOutMode::PerInput => inputs
                .iter()
                .map(|&input| {
                    let mut task = self.base_task(request, &descriptor, params, vec![input]);
                    if let Some(overlay) = params.per_input.get(&input.id) {
                        task.params
                            .framework
                            .extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                    task.description = match &request.description {
                        Some(text) => format!("{}\n\n{}", text, input.name),
                        None => input.name.clone(),
                    };
                    task
                })
                .collect::<Vec<_>>(),
            FanOutMode::Batch => {
                let mut task = self.base_task(request, &descriptor, params, inputs.clone());
                task.description = request.description.clone().unwrap_or_else(|| {
                    format!("{} on {} inputs", descriptor.id, inputs.len())
                });
                vec![task]
            }
        };

        if let Some(fan_in) = &descriptor.fan_in {
            if is_truthy(params.params.get(&fan_in.trigger_param)) {
                self.append_fan_in(request, fan_in, params, &mut tasks)?;
            }
        }

        request.seal()?;
        tracing::info!(
            request = %request.id.short(),
            operation = %descriptor.id,
            tasks = tasks.len(),
            "Planned request"
        );
        Ok(tasks)
    }

    fn base_task(
        &self,
        request: &TaskRequest,
        descriptor: &OperationDescriptor,
        params: &FinalParams,
        inputs: Vec<&Artifact>,
    ) -> ConcreteTask {
        let mut task = ConcreteTask::new(
            request.id,
            &descriptor.id,
            inputs.iter().map(|a| a.id).collect(),
        );
        task.params = TaskParams::new(params.params.clone());
        if !params.dropped.is_empty() {
            task.params.framework.insert(
                framework_keys::DROPPED_OPTIONS.to_string(),
                Value::from(params.dropped.clone()),
            );
        }
        task.results_store_id = request.results_store_id.clone();
        task.tool_version = params.version.as_ref().map(|v| v.raw().to_string());
        task
    }

    /// Append a task that runs once every task in `tasks` has completed.
    ///
    /// It copies the request parameters the fan-in declares and gathers
    /// its inputs from its prerequisites' outputs at setup time.
    pub fn append_fan_in(
        &self,
        request: &TaskRequest,
        fan_in: &FanInSpec,
        params: &FinalParams,
        tasks: &mut Vec<ConcreteTask>,
    ) -> Result<()> {
        let descriptor = self.registry.get(&fan_in.operation)?;
        let mut task = ConcreteTask::new(request.id, &descriptor.id, Vec::new());
        task.params = TaskParams::new(
            fan_in
                .params
                .iter()
                .filter_map(|key| params.params.get(key).map(|v| (key.clone(), v.clone())))
                .collect(),
        );
        task.prerequisites = tasks.iter().map(|t| t.id).collect();
        if fan_in.share_workdir {
            task.share_workdir_of = tasks.first().map(|t| t.id);
        }
        task.results_store_id = request.results_store_id.clone();
        task.description = format!(
            "{}: combine {} results",
            request.description.as_deref().unwrap_or(&request.operation),
            tasks.len()
        );
        tracing::debug!(
            request = %request.id.short(),
            operation = %descriptor.id,
            prerequisites = task.prerequisites.len(),
            "Appended fan-in task"
        );
        tasks.push(task);
        Ok(())
    }
}

fn ordered(inputs: &[Artifact], key: SortKey) -> Vec<&Artifact> {
    let mut inputs: Vec<&Artifact> = inputs.iter().collect();
    match key {
        SortKey::Name => inputs.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id))),
        SortKey::Id => inputs.sort_by_key(|a| a.id),
        SortKey::Selection => {}
    }
    inputs
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|x| x != 0.0),
        Some(Value::String(s)) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
        Some(_) => true,
    }
}
