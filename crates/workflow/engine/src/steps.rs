//! Steps and DAG templates
//!
//! Steps run group by group; every step of a group starts together and the
//! next group waits for the whole group. DAG tasks start as soon as their
//! dependencies are done. Both publish completed children into a
//! [`WfScope`] that later invocations substitute from.

use std::collections::HashSet;
use workflow_types::{node_id, Artifact, DagTask, NodePhase, NodeStatus, NodeType, Template, WorkflowStep};

use crate::operator::{ExecuteOpts, OperationContext, TemplateContext, TemplateTarget};
use crate::scope::WfScope;
use crate::substitute::{replace, replace_json};
use crate::{EngineError, EngineResult};

const OMITTED: &str = "omitted: depends condition not met";

fn is_omitted(node: &NodeStatus) -> bool {
    node.phase == NodePhase::Skipped && node.message == OMITTED
}

/// A child invocation after one pass
pub(crate) struct Invocation {
    pub node: NodeStatus,
    /// The child and its exit hook (if any) are both completed
    pub done: bool,
}

impl OperationContext<'_> {
    pub(crate) async fn execute_steps(
        &mut self,
        node_name: &str,
        tmpl: &Template,
        groups: &[Vec<WorkflowStep>],
        ctx: &TemplateContext,
        opts: &ExecuteOpts,
    ) -> EngineResult<NodeStatus> {
        let node = self.init_node(node_name, NodeType::Steps, &tmpl.name, &opts.boundary_id);
        self.set_node_phase(&node.id, NodePhase::Running, None);

        let mut scope = WfScope::new();
        for (i, group) in groups.iter().enumerate() {
            let group_name = format!("{node_name}[{i}]");
            let group_node = self
                .execute_step_group(&group_name, group, &node.id, ctx, &mut scope)
                .await?;
            if !group_node.is_completed() {
                return self.snapshot(&node.id);
            }
            if !group_node.phase.is_successful() {
                let message = format!("child '{}' failed", group_node.id);
                self.complete_node(&node.id, NodePhase::Failed, message, None);
                return self.snapshot(&node.id);
            }
        }

        let outputs = self.last_child_outputs(&node.id);
        self.complete_node(&node.id, NodePhase::Succeeded, String::new(), outputs);
        self.snapshot(&node.id)
    }

    async fn execute_step_group(
        &mut self,
        group_name: &str,
        steps: &[WorkflowStep],
        steps_id: &str,
        ctx: &TemplateContext,
        scope: &mut WfScope,
    ) -> EngineResult<NodeStatus> {
        let group = self.init_node(group_name, NodeType::StepGroup, "", steps_id);
        self.add_child(steps_id, &group.id);
        if group.is_completed() {
            self.publish_steps(group_name, steps, scope);
            return Ok(group);
        }
        self.set_node_phase(&group.id, NodePhase::Running, None);

        let mut all_done = true;
        let mut failed: Option<String> = None;
        for step in steps {
            let child_name = format!("{group_name}.{}", step.name);
            let prefix = format!("steps.{}", step.name);
            let invocation = self
                .execute_invocation(&child_name, step, &group.id, ctx, scope, &prefix)
                .await?;
            self.add_child(&group.id, &invocation.node.id);
            if !invocation.done {
                all_done = false;
            } else if !invocation.node.phase.is_successful() && failed.is_none() {
                failed = Some(invocation.node.id.clone());
            }
        }
        if !all_done {
            return self.snapshot(&group.id);
        }

        match failed {
            Some(child) => {
                self.complete_node(&group.id, NodePhase::Failed, format!("child '{child}' failed"), None)
            }
            None => self.complete_node(&group.id, NodePhase::Succeeded, String::new(), None),
        }
        self.publish_steps(group_name, steps, scope);
        self.snapshot(&group.id)
    }

    fn publish_steps(&self, group_name: &str, steps: &[WorkflowStep], scope: &mut WfScope) {
        for step in steps {
            let id = node_id(self.wf.name(), &format!("{group_name}.{}", step.name));
            if let Some(node) = self.node(&id) {
                let node = self.possibly_get_retry_child_node(node);
                scope.add_node(&format!("steps.{}", step.name), &node);
            }
        }
    }

    pub(crate) async fn execute_dag(
        &mut self,
        node_name: &str,
        tmpl: &Template,
        tasks: &[DagTask],
        ctx: &TemplateContext,
        opts: &ExecuteOpts,
    ) -> EngineResult<NodeStatus> {
        let dag = self.init_node(node_name, NodeType::Dag, &tmpl.name, &opts.boundary_id);
        self.set_node_phase(&dag.id, NodePhase::Running, None);

        let task_name = |task: &DagTask| format!("{node_name}.{}", task.name());
        let names: HashSet<&str> = tasks.iter().map(DagTask::name).collect();
        if let Some(missing) = tasks
            .iter()
            .flat_map(|t| t.dependencies.iter())
            .find(|d| !names.contains(d.as_str()))
        {
            let message = format!("dependency '{missing}' not found");
            self.complete_node(&dag.id, NodePhase::Error, message, None);
            return self.snapshot(&dag.id);
        }

        let mut scope = WfScope::new();
        let mut done: HashSet<String> = HashSet::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut progress = true;
        while progress {
            progress = false;
            for task in tasks {
                if done.contains(task.name()) {
                    continue;
                }
                let name = task_name(task);
                let prefix = format!("tasks.{}", task.name());
                let id = node_id(self.wf.name(), &name);

                let mut ready = true;
                let mut omitted = false;
                for dep in &task.dependencies {
                    if !done.contains(dep.as_str()) {
                        ready = false;
                        continue;
                    }
                    let dep_id = node_id(self.wf.name(), &format!("{node_name}.{dep}"));
                    if self
                        .node(&dep_id)
                        .is_some_and(|n| !n.phase.is_successful() || is_omitted(n))
                    {
                        omitted = true;
                    }
                }
                if !ready {
                    continue;
                }
                if omitted {
                    if self.node(&id).is_none() {
                        self.init_node(&name, NodeType::Task, &task.step.target_name(), &dag.id);
                        self.set_node_phase(&id, NodePhase::Skipped, Some(OMITTED.to_string()));
                    }
                    self.add_child(&dag.id, &id);
                    done.insert(task.name().to_string());
                    progress = true;
                    continue;
                }
                if visited.contains(task.name()) {
                    continue;
                }

                visited.insert(task.name().to_string());
                let invocation = self
                    .execute_invocation(&name, &task.step, &dag.id, ctx, &scope, &prefix)
                    .await?;
                self.add_child(&dag.id, &invocation.node.id);
                if invocation.done {
                    let node = self.possibly_get_retry_child_node(&invocation.node);
                    scope.add_node(&prefix, &node);
                    done.insert(task.name().to_string());
                    progress = true;
                }
            }
        }

        if done.len() < tasks.len() {
            return self.snapshot(&dag.id);
        }
        let failed = tasks.iter().find(|t| {
            let id = node_id(self.wf.name(), &task_name(t));
            self.node(&id)
                .is_some_and(|n| matches!(n.phase, NodePhase::Failed | NodePhase::Error))
        });
        match failed {
            Some(task) => {
                let message = format!("task '{}' failed", task_name(task));
                self.complete_node(&dag.id, NodePhase::Failed, message, None);
            }
            None => {
                let outputs = self.last_child_outputs(&dag.id);
                self.complete_node(&dag.id, NodePhase::Succeeded, String::new(), outputs);
            }
        }
        self.snapshot(&dag.id)
    }

    /// Invoke one step or DAG task, including its `when` guard and exit hook.
    async fn execute_invocation(
        &mut self,
        child_name: &str,
        step: &WorkflowStep,
        boundary_id: &str,
        ctx: &TemplateContext,
        scope: &WfScope,
        prefix: &str,
    ) -> EngineResult<Invocation> {
        let id = node_id(self.wf.name(), child_name);
        let target_name = step.target_name();
        let started = self.node(&id).is_some();
        let params = scope.merged_with(&self.globals);

        if !started {
            if let Some(when) = &step.when {
                let decision = replace(when, &params, false)
                    .and_then(|expr| {
                        let keep = self.evaluator().eval_bool(&expr, &params)?;
                        Ok((expr, keep))
                    });
                match decision {
                    Ok((_, true)) => {}
                    Ok((expr, false)) => {
                        self.init_node(child_name, NodeType::Task, &target_name, boundary_id);
                        self.set_node_phase(
                            &id,
                            NodePhase::Skipped,
                            Some(format!("when '{expr}' evaluated false")),
                        );
                        return self.finished(&id);
                    }
                    Err(e) => {
                        self.error_node(child_name, &target_name, boundary_id, e.to_string())?;
                        return self.finished(&id);
                    }
                }
            }
        }

        let mut args = step.arguments.clone();
        let substituted = replace_json(&args.parameters, &params, false).and_then(|parameters| {
            args.parameters = parameters;
            resolve_artifacts(args, scope)
        });
        let args = match substituted {
            Ok(args) => args,
            Err(e) => {
                self.error_node(child_name, &target_name, boundary_id, e.to_string())?;
                return self.finished(&id);
            }
        };
        let Some(target) = TemplateTarget::from_invocation(step.template.as_ref(), step.template_ref.as_ref()) else {
            let message = format!("step '{}' names no template", step.name);
            self.error_node(child_name, &target_name, boundary_id, message)?;
            return self.finished(&id);
        };

        let opts = ExecuteOpts {
            boundary_id: boundary_id.to_string(),
            ..ExecuteOpts::default()
        };
        let node = self
            .execute_template(child_name.to_string(), target, ctx.clone(), args, opts)
            .await?;
        if !node.is_completed() {
            return Ok(Invocation { node, done: false });
        }

        let Some(hook) = step.exit_hook() else {
            return Ok(Invocation { node, done: true });
        };
        let exit = self
            .run_on_exit_node(hook, &node, boundary_id, ctx, prefix, scope)
            .await?;
        let done = exit.as_ref().map_or(true, NodeStatus::is_completed);
        Ok(Invocation {
            node: self.snapshot(&node.id)?,
            done,
        })
    }

    fn finished(&self, id: &str) -> EngineResult<Invocation> {
        Ok(Invocation {
            node: self.snapshot(id)?,
            done: true,
        })
    }

    /// Outputs of the last completed child, surfaced on composite nodes.
    fn last_child_outputs(&self, id: &str) -> Option<workflow_types::Outputs> {
        let node = self.node(id)?;
        let mut child = self.node(node.children.last()?)?;
        while child.outputs.is_none() {
            child = self.node(child.children.last()?)?;
        }
        child.outputs.clone()
    }
}

/// Replace artifact references in step arguments with the published artifact.
fn resolve_artifacts(
    mut args: workflow_types::Arguments,
    scope: &WfScope,
) -> EngineResult<workflow_types::Arguments> {
    let mut resolved = Vec::with_capacity(args.artifacts.len());
    for art in args.artifacts.drain(..) {
        let Some(reference) = art.from.clone().or_else(|| art.from_expression.clone()) else {
            resolved.push(art);
            continue;
        };
        match scope.resolve_artifact(&reference) {
            Ok(found) => resolved.push(Artifact {
                name: art.name,
                from: None,
                from_expression: None,
                optional: art.optional,
                ..found
            }),
            Err(_) if art.optional => {}
            Err(_) => return Err(EngineError::UnresolvedReference(reference)),
        }
    }
    args.artifacts = resolved;
    Ok(args)
}
