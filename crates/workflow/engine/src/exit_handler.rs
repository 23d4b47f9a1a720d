//! Exit hooks
//!
//! An exit hook runs once its parent node completes, whatever the parent's
//! outcome. Its arguments may reference the parent's outputs under the
//! parent's scope prefix (`steps.<name>`, `tasks.<name>` or `workflow`).
//! For a retried parent the outputs come from the last attempt.

use tracing::{debug, warn};
use workflow_types::{
    node_id, Arguments, Artifact, LifecycleHook, NodeFlag, NodeStatus, NodeType, Outputs,
    ShutdownStrategy,
};

use crate::operator::{ExecuteOpts, OperationContext, TemplateContext, TemplateTarget};
use crate::scope::WfScope;
use crate::substitute::replace_json;
use crate::{EngineError, EngineResult};

impl OperationContext<'_> {
    /// Run (or continue) the exit hook of a completed node.
    ///
    /// Returns `None` when no hook node exists for this pass: the workflow
    /// is shutting down or the hook's expression evaluated false.
    pub(crate) async fn run_on_exit_node(
        &mut self,
        hook: &LifecycleHook,
        parent: &NodeStatus,
        boundary_id: &str,
        tmpl_ctx: &TemplateContext,
        prefix: &str,
        scope: &WfScope,
    ) -> EngineResult<Option<NodeStatus>> {
        if !ShutdownStrategy::should_execute(self.wf.spec.shutdown, true) {
            return Ok(None);
        }
        let exit_name = format!("{}.onExit", parent.name);
        let exit_id = node_id(self.wf.name(), &exit_name);
        let template_name = TemplateTarget::from_hook(hook)
            .map(|t| t.display())
            .unwrap_or_default();

        let outputs_node = self.possibly_get_retry_child_node(parent);
        let mut scope = scope.clone();
        scope.add_param(format!("{prefix}.status"), format!("{:?}", parent.phase));
        if let Some(outputs) = &outputs_node.outputs {
            scope.add_outputs(prefix, outputs);
        }

        if self.node(&exit_id).is_none() {
            if let Some(expression) = &hook.expression {
                let env = scope.merged_with(&self.globals);
                match self.evaluator().eval_bool(expression, &env) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(node = %parent.name, expression = %expression, "Exit hook skipped");
                        return Ok(None);
                    }
                    Err(e) => {
                        let node = self.hooked_error_node(&exit_name, &template_name, boundary_id, parent, e.to_string())?;
                        return Ok(Some(node));
                    }
                }
            }
        }

        let args = match self.resolve_exit_tmpl_argument(
            &hook.arguments,
            prefix,
            outputs_node.outputs.as_ref(),
            &scope,
        ) {
            Ok(args) => args,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                let node = self.hooked_error_node(&exit_name, &template_name, boundary_id, parent, e.to_string())?;
                return Ok(Some(node));
            }
        };
        let Some(target) = TemplateTarget::from_hook(hook) else {
            let message = format!("exit hook of '{}' names no template", parent.name);
            let node = self.hooked_error_node(&exit_name, &template_name, boundary_id, parent, message)?;
            return Ok(Some(node));
        };

        let opts = ExecuteOpts {
            boundary_id: boundary_id.to_string(),
            on_exit: true,
            retry_attempt: false,
        };
        let node = self
            .execute_template(exit_name, target, tmpl_ctx.clone(), args, opts)
            .await?;
        self.link_hook(&parent.id, &node.id);
        Ok(Some(self.snapshot(&node.id)?))
    }

    /// Substitute hook arguments against the parent's outputs.
    ///
    /// Parameters are substituted leniently. Artifact references must
    /// resolve unless the artifact is optional, in which case it is
    /// dropped.
    pub(crate) fn resolve_exit_tmpl_argument(
        &self,
        args: &Arguments,
        prefix: &str,
        outputs: Option<&Outputs>,
        scope: &WfScope,
    ) -> EngineResult<Arguments> {
        let mut scope = scope.clone();
        if let Some(outputs) = outputs {
            scope.add_outputs(prefix, outputs);
        }
        let params = scope.merged_with(&self.globals);
        let mut resolved = replace_json(args, &params, true)?;

        let mut artifacts = Vec::with_capacity(resolved.artifacts.len());
        for art in resolved.artifacts.drain(..) {
            let Some(reference) = art.from.clone().or_else(|| art.from_expression.clone()) else {
                artifacts.push(art);
                continue;
            };
            match scope.resolve_artifact(&reference) {
                Ok(found) => artifacts.push(Artifact {
                    name: art.name,
                    from: None,
                    from_expression: None,
                    optional: art.optional,
                    ..found
                }),
                Err(_) if art.optional => {
                    debug!(artifact = %art.name, reference = %reference, "Optional artifact dropped");
                }
                Err(_) => return Err(EngineError::UnresolvedReference(reference)),
            }
        }
        resolved.artifacts = artifacts;
        Ok(resolved)
    }

    /// The node whose outputs a hook sees: the last attempt of a retry node.
    pub(crate) fn possibly_get_retry_child_node(&self, node: &NodeStatus) -> NodeStatus {
        if node.node_type == NodeType::Retry {
            let last = node
                .children
                .iter()
                .rev()
                .filter_map(|id| self.node(id))
                .find(|n| !n.is_hooked());
            if let Some(last) = last {
                return last.clone();
            }
        }
        node.clone()
    }

    fn hooked_error_node(
        &mut self,
        exit_name: &str,
        template_name: &str,
        boundary_id: &str,
        parent: &NodeStatus,
        message: String,
    ) -> EngineResult<NodeStatus> {
        warn!(node = %exit_name, error = %message, "Exit hook errored");
        let node = self.error_node(exit_name, template_name, boundary_id, message)?;
        self.link_hook(&parent.id, &node.id);
        self.snapshot(&node.id)
    }

    fn link_hook(&mut self, parent_id: &str, hook_id: &str) {
        self.add_child(parent_id, hook_id);
        self.update_node(hook_id, |n| {
            n.node_flag.get_or_insert_with(NodeFlag::default).hooked = true;
        });
    }
}
