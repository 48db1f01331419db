//! Reference resolution for block inputs.
//!
//! Three syntaxes are rewritten before a block executes:
//!
//! - `<blockIdOrAlias.path>` pulls from an upstream block's output. The
//!   alias form is the block name lowercased with spaces removed, so a
//!   block named "Email Agent" resolves as `<emailagent.content>`.
//! - `{{VAR_NAME}}` pulls from the run's environment variables.
//! - `<variable.name>` pulls from workflow variables.
//!
//! Inside loop and parallel bodies the scoped forms `<loop.currentItem>`,
//! `<loop.index>`, `<loop.items>`, `<parallel.currentItem>` and
//! `<parallel.index>` read from the owning region's state, and sibling
//! block references prefer the same iteration's instance output.
//!
//! A string that is exactly one reference keeps the referenced value's
//! type. References embedded in longer text stringify into it. For
//! function and condition blocks string values embed JSON-quoted so the
//! expression evaluator sees a literal, not bare words.

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::block_ref::{BlockRef, SubflowKind};
use crate::core::context::ExecutionContext;
use crate::error::{BlockError, BlockResult};
use crate::workflow::schema::{BlockKind, SerializedBlock, SerializedWorkflow};

/// Resolves references in block params against run state.
pub struct Resolver<'a> {
    workflow: &'a SerializedWorkflow,
    block_re: Regex,
    env_re: Regex,
}

/// Lowercased, space-stripped form used for name-based references.
pub fn block_alias(name: &str) -> String {
    name.to_lowercase().replace(' ', "")
}

impl<'a> Resolver<'a> {
    pub fn new(workflow: &'a SerializedWorkflow) -> Self {
        Self {
            workflow,
            block_re: Regex::new(r"<([^<>]+)>").unwrap(),
            env_re: Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap(),
        }
    }

    /// Resolve every reference in `block`'s params.
    pub fn resolve_inputs(
        &self,
        block: &SerializedBlock,
        ctx: &ExecutionContext,
        scope: &BlockRef,
    ) -> BlockResult<Value> {
        // Code-bearing params get strings quoted so the resolved text
        // stays a valid expression literal. Everything else keeps the
        // referenced value's type.
        let code_block = matches!(block.kind(), BlockKind::Function | BlockKind::Condition);
        match &block.config.params {
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (key, entry) in map {
                    let quote =
                        code_block && matches!(key.as_str(), "code" | "expression");
                    resolved.insert(
                        key.clone(),
                        self.resolve_value(entry, ctx, scope, quote)?,
                    );
                }
                Ok(Value::Object(resolved))
            }
            other => self.resolve_value(other, ctx, scope, false),
        }
    }

    fn resolve_value(
        &self,
        value: &Value,
        ctx: &ExecutionContext,
        scope: &BlockRef,
        quote_strings: bool,
    ) -> BlockResult<Value> {
        match value {
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (key, entry) in map {
                    resolved.insert(
                        key.clone(),
                        self.resolve_value(entry, ctx, scope, quote_strings)?,
                    );
                }
                Ok(Value::Object(resolved))
            }
            Value::Array(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for entry in items {
                    resolved.push(self.resolve_value(entry, ctx, scope, quote_strings)?);
                }
                Ok(Value::Array(resolved))
            }
            Value::String(s) => self.resolve_string(s, ctx, scope, quote_strings),
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(
        &self,
        input: &str,
        ctx: &ExecutionContext,
        scope: &BlockRef,
        quote_strings: bool,
    ) -> BlockResult<Value> {
        // A string that is exactly one reference substitutes the typed
        // value instead of stringifying it. Code params always embed so
        // the result stays evaluable text.
        let trimmed = input.trim();
        if !quote_strings {
            if let Some(caps) = self.block_re.captures(trimmed) {
                if caps.get(0).map(|m| m.as_str()) == Some(trimmed) {
                    return self.lookup_reference(caps[1].trim(), ctx, scope);
                }
            }
            if let Some(caps) = self.env_re.captures(trimmed) {
                if caps.get(0).map(|m| m.as_str()) == Some(trimmed) {
                    return self.env_value(caps[1].trim(), ctx);
                }
            }
        }

        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in self.block_re.captures_iter(input) {
            let whole = match caps.get(0) {
                Some(m) => m,
                None => continue,
            };
            let value = self.lookup_reference(caps[1].trim(), ctx, scope)?;
            out.push_str(&input[last..whole.start()]);
            out.push_str(&embed(&value, quote_strings));
            last = whole.end();
        }
        out.push_str(&input[last..]);

        let mut final_out = String::with_capacity(out.len());
        let mut last = 0;
        for caps in self.env_re.captures_iter(&out) {
            let whole = match caps.get(0) {
                Some(m) => m,
                None => continue,
            };
            let value = self.env_value(caps[1].trim(), ctx)?;
            final_out.push_str(&out[last..whole.start()]);
            final_out.push_str(&embed(&value, quote_strings));
            last = whole.end();
        }
        final_out.push_str(&out[last..]);

        Ok(Value::String(final_out))
    }

    /// Resolve one `<...>` reference body to its value.
    ///
    /// Also used directly for loop/parallel distribution expressions.
    pub fn lookup_reference(
        &self,
        name: &str,
        ctx: &ExecutionContext,
        scope: &BlockRef,
    ) -> BlockResult<Value> {
        let mut parts = name.split('.');
        let first = parts.next().unwrap_or("").trim();
        let rest: Vec<&str> = parts.map(str::trim).collect();
        match first {
            "" => Err(BlockError::Resolution(format!(
                "empty reference <{name}>"
            ))),
            "loop" => self.scoped_loop_value(&rest, ctx, scope, name),
            "parallel" => self.scoped_parallel_value(&rest, ctx, scope, name),
            "variable" => self.variable_value(&rest, ctx, name),
            _ => self.block_output_value(first, &rest, ctx, scope, name),
        }
    }

    fn scoped_loop_value(
        &self,
        rest: &[&str],
        ctx: &ExecutionContext,
        scope: &BlockRef,
        full: &str,
    ) -> BlockResult<Value> {
        let BlockRef::Virtual {
            kind: SubflowKind::Loop,
            region,
            iteration,
            ..
        } = scope
        else {
            return Err(BlockError::Resolution(format!(
                "<{full}> is only valid inside a loop"
            )));
        };
        let base = match rest.first().copied().unwrap_or("") {
            // For count-based loops the current item is the index itself.
            "currentItem" => ctx
                .loop_item(region, *iteration)
                .unwrap_or_else(|| Value::from(*iteration)),
            "index" => Value::from(*iteration),
            "items" => ctx
                .loop_state(region)
                .and_then(|state| state.items)
                .map(Value::Array)
                .unwrap_or(Value::Null),
            other => {
                return Err(BlockError::Resolution(format!(
                    "unknown loop property '{other}' in <{full}>"
                )))
            }
        };
        navigate_path(&base, &rest[1.min(rest.len())..], full)
    }

    fn scoped_parallel_value(
        &self,
        rest: &[&str],
        ctx: &ExecutionContext,
        scope: &BlockRef,
        full: &str,
    ) -> BlockResult<Value> {
        let BlockRef::Virtual {
            kind: SubflowKind::Parallel,
            region,
            iteration,
            ..
        } = scope
        else {
            return Err(BlockError::Resolution(format!(
                "<{full}> is only valid inside a parallel"
            )));
        };
        let base = match rest.first().copied().unwrap_or("") {
            "currentItem" => ctx
                .parallel_item(region, *iteration)
                .unwrap_or(Value::Null),
            "index" => Value::from(*iteration),
            other => {
                return Err(BlockError::Resolution(format!(
                    "unknown parallel property '{other}' in <{full}>"
                )))
            }
        };
        navigate_path(&base, &rest[1.min(rest.len())..], full)
    }

    fn variable_value(
        &self,
        rest: &[&str],
        ctx: &ExecutionContext,
        full: &str,
    ) -> BlockResult<Value> {
        if rest.is_empty() {
            return Err(BlockError::Resolution(format!(
                "<{full}> names no workflow variable"
            )));
        }
        // Variable names match with spaces stripped, so "my var" resolves
        // as <variable.myvar>. Try the whole remainder as a name first,
        // then the first segment with the rest as a path into its value.
        let vars = ctx.workflow_variables();
        let whole = rest.join(".").replace(' ', "");
        for (name, value) in vars {
            if name.replace(' ', "") == whole {
                return Ok(value.clone());
            }
        }
        let head = rest[0].replace(' ', "");
        for (name, value) in vars {
            if name.replace(' ', "") == head {
                return navigate_path(value, &rest[1..], full);
            }
        }
        Err(BlockError::Resolution(format!(
            "workflow variable \"{}\" was not found (reference <{full}>)",
            rest.join(".")
        )))
    }

    fn block_output_value(
        &self,
        first: &str,
        rest: &[&str],
        ctx: &ExecutionContext,
        scope: &BlockRef,
        full: &str,
    ) -> BlockResult<Value> {
        let source_id = self.find_block_id(first).ok_or_else(|| {
            BlockError::Resolution(format!(
                "<{full}> does not match any block in the workflow"
            ))
        })?;
        let output = ctx.output_for_reference(scope, &source_id).ok_or_else(|| {
            BlockError::Resolution(format!(
                "block \"{source_id}\" has not produced an output yet (reference <{full}>)"
            ))
        })?;
        navigate_path(&output, rest, full)
    }

    fn find_block_id(&self, key: &str) -> Option<String> {
        if self.workflow.block(key).is_some() {
            return Some(key.to_string());
        }
        let wanted = block_alias(key);
        self.workflow
            .blocks
            .iter()
            .find(|block| block_alias(block.name()) == wanted)
            .map(|block| block.id.clone())
    }

    fn env_value(&self, var: &str, ctx: &ExecutionContext) -> BlockResult<Value> {
        ctx.environment_variables()
            .get(var)
            .cloned()
            .ok_or_else(|| {
                BlockError::Resolution(format!(
                    "environment variable \"{var}\" was not found"
                ))
            })
    }
}

fn navigate_path(value: &Value, parts: &[&str], full: &str) -> BlockResult<Value> {
    let mut cursor = value;
    for part in parts {
        cursor = match cursor {
            Value::Object(map) => map.get(*part).ok_or_else(|| {
                BlockError::Resolution(format!(
                    "path segment \"{part}\" not found (reference <{full}>)"
                ))
            })?,
            Value::Array(items) => part
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index))
                .ok_or_else(|| {
                    BlockError::Resolution(format!(
                        "array index \"{part}\" out of range (reference <{full}>)"
                    ))
                })?,
            _ => {
                return Err(BlockError::Resolution(format!(
                    "cannot descend into {cursor} with \"{part}\" (reference <{full}>)"
                )))
            }
        };
    }
    Ok(cursor.clone())
}

fn embed(value: &Value, quote_strings: bool) -> String {
    match value {
        Value::String(s) => {
            if quote_strings {
                serde_json::to_string(s).unwrap_or_else(|_| s.clone())
            } else {
                s.clone()
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::LoopState;
    use serde_json::json;
    use std::collections::HashMap;

    fn sample_workflow() -> SerializedWorkflow {
        SerializedWorkflow::from_json(&serde_json::to_string(&json!({
            "version": "1.0",
            "blocks": [
                {
                    "id": "starter1",
                    "metadata": {"id": "starter", "name": "Start"},
                    "config": {"params": {}},
                    "enabled": true
                },
                {
                    "id": "agent1",
                    "metadata": {"id": "agent", "name": "Email Agent"},
                    "config": {"params": {}},
                    "enabled": true
                },
                {
                    "id": "fn1",
                    "metadata": {"id": "function", "name": "Calc"},
                    "config": {"params": {}},
                    "enabled": true
                }
            ],
            "connections": []
        }))
        .unwrap())
        .unwrap()
    }

    fn ctx_with_outputs() -> ExecutionContext {
        let ctx = ExecutionContext::new("wf-1")
            .with_environment(HashMap::from([(
                "NAME".to_string(),
                json!("World"),
            )]))
            .with_workflow_variables(HashMap::from([(
                "my var".to_string(),
                json!({"nested": 7}),
            )]));
        ctx.record_output(
            &BlockRef::real("starter1"),
            json!({"input": {"city": "Paris", "count": 3}}),
            0,
        );
        ctx.record_output(
            &BlockRef::real("agent1"),
            json!({"content": "Bob", "tokens": {"total": 12}}),
            0,
        );
        ctx
    }

    fn block(workflow: &SerializedWorkflow, id: &str, params: Value) -> SerializedBlock {
        let mut found = workflow.block(id).cloned().unwrap();
        found.config.params = params;
        found
    }

    #[test]
    fn test_exact_reference_keeps_type() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        let resolver = Resolver::new(&workflow);
        let block = block(&workflow, "agent1", json!({"payload": "<starter1.input>"}));

        let resolved = resolver
            .resolve_inputs(&block, &ctx, &BlockRef::real("agent1"))
            .unwrap();
        assert_eq!(resolved["payload"], json!({"city": "Paris", "count": 3}));
    }

    #[test]
    fn test_embedded_reference_stringifies() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        let resolver = Resolver::new(&workflow);
        let block = block(
            &workflow,
            "agent1",
            json!({"greeting": "City is <starter1.input.city>!"}),
        );

        let resolved = resolver
            .resolve_inputs(&block, &ctx, &BlockRef::real("agent1"))
            .unwrap();
        assert_eq!(resolved["greeting"], json!("City is Paris!"));
    }

    #[test]
    fn test_alias_resolution_from_block_name() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        let resolver = Resolver::new(&workflow);
        let block = block(&workflow, "fn1", json!({"who": "<emailagent.content>"}));

        let resolved = resolver
            .resolve_inputs(&block, &ctx, &BlockRef::real("fn1"))
            .unwrap();
        assert_eq!(resolved["who"], json!("Bob"));
    }

    #[test]
    fn test_env_variable_embedded() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        let resolver = Resolver::new(&workflow);
        let block = block(&workflow, "agent1", json!({"text": "Hello {{NAME}}"}));

        let resolved = resolver
            .resolve_inputs(&block, &ctx, &BlockRef::real("agent1"))
            .unwrap();
        assert_eq!(resolved["text"], json!("Hello World"));
    }

    #[test]
    fn test_workflow_variable_with_spaces() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        let resolver = Resolver::new(&workflow);
        let block = block(&workflow, "agent1", json!({"v": "<variable.myvar.nested>"}));

        let resolved = resolver
            .resolve_inputs(&block, &ctx, &BlockRef::real("agent1"))
            .unwrap();
        assert_eq!(resolved["v"], json!(7));
    }

    #[test]
    fn test_function_context_quotes_strings() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        let resolver = Resolver::new(&workflow);
        let block = block(
            &workflow,
            "fn1",
            json!({"expression": "<emailagent.content> + \"!\""}),
        );

        let resolved = resolver
            .resolve_inputs(&block, &ctx, &BlockRef::real("fn1"))
            .unwrap();
        assert_eq!(resolved["expression"], json!("\"Bob\" + \"!\""));
    }

    #[test]
    fn test_loop_scoped_values() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        ctx.init_loop(
            "loop1",
            LoopState::new(3, Some(vec![json!(10), json!(20), json!(30)])),
        );
        let resolver = Resolver::new(&workflow);
        let scope = BlockRef::virtual_instance("agent1", SubflowKind::Loop, "loop1", 1);
        let block = block(
            &workflow,
            "agent1",
            json!({"item": "<loop.currentItem>", "idx": "<loop.index>", "all": "<loop.items>"}),
        );

        let resolved = resolver.resolve_inputs(&block, &ctx, &scope).unwrap();
        assert_eq!(resolved["item"], json!(20));
        assert_eq!(resolved["idx"], json!(1));
        assert_eq!(resolved["all"], json!([10, 20, 30]));
    }

    #[test]
    fn test_loop_scope_outside_loop_fails() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        let resolver = Resolver::new(&workflow);
        let block = block(&workflow, "agent1", json!({"item": "<loop.currentItem>"}));

        let err = resolver
            .resolve_inputs(&block, &ctx, &BlockRef::real("agent1"))
            .unwrap_err();
        assert!(matches!(err, BlockError::Resolution(_)));
        assert!(err.to_string().contains("loop"));
    }

    #[test]
    fn test_sibling_instance_output_preferred() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        let sibling = BlockRef::virtual_instance("agent1", SubflowKind::Parallel, "par1", 2);
        ctx.record_output(&sibling, json!({"content": "from-iteration-2"}), 0);
        let resolver = Resolver::new(&workflow);
        let scope = BlockRef::virtual_instance("fn1", SubflowKind::Parallel, "par1", 2);
        let block = block(&workflow, "fn1", json!({"who": "<agent1.content>"}));

        let resolved = resolver.resolve_inputs(&block, &ctx, &scope).unwrap();
        assert_eq!(resolved["who"], json!("from-iteration-2"));
    }

    #[test]
    fn test_code_param_embeds_exact_reference_as_text() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        let resolver = Resolver::new(&workflow);
        let block = block(&workflow, "fn1", json!({"code": "<starter1.input.count>"}));

        let resolved = resolver
            .resolve_inputs(&block, &ctx, &BlockRef::real("fn1"))
            .unwrap();
        assert_eq!(resolved["code"], json!("3"));
    }

    #[test]
    fn test_unresolved_reference_names_the_reference() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        let resolver = Resolver::new(&workflow);
        let block = block(&workflow, "agent1", json!({"x": "<ghost.output>"}));

        let err = resolver
            .resolve_inputs(&block, &ctx, &BlockRef::real("agent1"))
            .unwrap_err();
        assert!(err.to_string().contains("<ghost.output>"));
    }

    #[test]
    fn test_missing_path_segment_errors() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        let resolver = Resolver::new(&workflow);
        let block = block(&workflow, "agent1", json!({"x": "<starter1.input.missing>"}));

        let err = resolver
            .resolve_inputs(&block, &ctx, &BlockRef::real("agent1"))
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_array_index_navigation() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        ctx.record_output(&BlockRef::real("fn1"), json!({"list": ["a", "b", "c"]}), 0);
        let resolver = Resolver::new(&workflow);
        let block = block(&workflow, "agent1", json!({"x": "<fn1.list.1>"}));

        let resolved = resolver
            .resolve_inputs(&block, &ctx, &BlockRef::real("agent1"))
            .unwrap();
        assert_eq!(resolved["x"], json!("b"));
    }

    #[test]
    fn test_nested_params_resolve_recursively() {
        let workflow = sample_workflow();
        let ctx = ctx_with_outputs();
        let resolver = Resolver::new(&workflow);
        let block = block(
            &workflow,
            "agent1",
            json!({"outer": {"inner": ["<starter1.input.count>", "plain"]}}),
        );

        let resolved = resolver
            .resolve_inputs(&block, &ctx, &BlockRef::real("agent1"))
            .unwrap();
        assert_eq!(resolved["outer"]["inner"], json!([3, "plain"]));
    }
}
