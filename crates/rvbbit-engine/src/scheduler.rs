//! The cascade scheduler: a cooperative supervisor that owns the `Echo` and
//! drives cells in order, fanning out candidates, spawning sub-cascades, and
//! applying error policy.
//!
//! Workers (candidates, map elements) run as spawned tasks and report back
//! through futures; only the supervisor mutates the `Echo`, so run state
//! needs no locks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;

use rvbbit_budget::TokenBudgeter;
use rvbbit_cache::ResultCache;
use rvbbit_core::caller::InvocationMetadata;
use rvbbit_core::config::{
    self, CandidateMode, CandidateSpec, CascadeDef, Cell, CellKind, FactorSpec, OnErrorPolicy,
    SelectorSpec, ValidatorSpec,
};
use rvbbit_core::template::{render, render_json, resolve_factor};
use rvbbit_core::{env_vars, Error, Message, Result, Tool, ToolInput};
use rvbbit_events::{EventLog, NodeKind};
use rvbbit_providers::{ChatModel, OpenAiCompatModel};
use rvbbit_registry::{LexicalEmbedder, SkillRegistry};

use crate::agent::{AgentLoop, AgentOutcome};
use crate::context::{build_context, value_as_text};
use crate::echo::{CascadeOutcome, CascadeStatus, CellRecord, Echo, EchoError};
use crate::events::EventScope;
use crate::extraction::apply_extractions;
use crate::mutations::mutate_instructions;

tokio::task_local! {
    static CURRENT_DEPTH: u32;
}

/// Sub-cascade depth of the current task (0 at top level).
pub fn current_depth() -> u32 {
    CURRENT_DEPTH.try_with(|d| *d).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Resolves model names to chat models.
pub trait ModelFactory: Send + Sync {
    fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn ChatModel>>;
}

/// Creates an [`OpenAiCompatModel`] per model name.
pub struct DefaultModelFactory {
    default_model: String,
}

impl DefaultModelFactory {
    pub fn new() -> Self {
        Self {
            default_model: env_vars::env_string_or_default(env_vars::MODEL, "gpt-4o-mini"),
        }
    }
}

impl Default for DefaultModelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelFactory for DefaultModelFactory {
    fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn ChatModel>> {
        Ok(Arc::new(OpenAiCompatModel::new(
            name.unwrap_or(&self.default_model),
        )))
    }
}

/// Fixed name → model map; the test harness's factory.
pub struct StaticModelFactory {
    default: Arc<dyn ChatModel>,
    models: std::collections::HashMap<String, Arc<dyn ChatModel>>,
}

impl StaticModelFactory {
    pub fn new(default: Arc<dyn ChatModel>) -> Self {
        Self {
            default,
            models: Default::default(),
        }
    }

    pub fn with_model(mut self, name: impl Into<String>, model: Arc<dyn ChatModel>) -> Self {
        self.models.insert(name.into(), model);
        self
    }
}

impl ModelFactory for StaticModelFactory {
    fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn ChatModel>> {
        Ok(match name {
            Some(n) => self.models.get(n).cloned().unwrap_or_else(|| self.default.clone()),
            None => self.default.clone(),
        })
    }
}

/// Executes `sql` cells against the OLAP adapter, materializing results as a
/// temp table named `_<cell>` for downstream cells.
#[async_trait::async_trait]
pub trait SqlCellRunner: Send + Sync {
    async fn run_sql(&self, sql: &str, materialize_as: Option<&str>) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Process-level resource bounds.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrent LLM calls across all cascades (default CPU*2).
    pub max_llm_concurrency: usize,
    pub max_shell_concurrency: usize,
    pub max_browser_concurrency: usize,
    /// Map fan-out bound (default CPU count).
    pub max_parallel: usize,
    /// Sub-cascade recursion limit.
    pub max_depth: u32,
    /// Whether tool results flow through the result cache.
    pub tool_caching: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            max_llm_concurrency: env_vars::env_usize(env_vars::MAX_LLM_CONCURRENCY, cpus * 2),
            max_shell_concurrency: 2,
            max_browser_concurrency: 2,
            max_parallel: env_vars::env_usize(env_vars::MAX_PARALLEL, cpus),
            max_depth: env_vars::env_usize(env_vars::MAX_DEPTH, 8) as u32,
            tool_caching: true,
        }
    }
}

/// Identifies who spawned a cascade and at what depth.
#[derive(Debug, Clone, Default)]
pub struct SpawnLink {
    pub caller_id: Option<String>,
    pub metadata: InvocationMetadata,
    pub depth: u32,
    pub parent_session: Option<String>,
}

impl SpawnLink {
    /// Top-level link: caller context comes from the task-local holder when
    /// an entry point installed one.
    pub fn top() -> Self {
        match rvbbit_core::caller::current() {
            Some(ctx) => Self {
                caller_id: Some(ctx.caller_id),
                metadata: ctx.metadata,
                depth: 0,
                parent_session: None,
            },
            None => Self::default(),
        }
    }

    fn child_of(echo: &Echo) -> Self {
        Self {
            caller_id: Some(echo.caller_id.clone()),
            metadata: echo.invocation_metadata.clone(),
            depth: echo.depth + 1,
            parent_session: Some(echo.session_id.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct SchedulerInner {
    registry: Arc<SkillRegistry>,
    cache: Arc<ResultCache>,
    events: EventLog,
    models: Arc<dyn ModelFactory>,
    sql: Option<Arc<dyn SqlCellRunner>>,
    config: SchedulerConfig,
    llm_semaphore: Arc<Semaphore>,
    shell_semaphore: Arc<Semaphore>,
    browser_semaphore: Arc<Semaphore>,
}

/// The cascade scheduler. Cheap to clone; all clones share semaphores and
/// collaborators.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<SkillRegistry>,
        cache: Arc<ResultCache>,
        events: EventLog,
        models: Arc<dyn ModelFactory>,
    ) -> Self {
        Self::with_config(registry, cache, events, models, SchedulerConfig::default())
    }

    pub fn with_config(
        registry: Arc<SkillRegistry>,
        cache: Arc<ResultCache>,
        events: EventLog,
        models: Arc<dyn ModelFactory>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                llm_semaphore: Arc::new(Semaphore::new(config.max_llm_concurrency)),
                shell_semaphore: Arc::new(Semaphore::new(config.max_shell_concurrency)),
                browser_semaphore: Arc::new(Semaphore::new(config.max_browser_concurrency)),
                registry,
                cache,
                events,
                models,
                sql: None,
                config,
            }),
        }
    }

    /// Attach an OLAP runner for `sql` cells. Must be called before sharing.
    pub fn with_sql_runner(mut self, runner: Arc<dyn SqlCellRunner>) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_sql_runner must be called before the scheduler is shared");
        inner.sql = Some(runner);
        self
    }

    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }

    pub fn registry(&self) -> &Arc<SkillRegistry> {
        &self.inner.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.inner.cache
    }

    /// Execute a cascade at the top level.
    pub async fn run(&self, def: Arc<CascadeDef>, inputs: Value) -> Result<CascadeOutcome> {
        self.run_linked(def, inputs, SpawnLink::top()).await
    }

    /// Execute a cascade file at the top level.
    pub async fn run_file(
        &self,
        path: impl AsRef<std::path::Path>,
        inputs: Value,
    ) -> Result<CascadeOutcome> {
        let def = Arc::new(config::load_cascade(path)?);
        self.run(def, inputs).await
    }

    /// Execute a cascade as a sub-workflow of an existing run.
    ///
    /// Returns a boxed, type-erased future (rather than `async fn`) because
    /// this call participates in a recursion cycle (map/run cells spawn
    /// sub-cascades that loop back through here); an opaque `impl Future`
    /// return type here cannot resolve its own hidden type in that cycle.
    pub fn run_linked(
        &self,
        def: Arc<CascadeDef>,
        inputs: Value,
        link: SpawnLink,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<CascadeOutcome>> + Send + '_>>
    {
        Box::pin(async move {
            if link.depth > self.inner.config.max_depth {
                return Err(Error::Other(format!(
                    "max cascade depth {} exceeded",
                    self.inner.config.max_depth
                )));
            }
            let depth = link.depth;
            CURRENT_DEPTH
                .scope(depth, self.supervise(def, inputs, link))
                .await
        })
    }

    /// Spawn a cascade file as a child of the current task (used by `run`
    /// cells, map fan-out, cascade skills, and the SQL UDF bridge).
    pub async fn run_sub_file(
        &self,
        path: PathBuf,
        inputs: Value,
        link: SpawnLink,
    ) -> Result<CascadeOutcome> {
        let def = Arc::new(config::load_cascade(&path)?);
        self.run_linked(def, inputs, link).await
    }

    // -----------------------------------------------------------------------
    // Supervisor
    // -----------------------------------------------------------------------

    async fn supervise(
        &self,
        def: Arc<CascadeDef>,
        inputs: Value,
        link: SpawnLink,
    ) -> Result<CascadeOutcome> {
        let mut echo = Echo::new(
            def.cascade_id.clone(),
            inputs,
            link.caller_id,
            link.metadata,
            link.depth,
            link.parent_session,
        );
        let scope = EventScope::new(
            self.inner.events.clone(),
            echo.session_id.clone(),
            echo.cascade_id.clone(),
            echo.caller_id.clone(),
            echo.depth,
        );
        let started = Instant::now();
        let root_trace = scope.emit(
            NodeKind::CascadeStart,
            json!({
                "inputs": echo.inputs,
                "parent_session_id": echo.parent_session_id,
            }),
        );
        let scope = scope.with_parent_trace(root_trace);

        let budgeter = match &def.token_budget {
            Some(spec) => {
                let default_model = def
                    .cells
                    .iter()
                    .find_map(|c| c.model.clone())
                    .unwrap_or_else(|| "gpt-4".to_string());
                Some(Arc::new(TokenBudgeter::from_spec(spec, &default_model)?))
            }
            None => None,
        };

        let mut index = 0usize;
        let mut steps = 0usize;
        let step_limit = def.cells.len() * 4 + 8;
        while index < def.cells.len() {
            steps += 1;
            if steps > step_limit {
                let e = Error::Other("handoff loop detected, aborting cascade".to_string());
                scope.emit_error(&e);
                echo.errors.push(EchoError {
                    cell_name: def.cells[index].name.clone(),
                    message: e.to_string(),
                    absorbed: false,
                });
                break;
            }

            let cell = def.cells[index].clone();
            let disposition = self
                .run_cell(&def, &cell, &mut echo, index, budgeter.clone(), &scope)
                .await;

            match disposition {
                CellDisposition::Completed(value) => {
                    echo.outputs.insert(cell.name.clone(), value);
                }
                CellDisposition::Continued(message) => {
                    echo.errors.push(EchoError {
                        cell_name: cell.name.clone(),
                        message,
                        absorbed: true,
                    });
                    echo.outputs.insert(cell.name.clone(), Value::Null);
                }
                CellDisposition::Failed(message) => {
                    echo.errors.push(EchoError {
                        cell_name: cell.name.clone(),
                        message,
                        absorbed: false,
                    });
                    break;
                }
            }

            index = self.next_index(&def, &cell, index, &echo, &scope);
        }

        let status = echo.status();
        scope.emit_event(
            scope
                .event(NodeKind::CascadeComplete)
                .with_content(json!({
                    "status": status,
                    "outputs": Value::Object(echo.outputs.clone()),
                    "state": Value::Object(echo.state.clone()),
                    "errors": echo.errors.iter().map(|e| e.message.clone()).collect::<Vec<_>>(),
                }))
                .with_duration_ms(started.elapsed().as_millis() as u64)
                .with_usage(
                    echo.usage.prompt_tokens,
                    echo.usage.completion_tokens,
                    echo.usage.cost,
                ),
        );

        Ok(CascadeOutcome::from_echo(&echo))
    }

    fn next_index(
        &self,
        def: &CascadeDef,
        cell: &Cell,
        index: usize,
        echo: &Echo,
        scope: &EventScope,
    ) -> usize {
        for handoff in &cell.handoffs {
            let taken = match &handoff.condition {
                None => true,
                Some(template) => match render(template, &echo.scope()) {
                    Ok(rendered) => {
                        let t = rendered.trim().to_lowercase();
                        !(t.is_empty() || t == "false" || t == "0" || t == "null" || t == "no")
                    }
                    Err(e) => {
                        scope.emit_error(&e);
                        false
                    }
                },
            };
            if taken {
                if let Some(target) = def.cells.iter().position(|c| c.name == handoff.to) {
                    return target;
                }
            }
        }
        index + 1
    }

    // -----------------------------------------------------------------------
    // Per-cell execution with error policy
    // -----------------------------------------------------------------------

    async fn run_cell(
        &self,
        def: &Arc<CascadeDef>,
        cell: &Cell,
        echo: &mut Echo,
        index: usize,
        budgeter: Option<Arc<TokenBudgeter>>,
        cascade_scope: &EventScope,
    ) -> CellDisposition {
        let scope = cascade_scope.for_cell(&cell.name);
        scope.emit(NodeKind::CellStart, json!({ "kind": cell.kind }));

        // Per-cell budget overrides win over the cascade-level budget.
        let budgeter = match &cell.token_budget {
            Some(spec) => {
                let model = cell.model.as_deref().unwrap_or("gpt-4");
                match TokenBudgeter::from_spec(spec, model) {
                    Ok(b) => Some(Arc::new(b)),
                    Err(e) => {
                        scope.emit_error(&e);
                        return CellDisposition::Failed(e.to_string());
                    }
                }
            }
            None => budgeter,
        };

        let mut attempts = 0u32;
        let mut auto_fixed = false;
        let mut repair_advice: Option<String> = None;

        loop {
            let started = Instant::now();
            let exec = self.execute_cell(
                def,
                cell,
                echo,
                index,
                budgeter.clone(),
                &scope,
                repair_advice.as_deref(),
            );
            let result = match cell.rules.timeout_secs {
                Some(secs) => {
                    let limit = Duration::from_secs(secs);
                    match tokio::time::timeout(limit, exec).await {
                        Ok(r) => r,
                        Err(_) => Err(Error::Timeout(limit)),
                    }
                }
                None => exec.await,
            };

            // Wards: validators run on success and can veto the output.
            let result = match result {
                Ok(value) => match self
                    .validate(def, cell, echo, index, &value, &scope)
                    .await
                {
                    Ok(()) => Ok(value),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => {
                    scope.emit_event(
                        scope
                            .event(NodeKind::CellComplete)
                            .with_content(json!({ "output": value }))
                            .with_duration_ms(started.elapsed().as_millis() as u64),
                    );
                    return CellDisposition::Completed(value);
                }
                Err(Error::Cancelled) => {
                    scope.emit(NodeKind::Error, json!({ "error": "cancelled" }));
                    return CellDisposition::Failed("cancelled".to_string());
                }
                Err(e) => {
                    scope.emit_error(&e);
                    match cell.rules.on_error {
                        OnErrorPolicy::Fail => return CellDisposition::Failed(e.to_string()),
                        OnErrorPolicy::Continue => {
                            return CellDisposition::Continued(e.to_string())
                        }
                        OnErrorPolicy::Retry => {
                            attempts += 1;
                            if attempts > cell.rules.retries {
                                return CellDisposition::Failed(format!(
                                    "{e} (after {attempts} attempts)"
                                ));
                            }
                            tracing::debug!(cell = %cell.name, attempts, "retrying cell");
                        }
                        OnErrorPolicy::AutoFix => {
                            if auto_fixed {
                                return CellDisposition::Failed(format!(
                                    "{e} (auto-fix attempt did not resolve it)"
                                ));
                            }
                            auto_fixed = true;
                            match self.auto_fix(def, cell, echo, &e, &scope).await {
                                Ok(advice) => repair_advice = Some(advice),
                                Err(fix_err) => {
                                    scope.emit_error(&fix_err);
                                    return CellDisposition::Failed(e.to_string());
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cell kinds
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn execute_cell(
        &self,
        def: &Arc<CascadeDef>,
        cell: &Cell,
        echo: &mut Echo,
        index: usize,
        budgeter: Option<Arc<TokenBudgeter>>,
        scope: &EventScope,
        repair_advice: Option<&str>,
    ) -> Result<Value> {
        match cell.kind {
            CellKind::Agent => {
                self.execute_agent_cell(def, cell, echo, index, budgeter, scope, repair_advice)
                    .await
            }
            CellKind::Tool => self.execute_tool_cell(cell, echo, index, scope).await,
            CellKind::Sql => self.execute_sql_cell(cell, echo, index).await,
            CellKind::Python => self.execute_runtime_cell(cell, echo, index, "python_eval").await,
            CellKind::Js => self.execute_runtime_cell(cell, echo, index, "js_eval").await,
            CellKind::Map => self.execute_map_cell(def, cell, echo, index).await,
            CellKind::Run => self.execute_run_cell(def, cell, echo, index).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_agent_cell(
        &self,
        def: &Arc<CascadeDef>,
        cell: &Cell,
        echo: &mut Echo,
        index: usize,
        budgeter: Option<Arc<TokenBudgeter>>,
        scope: &EventScope,
        repair_advice: Option<&str>,
    ) -> Result<Value> {
        let mut messages = build_context(def, cell, echo, index, budgeter.as_deref())?;
        if let Some(advice) = repair_advice {
            messages.push(Message::user(format!(
                "A previous attempt at this step failed. Repair guidance:\n{advice}"
            )));
        }
        let tools = self.resolve_tools(cell).await?;

        // Candidate usage is accumulated per candidate as their events are
        // emitted; the single-run path accounts for itself here.
        let outcome = match &cell.candidates {
            Some(spec) => {
                let factor = self.resolve_candidate_factor(spec, echo)?;
                if factor > 1 {
                    self.fan_out(
                        def, cell, spec, factor, messages, tools, budgeter, echo, index, scope,
                    )
                    .await?
                } else {
                    let outcome = self
                        .agent_once(cell, messages, tools, budgeter, None, scope)
                        .await?;
                    echo.usage.add(&outcome.usage);
                    outcome
                }
            }
            None => {
                let outcome = self
                    .agent_once(cell, messages, tools, budgeter, None, scope)
                    .await?;
                echo.usage.add(&outcome.usage);
                outcome
            }
        };
        apply_extractions(&cell.output_extraction, &outcome.content, &mut echo.state)?;
        echo.records.push(CellRecord {
            index,
            cell_name: cell.name.clone(),
            messages: outcome.messages.clone(),
            final_output: outcome.content.clone(),
        });

        Ok(to_output_value(&outcome.content))
    }

    async fn agent_once(
        &self,
        cell: &Cell,
        messages: Vec<Message>,
        tools: Vec<Arc<dyn Tool>>,
        budgeter: Option<Arc<TokenBudgeter>>,
        model_override: Option<&str>,
        scope: &EventScope,
    ) -> Result<AgentOutcome> {
        let model = self
            .inner
            .models
            .resolve(model_override.or(cell.model.as_deref()))?;
        let agent = AgentLoop {
            model,
            tools,
            cache: self
                .inner
                .config
                .tool_caching
                .then(|| self.inner.cache.clone()),
            budgeter,
            scope: scope.clone(),
            llm_semaphore: self.inner.llm_semaphore.clone(),
            shell_semaphore: self.inner.shell_semaphore.clone(),
            browser_semaphore: self.inner.browser_semaphore.clone(),
            max_turns: cell.rules.max_turns,
            parallel_tools: cell.rules.parallel_tools,
        };
        agent.run(messages).await
    }

    async fn resolve_tools(&self, cell: &Cell) -> Result<Vec<Arc<dyn Tool>>> {
        if cell.traits.is_manifest() {
            let model = self.inner.models.resolve(cell.model.as_deref())?;
            let instructions = cell.instructions.as_deref().unwrap_or("");
            return rvbbit_registry::manifest_select(
                &self.inner.registry,
                instructions,
                model.as_ref(),
                &LexicalEmbedder::new(),
                8,
            )
            .await;
        }
        let mut tools = Vec::new();
        for name in cell.traits.names() {
            tools.push(self.inner.registry.get(name)?);
        }
        Ok(tools)
    }

    async fn execute_tool_cell(
        &self,
        cell: &Cell,
        echo: &mut Echo,
        index: usize,
        scope: &EventScope,
    ) -> Result<Value> {
        let tool_name = cell
            .traits
            .names()
            .first()
            .cloned()
            .ok_or_else(|| Error::config(format!("cells[{index}].traits"), "tool cell without a tool"))?;
        let tool = self.inner.registry.get(&tool_name)?;

        let args = render_json(
            &Value::Object(cell.inputs.clone().into_iter().collect()),
            &echo.scope(),
        )?;
        scope.emit(
            NodeKind::ToolCall,
            json!({ "tool": tool_name, "args": args }),
        );

        let output = if let (true, Some(policy)) =
            (self.inner.config.tool_caching, tool.cache_policy())
        {
            let tool_for_build = tool.clone();
            let args_for_build = args.clone();
            let value = self
                .inner
                .cache
                .get_or_build(&tool_name, &args, &policy, move || async move {
                    tool_for_build
                        .call(ToolInput::from(args_for_build))
                        .await
                        .map(Value::String)
                })
                .await?;
            match value {
                Value::String(s) => s,
                other => other.to_string(),
            }
        } else {
            tool.call(ToolInput::from(args.clone())).await?
        };

        scope.emit(
            NodeKind::ToolResult,
            json!({ "tool": tool_name, "result": output }),
        );

        apply_extractions(&cell.output_extraction, &output, &mut echo.state)?;
        echo.records.push(CellRecord {
            index,
            cell_name: cell.name.clone(),
            messages: vec![Message::tool_result("cell", &tool_name, output.clone())],
            final_output: output.clone(),
        });
        Ok(to_output_value(&output))
    }

    async fn execute_sql_cell(&self, cell: &Cell, echo: &mut Echo, index: usize) -> Result<Value> {
        let runner = self
            .inner
            .sql
            .as_ref()
            .ok_or_else(|| Error::Sql("no OLAP adapter configured for sql cells".into()))?;
        let body = render(cell.body.as_deref().unwrap_or(""), &echo.scope())?;
        let table = format!("_{}", cell.name);
        let value = runner.run_sql(&body, Some(&table)).await?;

        let text = value_as_text(&value);
        apply_extractions(&cell.output_extraction, &text, &mut echo.state)?;
        echo.records.push(CellRecord {
            index,
            cell_name: cell.name.clone(),
            messages: vec![Message::tool_result("cell", "sql", text.clone())],
            final_output: text,
        });
        Ok(value)
    }

    async fn execute_runtime_cell(
        &self,
        cell: &Cell,
        echo: &mut Echo,
        index: usize,
        runtime_tool: &str,
    ) -> Result<Value> {
        let tool = self.inner.registry.get(runtime_tool)?;
        let body = render(cell.body.as_deref().unwrap_or(""), &echo.scope())?;
        let output = tool
            .call(ToolInput::Structured(json!({ "code": body })))
            .await?;
        apply_extractions(&cell.output_extraction, &output, &mut echo.state)?;
        echo.records.push(CellRecord {
            index,
            cell_name: cell.name.clone(),
            messages: vec![Message::tool_result("cell", runtime_tool, output.clone())],
            final_output: output.clone(),
        });
        Ok(to_output_value(&output))
    }

    // -----------------------------------------------------------------------
    // Candidates
    // -----------------------------------------------------------------------

    fn resolve_candidate_factor(&self, spec: &CandidateSpec, echo: &Echo) -> Result<usize> {
        match &spec.factor {
            FactorSpec::Literal(n) => {
                if *n <= 0 {
                    Err(Error::config(
                        "candidates.factor",
                        format!("factor must be positive, got {n}"),
                    ))
                } else {
                    Ok(*n as usize)
                }
            }
            FactorSpec::Template(template) => resolve_factor(template, &echo.scope()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fan_out(
        &self,
        def: &Arc<CascadeDef>,
        cell: &Cell,
        spec: &CandidateSpec,
        factor: usize,
        base_messages: Vec<Message>,
        tools: Vec<Arc<dyn Tool>>,
        budgeter: Option<Arc<TokenBudgeter>>,
        echo: &mut Echo,
        index: usize,
        scope: &EventScope,
    ) -> Result<AgentOutcome> {
        let mode = spec.mode.unwrap_or(CandidateMode::Select);
        // The rendered instructions live in the last user message.
        let instructions_at = base_messages.iter().rposition(|m| m.role == rvbbit_core::Role::User);
        let base_instructions = instructions_at
            .map(|i| base_messages[i].content.clone())
            .unwrap_or_default();

        let mut seed: Option<String> = None;
        let mut round: u32 = 0;
        loop {
            let mut tasks = Vec::with_capacity(factor);
            for i in 0..factor {
                let mut messages = base_messages.clone();
                let mut instructions =
                    mutate_instructions(&base_instructions, &spec.mutations, i);
                if let Some(previous) = &seed {
                    instructions.push_str(&format!(
                        "\n\nPrevious best attempt:\n{previous}\nImprove on it."
                    ));
                }
                if let Some(at) = instructions_at {
                    messages[at].content = instructions;
                } else {
                    messages.push(Message::user(instructions));
                }

                let model_override = if spec.models.is_empty() {
                    None
                } else {
                    Some(spec.models[i % spec.models.len()].clone())
                };

                let this = self.clone();
                let cell = cell.clone();
                let tools = tools.clone();
                let budgeter = budgeter.clone();
                let scope = scope.clone();
                let depth = echo.depth;
                tasks.push(tokio::spawn(CURRENT_DEPTH.scope(depth, async move {
                    let started = Instant::now();
                    let result = this
                        .agent_once(
                            &cell,
                            messages,
                            tools,
                            budgeter,
                            model_override.as_deref(),
                            &scope,
                        )
                        .await;
                    (result, started.elapsed())
                })));
            }

            let mut results: Vec<(Result<AgentOutcome>, Duration)> = Vec::with_capacity(factor);
            for task in tasks {
                match task.await {
                    Ok(pair) => results.push(pair),
                    Err(join_err) => results.push((
                        Err(Error::Other(format!("candidate task panicked: {join_err}"))),
                        Duration::ZERO,
                    )),
                }
            }

            match mode {
                CandidateMode::Select => {
                    let winner = self
                        .select_winner(cell, spec, &results, budgeter.clone(), scope)
                        .await?;
                    self.emit_candidates(&results, Some(winner), round, scope, echo);
                    scope.emit(
                        NodeKind::Selection,
                        json!({ "winner": winner, "round": round }),
                    );

                    let outcome = match &results[winner].0 {
                        Ok(outcome) => outcome.clone(),
                        Err(e) => {
                            return Err(Error::Other(format!(
                                "selector chose a failed candidate: {e}"
                            )))
                        }
                    };

                    if round < spec.reforge {
                        round += 1;
                        seed = Some(outcome.content.clone());
                        continue;
                    }
                    return Ok(outcome);
                }
                CandidateMode::Aggregate => {
                    self.emit_candidates(&results, None, round, scope, echo);
                    return self
                        .aggregate(def, cell, spec, &results, budgeter, echo, index, scope)
                        .await;
                }
            }
        }
    }

    fn emit_candidates(
        &self,
        results: &[(Result<AgentOutcome>, Duration)],
        winner: Option<usize>,
        round: u32,
        scope: &EventScope,
        echo: &mut Echo,
    ) {
        for (i, (result, duration)) in results.iter().enumerate() {
            let mut event = scope
                .event(NodeKind::CandidateComplete)
                .with_candidate(i as u32)
                .with_duration_ms(duration.as_millis() as u64);
            if round > 0 {
                event = event.with_reforge_step(round);
            }
            if let Some(w) = winner {
                event = event.with_winner(i == w);
            }
            event = match result {
                Ok(outcome) => {
                    echo.usage.add(&outcome.usage);
                    event
                        .with_content(json!({ "text": outcome.content }))
                        .with_usage(
                            outcome.usage.prompt_tokens,
                            outcome.usage.completion_tokens,
                            outcome.usage.cost,
                        )
                }
                Err(e) => event.with_content(json!({ "error": e.to_string() })),
            };
            scope.emit_event(event);
        }
    }

    async fn select_winner(
        &self,
        cell: &Cell,
        spec: &CandidateSpec,
        results: &[(Result<AgentOutcome>, Duration)],
        budgeter: Option<Arc<TokenBudgeter>>,
        scope: &EventScope,
    ) -> Result<usize> {
        let successes: Vec<(usize, &AgentOutcome)> = results
            .iter()
            .enumerate()
            .filter_map(|(i, (r, _))| r.as_ref().ok().map(|o| (i, o)))
            .collect();
        if successes.is_empty() {
            let first_error = results
                .iter()
                .find_map(|(r, _)| r.as_ref().err())
                .map(|e| e.to_string())
                .unwrap_or_else(|| "all candidates failed".to_string());
            return Err(Error::Other(format!("all candidates failed: {first_error}")));
        }

        let heuristic = |name: &str| -> usize {
            match name {
                "shortest" => {
                    successes
                        .iter()
                        .min_by_key(|(_, o)| o.content.len())
                        .map(|(i, _)| *i)
                        .unwrap_or(successes[0].0)
                }
                "longest" => {
                    successes
                        .iter()
                        .max_by_key(|(_, o)| o.content.len())
                        .map(|(i, _)| *i)
                        .unwrap_or(successes[0].0)
                }
                _ => successes[0].0,
            }
        };

        match &spec.selector {
            None => Ok(successes[0].0),
            Some(SelectorSpec::Heuristic(name)) => Ok(heuristic(name)),
            Some(SelectorSpec::Cell { cell: selector }) => {
                let listing: String = successes
                    .iter()
                    .map(|(i, o)| format!("--- candidate {i} ---\n{}\n", o.content))
                    .collect();
                let instructions = selector
                    .instructions
                    .clone()
                    .unwrap_or_else(|| "Pick the best candidate.".to_string());
                let messages = vec![
                    Message::system(
                        "You judge candidate outputs. Reply with the number of the winning candidate and nothing else.",
                    ),
                    Message::user(format!("{instructions}\n\n{listing}")),
                ];
                let outcome = self
                    .agent_once(selector, messages, Vec::new(), budgeter, None, scope)
                    .await?;
                let picked = first_integer(&outcome.content)
                    .filter(|i| successes.iter().any(|(idx, _)| idx == i));
                match picked {
                    Some(i) => Ok(i),
                    None => {
                        tracing::warn!(
                            cell = %cell.name,
                            "selector output unparseable; falling back to first candidate"
                        );
                        Ok(successes[0].0)
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn aggregate(
        &self,
        _def: &Arc<CascadeDef>,
        cell: &Cell,
        spec: &CandidateSpec,
        results: &[(Result<AgentOutcome>, Duration)],
        budgeter: Option<Arc<TokenBudgeter>>,
        _echo: &mut Echo,
        _index: usize,
        scope: &EventScope,
    ) -> Result<AgentOutcome> {
        let aggregator = spec.aggregator.as_ref().ok_or_else(|| {
            Error::config("candidates.aggregator", "aggregate mode requires an aggregator cell")
        })?;

        let listing: String = results
            .iter()
            .enumerate()
            .filter_map(|(i, (r, _))| r.as_ref().ok().map(|o| (i, o)))
            .map(|(i, o)| format!("--- candidate {i} ---\n{}\n", o.content))
            .collect();
        if listing.is_empty() {
            return Err(Error::Other(format!(
                "all candidates of cell '{}' failed before aggregation",
                cell.name
            )));
        }

        let instructions = aggregator
            .instructions
            .clone()
            .unwrap_or_else(|| "Combine the candidate outputs into one result.".to_string());
        let messages = vec![
            Message::system("You combine multiple candidate outputs into a single result."),
            Message::user(format!("{instructions}\n\n{listing}")),
        ];
        self.agent_once(aggregator, messages, Vec::new(), budgeter, None, scope)
            .await
    }

    // -----------------------------------------------------------------------
    // Sub-cascades: run & map
    // -----------------------------------------------------------------------

    async fn execute_run_cell(
        &self,
        def: &Arc<CascadeDef>,
        cell: &Cell,
        echo: &mut Echo,
        index: usize,
    ) -> Result<Value> {
        let path = self.resolve_sub_path(def, cell)?;
        let inputs = render_json(
            &Value::Object(cell.inputs.clone().into_iter().collect()),
            &echo.scope(),
        )?;
        let outcome = self
            .run_sub_file(path, inputs, SpawnLink::child_of(echo))
            .await?;
        echo.usage.add(&outcome.usage);
        if outcome.status == CascadeStatus::Failed {
            return Err(Error::Other(format!(
                "sub-cascade '{}' failed: {}",
                outcome.cascade_id,
                outcome
                    .errors
                    .first()
                    .map(|e| e.message.clone())
                    .unwrap_or_default()
            )));
        }
        let value = json!({
            "session_id": outcome.session_id,
            "outputs": Value::Object(outcome.outputs.clone()),
        });
        echo.records.push(CellRecord {
            index,
            cell_name: cell.name.clone(),
            messages: vec![Message::assistant(value.to_string())],
            final_output: value.to_string(),
        });
        Ok(value)
    }

    async fn execute_map_cell(
        &self,
        def: &Arc<CascadeDef>,
        cell: &Cell,
        echo: &mut Echo,
        index: usize,
    ) -> Result<Value> {
        let path = self.resolve_sub_path(def, cell)?;
        let items = self.resolve_map_items(cell, echo)?;
        let bound = cell
            .max_parallel
            .unwrap_or(self.inner.config.max_parallel)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(bound));
        let link = SpawnLink::child_of(echo);

        let mut tasks = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let this = self.clone();
            let path = path.clone();
            let semaphore = semaphore.clone();
            let link = link.clone();
            let inputs = map_item_inputs(item, i);
            let depth = echo.depth;
            tasks.push(tokio::spawn(CURRENT_DEPTH.scope(depth, async move {
                let _permit = semaphore.acquire().await.map_err(|_| Error::Cancelled)?;
                this.run_sub_file(path, inputs, link).await
            })));
        }

        // join order == spawn order == input order.
        let mut outputs = Vec::with_capacity(items.len());
        for task in tasks {
            let outcome = task
                .await
                .map_err(|e| Error::Other(format!("map worker panicked: {e}")))??;
            echo.usage.add(&outcome.usage);
            if outcome.status == CascadeStatus::Failed {
                return Err(Error::Other(format!(
                    "map element failed in '{}': {}",
                    outcome.cascade_id,
                    outcome
                        .errors
                        .first()
                        .map(|e| e.message.clone())
                        .unwrap_or_default()
                )));
            }
            outputs.push(Value::Object(outcome.outputs));
        }

        let value = Value::Array(outputs);
        echo.records.push(CellRecord {
            index,
            cell_name: cell.name.clone(),
            messages: vec![Message::assistant(format!(
                "[map produced {} results]",
                items.len()
            ))],
            final_output: value.to_string(),
        });
        Ok(value)
    }

    fn resolve_sub_path(&self, def: &CascadeDef, cell: &Cell) -> Result<PathBuf> {
        let reference = cell
            .cascade
            .as_deref()
            .ok_or_else(|| Error::config("cascade", "map/run cell without a cascade path"))?;
        Ok(config::resolve_cascade_path(
            reference,
            def.source_path.as_deref(),
        ))
    }

    fn resolve_map_items(&self, cell: &Cell, echo: &Echo) -> Result<Vec<Value>> {
        let over = cell
            .over
            .as_ref()
            .ok_or_else(|| Error::config("over", "map cell without an iterable"))?;
        let resolved = match over {
            Value::String(template) => {
                let rendered = render(template, &echo.scope())?;
                serde_json::from_str::<Value>(&rendered).map_err(|e| {
                    Error::config("over", format!("map iterable is not JSON: {e}"))
                })?
            }
            other => render_json(other, &echo.scope())?,
        };
        match resolved {
            Value::Array(items) => Ok(items),
            other => Err(Error::config(
                "over",
                format!("map iterable must be an array, got {other}"),
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Validators & auto-fix
    // -----------------------------------------------------------------------

    async fn validate(
        &self,
        _def: &Arc<CascadeDef>,
        cell: &Cell,
        echo: &Echo,
        _index: usize,
        output: &Value,
        scope: &EventScope,
    ) -> Result<()> {
        let Some(validator) = &cell.validator else {
            return Ok(());
        };

        let verdict = match validator {
            ValidatorSpec::Tool(name) => {
                let tool = self.inner.registry.get(name)?;
                let raw = tool
                    .call(ToolInput::Structured(json!({
                        "cell": cell.name,
                        "output": output,
                    })))
                    .await?;
                parse_verdict(&raw)
            }
            ValidatorSpec::Cell { cell: vcell } => {
                let instructions = vcell.instructions.clone().unwrap_or_else(|| {
                    "Check whether the output satisfies the step's requirements.".to_string()
                });
                let rendered = render(&instructions, &echo.scope())?;
                let messages = vec![
                    Message::system(
                        "You validate workflow outputs. Reply with json: {\"pass\": bool, \"reason\": string}.",
                    ),
                    Message::user(format!("{rendered}\n\nOutput to validate:\n{output}")),
                ];
                let outcome = self
                    .agent_once(vcell, messages, Vec::new(), None, None, scope)
                    .await?;
                parse_verdict(&outcome.content)
            }
        };

        match verdict {
            Some((true, _)) => Ok(()),
            Some((false, reason)) => Err(Error::ValidationFailed {
                cell: cell.name.clone(),
                reason,
            }),
            None => Err(Error::ValidationFailed {
                cell: cell.name.clone(),
                reason: "validator returned no parseable verdict".to_string(),
            }),
        }
    }

    async fn auto_fix(
        &self,
        _def: &Arc<CascadeDef>,
        cell: &Cell,
        echo: &Echo,
        error: &Error,
        scope: &EventScope,
    ) -> Result<String> {
        let instructions = cell.instructions.as_deref().unwrap_or("");
        let rendered = render(instructions, &echo.scope()).unwrap_or_else(|_| instructions.to_string());
        let messages = vec![
            Message::system(
                "A workflow step failed. Produce concrete repair guidance for the retry: \
                 what went wrong and what to do differently.",
            ),
            Message::user(format!(
                "Step instructions:\n{rendered}\n\nStep inputs:\n{}\n\nError:\n{error}",
                Value::Object(cell.inputs.clone().into_iter().collect::<Map<_, _>>()),
            )),
        ];
        let outcome = self
            .agent_once(cell, messages, Vec::new(), None, None, scope)
            .await?;
        Ok(outcome.content)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

enum CellDisposition {
    Completed(Value),
    /// Error absorbed by `on_error: continue`.
    Continued(String),
    Failed(String),
}

/// Tool/agent text output → structured output value.
fn to_output_value(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str(trimmed) {
            return v;
        }
    }
    Value::String(text.to_string())
}

fn first_integer(text: &str) -> Option<usize> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Parse `{pass, reason}` out of validator output, tolerating surrounding
/// prose.
fn parse_verdict(raw: &str) -> Option<(bool, String)> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    let value: Value = serde_json::from_str(&raw[start..=end]).ok()?;
    let pass = value.get("pass")?.as_bool()?;
    let reason = value
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    Some((pass, reason))
}

/// Inputs for one map element: objects pass through, scalars wrap as
/// `{item, index}`.
fn map_item_inputs(item: &Value, index: usize) -> Value {
    match item {
        Value::Object(_) => item.clone(),
        other => json!({ "item": other, "index": index }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_value_parses_json_or_wraps_text() {
        assert_eq!(to_output_value("{\"a\": 1}"), json!({"a": 1}));
        assert_eq!(to_output_value("[1,2]"), json!([1, 2]));
        assert_eq!(to_output_value("plain words"), json!("plain words"));
        assert_eq!(to_output_value("{not json"), json!("{not json"));
    }

    #[test]
    fn first_integer_scans_prose() {
        assert_eq!(first_integer("the winner is candidate 2"), Some(2));
        assert_eq!(first_integer("0"), Some(0));
        assert_eq!(first_integer("none"), None);
    }

    #[test]
    fn verdict_parsing_tolerates_prose() {
        assert_eq!(
            parse_verdict("I think: {\"pass\": true, \"reason\": \"fine\"}"),
            Some((true, "fine".to_string()))
        );
        assert_eq!(
            parse_verdict("{\"pass\": false, \"reason\": \"too long\"}"),
            Some((false, "too long".to_string()))
        );
        assert_eq!(parse_verdict("no json"), None);
    }

    #[test]
    fn map_inputs_wrap_scalars() {
        assert_eq!(
            map_item_inputs(&json!("x"), 3),
            json!({"item": "x", "index": 3})
        );
        assert_eq!(
            map_item_inputs(&json!({"name": "x"}), 0),
            json!({"name": "x"})
        );
    }
}
