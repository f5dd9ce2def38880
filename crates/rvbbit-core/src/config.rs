//! Cascade definition loading and validation.
//!
//! Cascades are declared in YAML, parsed into typed structs, and validated at
//! load time. Everything dynamic in the YAML (cell kinds, candidate modes,
//! retention, budget strategies) becomes a closed enum here; execution never
//! re-checks shape.
//!
//! Validation errors carry a path into the YAML document
//! (`cells[2].candidates.mode`). Unknown fields are warnings, not errors, so
//! newer cascade files keep loading on older engines.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Input names a cascade may not declare.
pub const RESERVED_INPUT_NAMES: &[&str] = &["state", "outputs", "inputs"];

const DEFAULT_MAX_TURNS: u32 = 8;
const DEFAULT_RETRIES: u32 = 2;

// ---------------------------------------------------------------------------
// Cascade definition
// ---------------------------------------------------------------------------

/// A parsed, validated cascade. Immutable after load; share via `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeDef {
    pub cascade_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs_schema: BTreeMap<String, InputSpec>,
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub token_budget: Option<TokenBudgetSpec>,
    #[serde(default)]
    pub tool_caching: Option<bool>,
    #[serde(default)]
    pub training: Option<serde_json::Value>,
    /// Declares this cascade as a SQL operator (picked up at discovery).
    #[serde(default)]
    pub sql_function: Option<SqlFunctionSpec>,
    /// Declares this cascade as a registry skill (picked up at discovery).
    #[serde(default)]
    pub tackle: Option<TackleSpec>,
    /// File the cascade was loaded from; used to resolve relative
    /// sub-cascade paths.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// One declared cascade input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(rename = "type", default)]
    pub type_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

// ---------------------------------------------------------------------------
// Cells
// ---------------------------------------------------------------------------

/// What a cell executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    #[default]
    Agent,
    Tool,
    Sql,
    Python,
    Js,
    Map,
    Run,
}

/// Tool access for a cell: an explicit list, or runtime auto-selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Traits {
    List(Vec<String>),
    /// Must be the literal string `"manifest"`.
    Mode(String),
}

impl Default for Traits {
    fn default() -> Self {
        Traits::List(Vec::new())
    }
}

impl Traits {
    pub fn is_manifest(&self) -> bool {
        matches!(self, Traits::Mode(s) if s == "manifest")
    }

    pub fn names(&self) -> &[String] {
        match self {
            Traits::List(v) => v,
            Traits::Mode(_) => &[],
        }
    }
}

/// One step of a cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub name: String,
    #[serde(default)]
    pub kind: CellKind,
    #[serde(default)]
    pub model: Option<String>,
    /// Prompt template with access to `inputs`, `state`, `outputs.<cell>`.
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub traits: Traits,
    /// Template-capable argument map, rendered before execution.
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// Body for `sql` / `python` / `js` cells.
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub rules: Rules,
    /// Overrides the cascade-level token budget for this cell.
    #[serde(default)]
    pub token_budget: Option<TokenBudgetSpec>,
    #[serde(default)]
    pub candidates: Option<CandidateSpec>,
    #[serde(default)]
    pub context: Option<ContextSpec>,
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub output_extraction: Vec<ExtractionSpec>,
    #[serde(default)]
    pub handoffs: Vec<HandoffSpec>,
    #[serde(default)]
    pub validator: Option<ValidatorSpec>,
    /// Cascade path for `map` / `run` cells.
    #[serde(default)]
    pub cascade: Option<String>,
    /// Iterable for `map` cells: a JSON array or a template resolving to one.
    #[serde(default)]
    pub over: Option<serde_json::Value>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

/// Per-cell execution rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rules {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub on_error: OnErrorPolicy,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub parallel_tools: bool,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            timeout_secs: None,
            on_error: OnErrorPolicy::default(),
            retries: DEFAULT_RETRIES,
            parallel_tools: false,
        }
    }
}

fn default_max_turns() -> u32 {
    DEFAULT_MAX_TURNS
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

/// What the scheduler does when a cell fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorPolicy {
    #[default]
    Fail,
    Retry,
    AutoFix,
    Continue,
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// Candidate fan-out factor: a literal or a template evaluated at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactorSpec {
    Literal(i64),
    Template(String),
}

/// How candidate outputs collapse into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateMode {
    Select,
    Aggregate,
}

/// Winner selection: a builtin heuristic or a sub-cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectorSpec {
    /// `shortest` | `longest` | `first`
    Heuristic(String),
    Cell { cell: Box<Cell> },
}

/// Fan-out specification for a cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSpec {
    pub factor: FactorSpec,
    #[serde(default)]
    pub mode: Option<CandidateMode>,
    /// Prompt-perturbation kinds, applied round-robin from index 1.
    #[serde(default)]
    pub mutations: Vec<String>,
    /// Models to round-robin across candidates.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub selector: Option<SelectorSpec>,
    /// Aggregator cell for `mode: aggregate`.
    #[serde(default)]
    pub aggregator: Option<Box<Cell>>,
    /// Refinement rounds seeded by the winner.
    #[serde(default)]
    pub reforge: u32,
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// How much prior conversation a cell sees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    #[default]
    Full,
    OutputOnly,
    None,
    Auto,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Heuristic,
    Semantic,
    Hybrid,
}

/// Selection parameters for `retention: auto`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSpec {
    #[serde(default)]
    pub strategy: SelectionStrategy,
    pub max_tokens: usize,
}

/// Per-cell context spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSpec {
    #[serde(default)]
    pub retention: Retention,
    /// Event-kind name -> max age in intervening cells.
    #[serde(default)]
    pub ttl: BTreeMap<String, u32>,
    #[serde(default)]
    pub selection: Option<SelectionSpec>,
}

// ---------------------------------------------------------------------------
// Extraction, handoffs, validators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractFormat {
    #[default]
    Text,
    Json,
    Code,
}

/// A regex scan over the cell's final assistant content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSpec {
    pub store_as: String,
    pub pattern: String,
    #[serde(default)]
    pub format: ExtractFormat,
    #[serde(default)]
    pub required: bool,
}

/// Overrides the declared successor cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffSpec {
    pub to: String,
    /// Template; a non-empty, non-"false" render takes the handoff.
    #[serde(default)]
    pub condition: Option<String>,
}

/// A predicate over a completed cell: a tool name or a sub-cell returning
/// `{pass, reason}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidatorSpec {
    Tool(String),
    Cell { cell: Box<Cell> },
}

// ---------------------------------------------------------------------------
// Token budget
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStrategy {
    #[default]
    SlidingWindow,
    PruneOldest,
    Summarize,
    Fail,
}

/// Cascade- or cell-level token budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudgetSpec {
    pub max_total: usize,
    #[serde(default = "default_reserve")]
    pub reserve_for_output: usize,
    #[serde(default)]
    pub strategy: BudgetStrategy,
    /// Model whose tokenizer sizes the budget; defaults to the cell model.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_reserve() -> usize {
    1024
}

// ---------------------------------------------------------------------------
// SQL function block
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlShape {
    #[default]
    Scalar,
    Aggregate,
}

/// Declares a cascade as an invokable skill. The skill name defaults to the
/// cascade id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TackleSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlArgSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: String,
}

/// Declares a cascade as a SQL operator. The rewriter infers matchers from
/// the `operators` templates; the UDF bridge dispatches the cascade per row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlFunctionSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<SqlArgSpec>,
    #[serde(default)]
    pub returns: String,
    #[serde(default)]
    pub shape: SqlShape,
    /// Surface-syntax templates, e.g. `"{{ text }} MEANS {{ criterion }}"`.
    #[serde(default)]
    pub operators: Vec<String>,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub training: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Parse a cascade from a YAML string and validate it.
pub fn parse_cascade(yaml: &str) -> Result<CascadeDef> {
    warn_unknown_fields(yaml);
    let def: CascadeDef = serde_yml::from_str(yaml)
        .map_err(|e| Error::config(yaml_error_path(&e), e.to_string()))?;
    def.validate()?;
    Ok(def)
}

/// Load a cascade from disk, recording its source path for relative
/// sub-cascade resolution.
pub fn load_cascade(path: impl AsRef<Path>) -> Result<CascadeDef> {
    let path = path.as_ref();
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        Error::config(
            path.display().to_string(),
            format!("cannot read cascade file: {e}"),
        )
    })?;
    let mut def = parse_cascade(&yaml)?;
    def.source_path = Some(path.to_path_buf());
    Ok(def)
}

/// Resolve a cascade path reference relative to the referencing file.
pub fn resolve_cascade_path(reference: &str, relative_to: Option<&Path>) -> PathBuf {
    let p = Path::new(reference);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match relative_to.and_then(Path::parent) {
        Some(dir) => dir.join(p),
        None => p.to_path_buf(),
    }
}

fn yaml_error_path(e: &serde_yml::Error) -> String {
    e.location()
        .map(|l| format!("line {}, column {}", l.line(), l.column()))
        .unwrap_or_else(|| "document".to_string())
}

/// Top-level and per-cell keys the engine understands; anything else warns.
const KNOWN_TOP_KEYS: &[&str] = &[
    "cascade_id",
    "description",
    "inputs_schema",
    "cells",
    "token_budget",
    "tool_caching",
    "training",
    "sql_function",
    "tackle",
];

const KNOWN_CELL_KEYS: &[&str] = &[
    "name",
    "kind",
    "model",
    "instructions",
    "traits",
    "inputs",
    "body",
    "rules",
    "token_budget",
    "candidates",
    "context",
    "output_schema",
    "output_extraction",
    "handoffs",
    "validator",
    "cascade",
    "over",
    "max_parallel",
];

fn warn_unknown_fields(yaml: &str) {
    let Ok(value) = serde_yml::from_str::<serde_yml::Value>(yaml) else {
        return;
    };
    let Some(map) = value.as_mapping() else {
        return;
    };
    for key in map.keys() {
        if let Some(k) = key.as_str() {
            if !KNOWN_TOP_KEYS.contains(&k) {
                tracing::warn!(field = k, "unknown top-level cascade field (ignored)");
            }
        }
    }
    if let Some(cells) = map.get("cells").and_then(|c| c.as_sequence()) {
        for (i, cell) in cells.iter().enumerate() {
            if let Some(cmap) = cell.as_mapping() {
                for key in cmap.keys() {
                    if let Some(k) = key.as_str() {
                        if !KNOWN_CELL_KEYS.contains(&k) {
                            tracing::warn!(
                                field = k,
                                cell = i,
                                "unknown cell field (ignored)"
                            );
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl CascadeDef {
    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        if self.cascade_id.trim().is_empty() {
            return Err(Error::config("cascade_id", "must not be empty"));
        }
        if self.cells.is_empty() {
            return Err(Error::config("cells", "cascade must declare at least one cell"));
        }

        let mut seen = HashSet::new();
        for (i, cell) in self.cells.iter().enumerate() {
            if !seen.insert(cell.name.as_str()) {
                return Err(Error::config(
                    format!("cells[{i}].name"),
                    format!("duplicate cell name '{}'", cell.name),
                ));
            }
        }

        for name in self.inputs_schema.keys() {
            if RESERVED_INPUT_NAMES.contains(&name.as_str()) {
                return Err(Error::config(
                    format!("inputs_schema.{name}"),
                    "input name collides with a reserved template namespace",
                ));
            }
        }

        if let Some(budget) = &self.token_budget {
            budget.validate("token_budget")?;
        }

        let cell_names: HashSet<&str> = self.cells.iter().map(|c| c.name.as_str()).collect();
        for (i, cell) in self.cells.iter().enumerate() {
            cell.validate(&format!("cells[{i}]"), &cell_names)?;
        }

        Ok(())
    }

    pub fn cell(&self, name: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.name == name)
    }
}

impl TokenBudgetSpec {
    fn validate(&self, path: &str) -> Result<()> {
        if self.max_total <= self.reserve_for_output {
            return Err(Error::config(
                format!("{path}.max_total"),
                format!(
                    "max_total ({}) must exceed reserve_for_output ({})",
                    self.max_total, self.reserve_for_output
                ),
            ));
        }
        Ok(())
    }
}

impl Cell {
    fn validate(&self, path: &str, cell_names: &HashSet<&str>) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config(format!("{path}.name"), "must not be empty"));
        }

        if let Traits::Mode(mode) = &self.traits {
            if mode != "manifest" {
                return Err(Error::config(
                    format!("{path}.traits"),
                    format!("traits must be a list of tool names or the literal \"manifest\", got {mode:?}"),
                ));
            }
        }

        if let Some(budget) = &self.token_budget {
            budget.validate(&format!("{path}.token_budget"))?;
        }

        match self.kind {
            CellKind::Tool => {
                if self.traits.names().len() != 1 {
                    return Err(Error::config(
                        format!("{path}.traits"),
                        "a tool cell names exactly one tool in traits",
                    ));
                }
            }
            CellKind::Sql | CellKind::Python | CellKind::Js => {
                if self.body.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(Error::config(
                        format!("{path}.body"),
                        "sql/python/js cells require a non-empty body",
                    ));
                }
            }
            CellKind::Map | CellKind::Run => {
                if self.cascade.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(Error::config(
                        format!("{path}.cascade"),
                        "map/run cells require a cascade path",
                    ));
                }
                if self.kind == CellKind::Map && self.over.is_none() {
                    return Err(Error::config(
                        format!("{path}.over"),
                        "map cells require an iterable in `over`",
                    ));
                }
            }
            CellKind::Agent => {}
        }

        if let Some(candidates) = &self.candidates {
            candidates.validate(&format!("{path}.candidates"))?;
        }

        for (j, handoff) in self.handoffs.iter().enumerate() {
            if !cell_names.contains(handoff.to.as_str()) {
                return Err(Error::config(
                    format!("{path}.handoffs[{j}].to"),
                    format!("handoff target '{}' is not a cell in this cascade", handoff.to),
                ));
            }
        }

        for (j, ext) in self.output_extraction.iter().enumerate() {
            if let Err(e) = regex::try_parse(&ext.pattern) {
                return Err(Error::config(
                    format!("{path}.output_extraction[{j}].pattern"),
                    format!("invalid regex: {e}"),
                ));
            }
        }

        Ok(())
    }
}

/// Minimal regex pre-parse so config errors surface at load, not execution.
/// Kept in a module so the `regex` crate stays out of core's dependencies.
mod regex {
    /// Reject the syntax errors we can detect without a full regex engine:
    /// unbalanced groups/classes and a dangling trailing escape.
    pub fn try_parse(pattern: &str) -> Result<(), String> {
        let mut depth: i32 = 0;
        let mut in_class = false;
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if chars.next().is_none() {
                        return Err("trailing backslash".to_string());
                    }
                }
                '[' if !in_class => in_class = true,
                ']' if in_class => in_class = false,
                '(' if !in_class => depth += 1,
                ')' if !in_class => {
                    depth -= 1;
                    if depth < 0 {
                        return Err("unbalanced ')'".to_string());
                    }
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err("unbalanced '('".to_string());
        }
        if in_class {
            return Err("unterminated character class".to_string());
        }
        Ok(())
    }
}

impl CandidateSpec {
    fn validate(&self, path: &str) -> Result<()> {
        if let FactorSpec::Literal(n) = self.factor {
            if n <= 0 {
                return Err(Error::config(
                    format!("{path}.factor"),
                    format!("factor must be positive, got {n}"),
                ));
            }
            if n > 1 && self.mode.is_none() {
                return Err(Error::config(
                    format!("{path}.mode"),
                    "candidates with factor > 1 must declare mode (select | aggregate)",
                ));
            }
        }

        if self.reforge > 0 && self.mode != Some(CandidateMode::Select) {
            return Err(Error::config(
                format!("{path}.reforge"),
                "reforge requires mode: select",
            ));
        }

        if self.mode == Some(CandidateMode::Aggregate) && self.aggregator.is_none() {
            return Err(Error::config(
                format!("{path}.aggregator"),
                "aggregate mode requires an aggregator cell",
            ));
        }

        if let Some(SelectorSpec::Heuristic(h)) = &self.selector {
            if !matches!(h.as_str(), "shortest" | "longest" | "first") {
                return Err(Error::config(
                    format!("{path}.selector"),
                    format!("unknown selector heuristic {h:?} (expected shortest | longest | first)"),
                ));
            }
        }

        Ok(())
    }
}
