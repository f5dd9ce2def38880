//! The SQL rewriter: turns cascade-flavored SQL into standard SQL whose only
//! extensions are UDF calls the OLAP engine understands.
//!
//! The rewriter is token-based, not regex-based: patterns walk the
//! significant tokens of the statement and never look inside string or
//! comment tokens. Operator definitions are data — each cascade's
//! `sql_function.operators` templates are inferred into matchers at
//! discovery time, so adding an operator is a YAML change, not a code
//! change.

use std::collections::HashMap;

use rvbbit_core::config::SqlFunctionSpec;
use rvbbit_core::{Error, Result};

use crate::token::{comment_hints, render, tokenize, Token, TokenKind};

/// Aggregate semantic operators: splitting a GROUP BY across UNION-ALL
/// branches would partition groups, so these block parallel hints.
const AGGREGATE_SEMANTIC_FUNCS: &[&str] = &[
    "SUMMARIZE",
    "THEMES",
    "CLUSTER",
    "CONSENSUS",
    "DEDUPE",
    "OUTLIERS",
    "SENTIMENT",
];

// ---------------------------------------------------------------------------
// Pattern model
// ---------------------------------------------------------------------------

/// One element of an operator pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum PatElem {
    /// A primary expression: column ref, literal, parameter, function call,
    /// or parenthesized group.
    Capture,
    /// A literal keyword, matched case-insensitively.
    Keyword(String),
    /// A literal symbol token (e.g. `~`).
    Sym(String),
}

/// An inferred or builtin operator matcher.
#[derive(Debug, Clone)]
pub struct OperatorRule {
    pub udf: String,
    pub elements: Vec<PatElem>,
    /// Output template; `{0}`, `{1}` ... are capture slots.
    pub output: String,
    pub priority: i32,
}

/// Function-style surface syntax with an argument transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    VectorSearch,
    ElasticSearch,
    KeywordSearch,
    HybridSearch,
}

impl CallKind {
    fn surface(&self) -> &'static str {
        match self {
            CallKind::VectorSearch => "VECTOR_SEARCH",
            CallKind::ElasticSearch => "ELASTIC_SEARCH",
            CallKind::KeywordSearch => "KEYWORD_SEARCH",
            CallKind::HybridSearch => "HYBRID_SEARCH",
        }
    }

    /// Render the rewritten call from the raw argument expressions.
    fn render(&self, args: &[String]) -> Result<String> {
        let arity = args.len();
        match self {
            CallKind::VectorSearch => {
                if !(2..=4).contains(&arity) {
                    return Err(Error::Sql(format!(
                        "VECTOR_SEARCH takes 2-4 arguments, got {arity}"
                    )));
                }
                // VECTOR_SEARCH('q', table.column, k, min_score)
                let query = &args[0];
                let (table, column) = split_table_column(&args[1])?;
                let k = args.get(2).cloned().unwrap_or_else(|| "10".to_string());
                let min_score = args.get(3).cloned().unwrap_or_else(|| "0.0".to_string());
                Ok(format!(
                    "read_json_auto(vector_search_json({query}, '{table}', '{column}', {k}, {min_score}))"
                ))
            }
            CallKind::ElasticSearch => Ok(format!("elastic_search_json({})", args.join(", "))),
            CallKind::KeywordSearch => {
                // Keyword-only: zero semantic weight, full keyword weight.
                Ok(format!("hybrid_search_json({}, 0.0, 1.0)", args.join(", ")))
            }
            CallKind::HybridSearch => Ok(format!("hybrid_search_json({})", args.join(", "))),
        }
    }
}

fn split_table_column(reference: &str) -> Result<(String, String)> {
    let mut parts = reference.rsplitn(2, '.');
    let column = parts.next().unwrap_or_default().trim().to_string();
    let table = parts.next().unwrap_or_default().trim().to_string();
    if table.is_empty() || column.is_empty() {
        return Err(Error::Sql(format!(
            "expected table.column reference, got {reference:?}"
        )));
    }
    Ok((table, column))
}

// ---------------------------------------------------------------------------
// Rewrite results
// ---------------------------------------------------------------------------

/// A non-query directive recognized at statement start.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// `RVBBIT RUN '<path>' WITH (<json>)`
    Run { path: String, inputs_json: String },
    /// `RVBBIT MAP '<path>' USING (<subquery>)`
    Map { path: String, subquery: String },
    /// `RVBBIT EMBED table.column USING (<subquery>) WITH (k=v, ...)`
    Embed {
        table: String,
        column: String,
        subquery: String,
        options: HashMap<String, String>,
    },
    /// `BACKGROUND <stmt>`
    Background { statement: String },
    /// `ANALYZE <stmt>`
    Analyze { statement: String },
}

/// Result of rewriting one statement.
#[derive(Debug, Clone)]
pub enum Rewritten {
    Query {
        sql: String,
        hints: HashMap<String, String>,
        warnings: Vec<String>,
        /// Safe UNION-ALL branch count, when a parallel hint applies.
        parallel: Option<usize>,
    },
    Directive(Directive),
}

// ---------------------------------------------------------------------------
// Rewriter
// ---------------------------------------------------------------------------

pub struct SqlRewriter {
    rules: Vec<OperatorRule>,
    calls: Vec<CallKind>,
}

impl Default for SqlRewriter {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlRewriter {
    /// Rewriter with the builtin semantic operator set.
    pub fn new() -> Self {
        let mut rewriter = Self {
            rules: Vec::new(),
            calls: vec![
                CallKind::VectorSearch,
                CallKind::ElasticSearch,
                CallKind::KeywordSearch,
                CallKind::HybridSearch,
            ],
        };
        rewriter.add_rule(OperatorRule {
            udf: "semantic_matches".into(),
            elements: vec![
                PatElem::Capture,
                PatElem::Keyword("MEANS".into()),
                PatElem::Capture,
            ],
            output: "semantic_matches({0}, {1})".into(),
            priority: 100,
        });
        rewriter.add_rule(OperatorRule {
            udf: "semantic_about".into(),
            elements: vec![
                PatElem::Capture,
                PatElem::Keyword("ABOUT".into()),
                PatElem::Capture,
            ],
            output: "semantic_about({0}, {1})".into(),
            priority: 100,
        });
        rewriter.add_rule(OperatorRule {
            udf: "semantic_extract".into(),
            elements: vec![
                PatElem::Capture,
                PatElem::Keyword("EXTRACTS".into()),
                PatElem::Capture,
            ],
            output: "semantic_extract({0}, {1})".into(),
            priority: 100,
        });
        rewriter.add_rule(OperatorRule {
            udf: "semantic_implies".into(),
            elements: vec![
                PatElem::Capture,
                PatElem::Keyword("IMPLIES".into()),
                PatElem::Capture,
            ],
            output: "semantic_implies({0}, {1})".into(),
            priority: 100,
        });
        rewriter.add_rule(OperatorRule {
            udf: "semantic_fuzzy".into(),
            elements: vec![
                PatElem::Capture,
                PatElem::Sym("~".into()),
                PatElem::Capture,
            ],
            output: "semantic_fuzzy({0}, {1})".into(),
            priority: 90,
        });
        rewriter
    }

    pub fn add_rule(&mut self, rule: OperatorRule) {
        self.rules.push(rule);
        // Longer patterns first, then priority.
        self.rules.sort_by(|a, b| {
            b.elements
                .len()
                .cmp(&a.elements.len())
                .then(b.priority.cmp(&a.priority))
        });
    }

    /// Infer a matcher from a `sql_function.operators` template like
    /// `"{{ text }} ALIGNS WITH {{ narrative }}"`: keywords are literal,
    /// placeholders are captures, at priority 50.
    pub fn register_operator_template(&mut self, template: &str, udf: &str) -> Result<()> {
        let mut elements = Vec::new();
        let mut capture_count = 0usize;
        let mut rest = template.trim();

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix("{{") {
                let end = after
                    .find("}}")
                    .ok_or_else(|| Error::Sql(format!("unclosed placeholder in {template:?}")))?;
                elements.push(PatElem::Capture);
                capture_count += 1;
                rest = after[end + 2..].trim_start();
            } else {
                let next_placeholder = rest.find("{{").unwrap_or(rest.len());
                for word in rest[..next_placeholder].split_whitespace() {
                    elements.push(PatElem::Keyword(word.to_uppercase()));
                }
                rest = rest[next_placeholder..].trim_start();
            }
        }

        if capture_count == 0 {
            return Err(Error::Sql(format!(
                "operator template {template:?} has no captures"
            )));
        }

        let slots: Vec<String> = (0..capture_count).map(|i| format!("{{{i}}}")).collect();
        self.add_rule(OperatorRule {
            udf: udf.to_string(),
            elements,
            output: format!("{udf}({})", slots.join(", ")),
            priority: 50,
        });
        Ok(())
    }

    /// Register every operator template of a discovered `sql_function` block.
    pub fn register_sql_function(&mut self, spec: &SqlFunctionSpec) -> Result<()> {
        for template in &spec.operators {
            self.register_operator_template(template, &spec.name)?;
        }
        Ok(())
    }

    /// Rewrite one statement.
    pub fn rewrite(&self, sql: &str) -> Result<Rewritten> {
        let tokens = tokenize(sql);
        let hints = comment_hints(&tokens);

        if let Some(directive) = parse_directive(&tokens)? {
            return Ok(Rewritten::Directive(directive));
        }

        let mut tokens = tokens;
        let mut pass = 0;
        loop {
            pass += 1;
            if pass > 16 {
                return Err(Error::Sql("rewrite did not converge".into()));
            }
            let (next, changed) = self.rewrite_pass(tokens)?;
            tokens = next;
            if !changed {
                break;
            }
        }

        let mut warnings = Vec::new();
        let parallel = match hints.get("parallel").and_then(|v| v.parse::<usize>().ok()) {
            Some(n) if n > 1 => {
                if has_grouped_semantic_aggregate(&tokens) {
                    warnings.push(
                        "parallel hint ignored: aggregate semantic operators with GROUP BY \
                         cannot be split across UNION ALL branches"
                            .to_string(),
                    );
                    None
                } else {
                    Some(n)
                }
            }
            _ => None,
        };

        Ok(Rewritten::Query {
            sql: render(&tokens),
            hints,
            warnings,
            parallel,
        })
    }

    /// One splice pass; returns whether anything changed.
    fn rewrite_pass(&self, tokens: Vec<Token>) -> Result<(Vec<Token>, bool)> {
        let sig: Vec<usize> = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_significant())
            .map(|(i, _)| i)
            .collect();

        // Function-style calls first (their arguments may contain infix
        // operators that must not match through the call boundary).
        for (si, &ti) in sig.iter().enumerate() {
            let token = &tokens[ti];
            if token.kind != TokenKind::Word {
                continue;
            }
            for call in &self.calls {
                if !token.text.eq_ignore_ascii_case(call.surface()) {
                    continue;
                }
                if let Some((args, end_sig)) = parse_call_args(&tokens, &sig, si) {
                    let rendered = call.render(&args)?;
                    let spliced = splice(&tokens, &sig, si, end_sig, rendered);
                    return Ok((spliced, true));
                }
            }
        }

        for (si, _) in sig.iter().enumerate() {
            for rule in &self.rules {
                if let Some((end_sig, captures)) = match_rule(rule, &tokens, &sig, si) {
                    let mut out = rule.output.clone();
                    for (ci, capture) in captures.iter().enumerate() {
                        out = out.replace(&format!("{{{ci}}}"), capture);
                    }
                    let spliced = splice(&tokens, &sig, si, end_sig, out);
                    return Ok((spliced, true));
                }
            }
        }

        Ok((tokens, false))
    }
}

// ---------------------------------------------------------------------------
// Matching machinery
// ---------------------------------------------------------------------------

/// Try to match `rule` starting at significant index `start`. Returns the
/// exclusive significant end index and the captured expression texts.
fn match_rule(
    rule: &OperatorRule,
    tokens: &[Token],
    sig: &[usize],
    start: usize,
) -> Option<(usize, Vec<String>)> {
    let mut pos = start;
    let mut captures = Vec::new();

    for element in &rule.elements {
        match element {
            PatElem::Capture => {
                let (text, next) = capture_expr(tokens, sig, pos)?;
                captures.push(text);
                pos = next;
            }
            PatElem::Keyword(kw) => {
                let token = tokens.get(*sig.get(pos)?)?;
                if !token.is_keyword(kw) {
                    return None;
                }
                pos += 1;
            }
            PatElem::Sym(sym) => {
                let token = tokens.get(*sig.get(pos)?)?;
                if !token.is_symbol(sym) {
                    return None;
                }
                pos += 1;
            }
        }
    }
    Some((pos, captures))
}

/// Capture one primary expression at significant position `pos`:
/// a (possibly dotted) identifier, optionally a call with balanced parens,
/// a literal, a parameter, or a parenthesized group.
fn capture_expr(tokens: &[Token], sig: &[usize], pos: usize) -> Option<(String, usize)> {
    let ti = *sig.get(pos)?;
    let token = &tokens[ti];

    match token.kind {
        TokenKind::Str | TokenKind::Number | TokenKind::Param => {
            Some((token.text.clone(), pos + 1))
        }
        TokenKind::Word | TokenKind::QuotedIdent => {
            // Clause keywords never start a capturable expression; without
            // this, `FROM t` would capture `FROM`.
            if is_clause_keyword(&token.text) {
                return None;
            }
            let mut text = token.text.clone();
            let mut pos = pos + 1;
            // Dotted reference
            loop {
                let Some(&dot_ti) = sig.get(pos) else { break };
                if !tokens[dot_ti].is_symbol(".") {
                    break;
                }
                let Some(&part_ti) = sig.get(pos + 1) else { break };
                let part = &tokens[part_ti];
                if !matches!(part.kind, TokenKind::Word | TokenKind::QuotedIdent) {
                    break;
                }
                text.push('.');
                text.push_str(&part.text);
                pos += 2;
            }
            // Call arguments
            if let Some(&paren_ti) = sig.get(pos) {
                if tokens[paren_ti].is_symbol("(") {
                    let (group, next) = capture_group(tokens, sig, pos)?;
                    text.push_str(&group);
                    pos = next;
                }
            }
            Some((text, pos))
        }
        TokenKind::Symbol if token.text == "(" => capture_group(tokens, sig, pos),
        _ => None,
    }
}

/// Capture a balanced parenthesized group starting at `pos` (which must be
/// `(`); returns its rendered text including parens.
fn capture_group(tokens: &[Token], sig: &[usize], pos: usize) -> Option<(String, usize)> {
    let open_ti = *sig.get(pos)?;
    if !tokens[open_ti].is_symbol("(") {
        return None;
    }
    let mut depth = 0i32;
    for (offset, &ti) in sig[pos..].iter().enumerate() {
        let token = &tokens[ti];
        if token.is_symbol("(") {
            depth += 1;
        } else if token.is_symbol(")") {
            depth -= 1;
            if depth == 0 {
                return Some((render(&tokens[open_ti..=ti]), pos + offset + 1));
            }
        }
    }
    None
}

fn is_clause_keyword(word: &str) -> bool {
    matches!(
        word.to_ascii_uppercase().as_str(),
        "SELECT"
            | "FROM"
            | "WHERE"
            | "AND"
            | "OR"
            | "NOT"
            | "GROUP"
            | "ORDER"
            | "BY"
            | "HAVING"
            | "LIMIT"
            | "OFFSET"
            | "JOIN"
            | "ON"
            | "AS"
            | "UNION"
            | "ALL"
            | "CASE"
            | "WHEN"
            | "THEN"
            | "ELSE"
            | "END"
            | "INSERT"
            | "UPDATE"
            | "DELETE"
            | "SET"
            | "VALUES"
            | "DISTINCT"
    )
}

/// Replace the significant range `[start_sig, end_sig)` with a single word
/// token, keeping surrounding trivia.
fn splice(
    tokens: &[Token],
    sig: &[usize],
    start_sig: usize,
    end_sig: usize,
    replacement: String,
) -> Vec<Token> {
    let first_ti = sig[start_sig];
    let last_ti = sig[end_sig - 1];
    let mut out = Vec::with_capacity(tokens.len());
    out.extend_from_slice(&tokens[..first_ti]);
    out.push(Token::new(TokenKind::Word, replacement));
    out.extend_from_slice(&tokens[last_ti + 1..]);
    out
}

/// Parse `NAME(arg, arg, ...)` starting at significant index `si` (the
/// name). Returns top-level-comma-split argument texts and the exclusive
/// significant end.
fn parse_call_args(
    tokens: &[Token],
    sig: &[usize],
    si: usize,
) -> Option<(Vec<String>, usize)> {
    let open_sig = si + 1;
    let open_ti = *sig.get(open_sig)?;
    if !tokens[open_ti].is_symbol("(") {
        return None;
    }

    let mut depth = 0i32;
    let mut args = Vec::new();
    let mut current = String::new();
    for (offset, &ti) in sig[open_sig..].iter().enumerate() {
        let token = &tokens[ti];
        if token.is_symbol("(") {
            depth += 1;
            if depth > 1 {
                current.push('(');
            }
            continue;
        }
        if token.is_symbol(")") {
            depth -= 1;
            if depth == 0 {
                if !current.trim().is_empty() {
                    args.push(current.trim().to_string());
                }
                return Some((args, open_sig + offset + 1));
            }
            current.push(')');
            continue;
        }
        if token.is_symbol(",") && depth == 1 {
            args.push(current.trim().to_string());
            current.clear();
            continue;
        }
        if !current.is_empty() && needs_space(&current, token) {
            current.push(' ');
        }
        current.push_str(&token.text);
    }
    None
}

fn needs_space(current: &str, token: &Token) -> bool {
    let last = current.chars().last().unwrap_or(' ');
    if last == '.' || token.is_symbol(".") {
        return false;
    }
    matches!(token.kind, TokenKind::Word | TokenKind::Str | TokenKind::Number)
        && (last.is_ascii_alphanumeric() || last == '\'' || last == '_')
}

fn has_grouped_semantic_aggregate(tokens: &[Token]) -> bool {
    let sig: Vec<&Token> = tokens.iter().filter(|t| t.is_significant()).collect();
    let mut has_group_by = false;
    let mut has_aggregate = false;
    for (i, token) in sig.iter().enumerate() {
        if token.is_keyword("GROUP")
            && sig.get(i + 1).map(|t| t.is_keyword("BY")).unwrap_or(false)
        {
            has_group_by = true;
        }
        if token.kind == TokenKind::Word
            && AGGREGATE_SEMANTIC_FUNCS
                .iter()
                .any(|f| token.text.eq_ignore_ascii_case(f))
            && sig.get(i + 1).map(|t| t.is_symbol("(")).unwrap_or(false)
        {
            has_aggregate = true;
        }
    }
    has_group_by && has_aggregate
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

fn parse_directive(tokens: &[Token]) -> Result<Option<Directive>> {
    let sig: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| t.is_significant())
        .map(|(i, _)| i)
        .collect();
    let Some(&first_ti) = sig.first() else {
        return Ok(None);
    };
    let first = &tokens[first_ti];

    if first.is_keyword("BACKGROUND") {
        let statement = render(&tokens[first_ti + 1..]).trim().to_string();
        if statement.is_empty() {
            return Err(Error::Sql("BACKGROUND requires a statement".into()));
        }
        return Ok(Some(Directive::Background { statement }));
    }

    if first.is_keyword("ANALYZE") {
        let statement = render(&tokens[first_ti + 1..]).trim().to_string();
        if statement.is_empty() {
            return Err(Error::Sql("ANALYZE requires a statement".into()));
        }
        return Ok(Some(Directive::Analyze { statement }));
    }

    if !first.is_keyword("RVBBIT") {
        return Ok(None);
    }
    let verb_ti = *sig
        .get(1)
        .ok_or_else(|| Error::Sql("RVBBIT requires a verb (RUN | MAP | EMBED)".into()))?;
    let verb = &tokens[verb_ti];

    if verb.is_keyword("RUN") {
        let path = expect_string(tokens, &sig, 2, "RVBBIT RUN '<path>'")?;
        let inputs_json = match keyword_position(tokens, &sig, "WITH") {
            Some(with_sig) => group_text(tokens, &sig, with_sig + 1)
                .ok_or_else(|| Error::Sql("RVBBIT RUN WITH requires (<json>)".into()))?,
            None => "{}".to_string(),
        };
        return Ok(Some(Directive::Run { path, inputs_json }));
    }

    if verb.is_keyword("MAP") {
        let path = expect_string(tokens, &sig, 2, "RVBBIT MAP '<path>'")?;
        let using_sig = keyword_position(tokens, &sig, "USING")
            .ok_or_else(|| Error::Sql("RVBBIT MAP requires USING (<subquery>)".into()))?;
        let subquery = group_text(tokens, &sig, using_sig + 1)
            .ok_or_else(|| Error::Sql("RVBBIT MAP requires USING (<subquery>)".into()))?;
        return Ok(Some(Directive::Map { path, subquery }));
    }

    if verb.is_keyword("EMBED") {
        // table.column
        let table_ti = *sig
            .get(2)
            .ok_or_else(|| Error::Sql("RVBBIT EMBED requires table.column".into()))?;
        let dot_ok = sig
            .get(3)
            .map(|&ti| tokens[ti].is_symbol("."))
            .unwrap_or(false);
        let column_ti = sig.get(4).copied();
        let (table, column) = match (tokens.get(table_ti), dot_ok, column_ti) {
            (Some(t), true, Some(c_ti)) if t.kind == TokenKind::Word => {
                (t.text.clone(), tokens[c_ti].text.clone())
            }
            _ => return Err(Error::Sql("RVBBIT EMBED requires table.column".into())),
        };

        let using_sig = keyword_position(tokens, &sig, "USING")
            .ok_or_else(|| Error::Sql("RVBBIT EMBED requires USING (<subquery>)".into()))?;
        let subquery = group_text(tokens, &sig, using_sig + 1)
            .ok_or_else(|| Error::Sql("RVBBIT EMBED requires USING (<subquery>)".into()))?;

        let mut options = HashMap::new();
        if let Some(with_sig) = keyword_position(tokens, &sig, "WITH") {
            if let Some(body) = group_text(tokens, &sig, with_sig + 1) {
                for pair in body.split(',') {
                    if let Some((k, v)) = pair.split_once('=') {
                        options.insert(
                            k.trim().to_string(),
                            v.trim().trim_matches('\'').to_string(),
                        );
                    }
                }
            }
        }
        return Ok(Some(Directive::Embed {
            table,
            column,
            subquery,
            options,
        }));
    }

    Err(Error::Sql(format!(
        "unknown RVBBIT verb: {:?} (expected RUN | MAP | EMBED)",
        verb.text
    )))
}

fn expect_string(tokens: &[Token], sig: &[usize], pos: usize, what: &str) -> Result<String> {
    let ti = *sig
        .get(pos)
        .ok_or_else(|| Error::Sql(format!("{what}: missing path")))?;
    let token = &tokens[ti];
    if token.kind != TokenKind::Str {
        return Err(Error::Sql(format!("{what}: expected a quoted path")));
    }
    Ok(unquote(&token.text))
}

fn keyword_position(tokens: &[Token], sig: &[usize], keyword: &str) -> Option<usize> {
    sig.iter()
        .position(|&ti| tokens[ti].is_keyword(keyword))
}

/// Text between the parens of a group starting at significant index `pos`.
fn group_text(tokens: &[Token], sig: &[usize], pos: usize) -> Option<String> {
    let open_ti = *sig.get(pos)?;
    if !tokens[open_ti].is_symbol("(") {
        return None;
    }
    let mut depth = 0i32;
    for &ti in &sig[pos..] {
        let token = &tokens[ti];
        if token.is_symbol("(") {
            depth += 1;
        } else if token.is_symbol(")") {
            depth -= 1;
            if depth == 0 {
                return Some(render(&tokens[open_ti + 1..ti]).trim().to_string());
            }
        }
    }
    None
}

/// Strip surrounding single quotes and unescape doubled quotes.
pub fn unquote(literal: &str) -> String {
    literal
        .trim_start_matches('\'')
        .trim_end_matches('\'')
        .replace("''", "'")
}

/// Conservative UNION-ALL splitter for parallel hints. Only splits
/// single-table `SELECT ... FROM <table> [WHERE ...]` statements by
/// partitioning on rowid; anything more complex returns `None` and runs
/// sequentially.
pub fn union_all_split(sql: &str, branches: usize) -> Option<String> {
    let tokens = tokenize(sql);
    let sig: Vec<&Token> = tokens.iter().filter(|t| t.is_significant()).collect();
    if sig.first().map(|t| !t.is_keyword("SELECT")).unwrap_or(true) {
        return None;
    }
    for blocked in ["GROUP", "ORDER", "LIMIT", "JOIN", "UNION", "OFFSET"] {
        if sig.iter().any(|t| t.is_keyword(blocked)) {
            return None;
        }
    }
    let from_count = sig.iter().filter(|t| t.is_keyword("FROM")).count();
    if from_count != 1 {
        return None;
    }
    let has_where = sig.iter().any(|t| t.is_keyword("WHERE"));

    let base = sql.trim().trim_end_matches(';');
    let parts: Vec<String> = (0..branches)
        .map(|i| {
            if has_where {
                format!("{base} AND ((rowid % {branches}) = {i})")
            } else {
                format!("{base} WHERE ((rowid % {branches}) = {i})")
            }
        })
        .collect();
    Some(parts.join(" UNION ALL "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite_sql(sql: &str) -> String {
        match SqlRewriter::new().rewrite(sql).unwrap() {
            Rewritten::Query { sql, .. } => sql,
            other => panic!("expected query, got {other:?}"),
        }
    }

    #[test]
    fn plain_sql_is_identity() {
        for sql in [
            "SELECT 1",
            "SELECT a, b FROM t WHERE x > 3 ORDER BY a",
            "INSERT INTO t VALUES (1, 'two')",
            "SELECT 'MEANS nothing here' FROM t",
        ] {
            assert_eq!(rewrite_sql(sql), sql, "identity violated for {sql}");
        }
    }

    #[test]
    fn means_rewrites_to_udf() {
        assert_eq!(
            rewrite_sql("SELECT * FROM reviews WHERE body MEANS 'angry customer'"),
            "SELECT * FROM reviews WHERE semantic_matches(body, 'angry customer')"
        );
    }

    #[test]
    fn about_with_threshold() {
        assert_eq!(
            rewrite_sql("SELECT * FROM docs WHERE text ABOUT 'climate' > 0.7"),
            "SELECT * FROM docs WHERE semantic_about(text, 'climate') > 0.7"
        );
    }

    #[test]
    fn extracts_with_dotted_column() {
        assert_eq!(
            rewrite_sql("SELECT t.name EXTRACTS 'first_name' AS fn FROM people t"),
            "SELECT semantic_extract(t.name, 'first_name') AS fn FROM people t"
        );
    }

    #[test]
    fn fuzzy_and_implies() {
        assert_eq!(
            rewrite_sql("SELECT * FROM t WHERE a ~ b"),
            "SELECT * FROM t WHERE semantic_fuzzy(a, b)"
        );
        assert_eq!(
            rewrite_sql("SELECT * FROM t WHERE claim IMPLIES conclusion"),
            "SELECT * FROM t WHERE semantic_implies(claim, conclusion)"
        );
    }

    #[test]
    fn multiple_operators_in_one_statement() {
        assert_eq!(
            rewrite_sql("SELECT * FROM t WHERE a MEANS 'x' AND b MEANS 'y'"),
            "SELECT * FROM t WHERE semantic_matches(a, 'x') AND semantic_matches(b, 'y')"
        );
    }

    #[test]
    fn operators_inside_strings_and_comments_untouched() {
        let sql = "SELECT 'a MEANS b' AS s -- c MEANS 'd'\nFROM t";
        assert_eq!(rewrite_sql(sql), sql);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let first = rewrite_sql("SELECT * FROM t WHERE a MEANS 'x'");
        assert_eq!(rewrite_sql(&first), first);
    }

    #[test]
    fn vector_search_rewrites_to_read_json_auto() {
        assert_eq!(
            rewrite_sql("SELECT * FROM VECTOR_SEARCH('rust tips', docs.body, 5, 0.6)"),
            "SELECT * FROM read_json_auto(vector_search_json('rust tips', 'docs', 'body', 5, 0.6))"
        );
        // Defaults for k and min_score.
        assert_eq!(
            rewrite_sql("SELECT * FROM VECTOR_SEARCH('q', docs.body)"),
            "SELECT * FROM read_json_auto(vector_search_json('q', 'docs', 'body', 10, 0.0))"
        );
    }

    #[test]
    fn search_variants_get_weights() {
        assert_eq!(
            rewrite_sql("SELECT * FROM KEYWORD_SEARCH('q', 'docs')"),
            "SELECT * FROM hybrid_search_json('q', 'docs', 0.0, 1.0)"
        );
        assert_eq!(
            rewrite_sql("SELECT * FROM HYBRID_SEARCH('q', 'docs', 0.7, 0.3)"),
            "SELECT * FROM hybrid_search_json('q', 'docs', 0.7, 0.3)"
        );
    }

    #[test]
    fn inferred_operator_from_template() {
        let mut rewriter = SqlRewriter::new();
        rewriter
            .register_operator_template("{{ text }} ALIGNS WITH {{ narrative }}", "semantic_aligns")
            .unwrap();
        match rewriter
            .rewrite("SELECT * FROM posts WHERE body ALIGNS WITH 'optimism'")
            .unwrap()
        {
            Rewritten::Query { sql, .. } => assert_eq!(
                sql,
                "SELECT * FROM posts WHERE semantic_aligns(body, 'optimism')"
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn inferred_operator_skips_strings() {
        let mut rewriter = SqlRewriter::new();
        rewriter
            .register_operator_template("{{ a }} ALIGNS WITH {{ b }}", "semantic_aligns")
            .unwrap();
        let sql = "SELECT 'x ALIGNS WITH y' FROM t";
        match rewriter.rewrite(sql).unwrap() {
            Rewritten::Query { sql: out, .. } => assert_eq!(out, sql),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parallel_hint_safe_query() {
        let rewriter = SqlRewriter::new();
        match rewriter
            .rewrite("-- @ parallel: 5\nSELECT * FROM t WHERE a MEANS 'x'")
            .unwrap()
        {
            Rewritten::Query { parallel, warnings, .. } => {
                assert_eq!(parallel, Some(5));
                assert!(warnings.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parallel_hint_blocked_by_grouped_aggregate() {
        let rewriter = SqlRewriter::new();
        match rewriter
            .rewrite("-- @ parallel: 5\nSELECT cat, SUMMARIZE(body) FROM t GROUP BY cat")
            .unwrap()
        {
            Rewritten::Query { parallel, warnings, .. } => {
                assert_eq!(parallel, None);
                assert_eq!(warnings.len(), 1);
                assert!(warnings[0].contains("GROUP BY"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn union_all_split_partitions_simple_select() {
        let split = union_all_split("SELECT * FROM t", 3).unwrap();
        assert_eq!(split.matches("UNION ALL").count(), 2);
        assert!(split.contains("(rowid % 3) = 0"));
        assert!(split.contains("(rowid % 3) = 2"));

        let split = union_all_split("SELECT * FROM t WHERE x > 1", 2).unwrap();
        assert!(split.contains("WHERE x > 1 AND ((rowid % 2) = 0)"));

        assert!(union_all_split("SELECT a, SUM(b) FROM t GROUP BY a", 2).is_none());
        assert!(union_all_split("SELECT * FROM a JOIN b ON a.x = b.x", 2).is_none());
    }

    #[test]
    fn background_and_analyze_directives() {
        let rewriter = SqlRewriter::new();
        match rewriter.rewrite("BACKGROUND SELECT * FROM slow").unwrap() {
            Rewritten::Directive(Directive::Background { statement }) => {
                assert_eq!(statement, "SELECT * FROM slow");
            }
            other => panic!("unexpected {other:?}"),
        }
        match rewriter.rewrite("ANALYZE SELECT * FROM t").unwrap() {
            Rewritten::Directive(Directive::Analyze { statement }) => {
                assert_eq!(statement, "SELECT * FROM t");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rvbbit_run_directive() {
        let rewriter = SqlRewriter::new();
        match rewriter
            .rewrite("RVBBIT RUN 'flows/triage.yaml' WITH ({\"ticket\": 42})")
            .unwrap()
        {
            Rewritten::Directive(Directive::Run { path, inputs_json }) => {
                assert_eq!(path, "flows/triage.yaml");
                assert_eq!(inputs_json, "{\"ticket\": 42}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rvbbit_map_directive() {
        let rewriter = SqlRewriter::new();
        match rewriter
            .rewrite("RVBBIT MAP 'flows/score.yaml' USING (SELECT id, body FROM tickets)")
            .unwrap()
        {
            Rewritten::Directive(Directive::Map { path, subquery }) => {
                assert_eq!(path, "flows/score.yaml");
                assert_eq!(subquery, "SELECT id, body FROM tickets");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rvbbit_embed_directive() {
        let rewriter = SqlRewriter::new();
        match rewriter
            .rewrite(
                "RVBBIT EMBED docs.body USING (SELECT id, body FROM docs) WITH (backend='local', batch_size=64)",
            )
            .unwrap()
        {
            Rewritten::Directive(Directive::Embed {
                table,
                column,
                subquery,
                options,
            }) => {
                assert_eq!(table, "docs");
                assert_eq!(column, "body");
                assert_eq!(subquery, "SELECT id, body FROM docs");
                assert_eq!(options.get("backend").map(String::as_str), Some("local"));
                assert_eq!(options.get("batch_size").map(String::as_str), Some("64"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_rvbbit_verb_errors() {
        let rewriter = SqlRewriter::new();
        assert!(rewriter.rewrite("RVBBIT EXPLODE 'x'").is_err());
    }
}
