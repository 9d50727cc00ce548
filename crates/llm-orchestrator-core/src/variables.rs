// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Variable resolver: substitutes literal `${path.to.value}` references in
//! strings and maps against a context snapshot. `spec.md` §4.1.

use serde_json::Value;

use crate::context::ExecutionContext;

/// Stateless, thread-safe resolver. A single shared instance may serve all
/// executors; it holds no state of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariableResolver;

impl VariableResolver {
    pub fn new() -> Self {
        Self
    }

    /// `true` if `s` contains at least one `${` marker.
    pub fn has_variables(&self, s: &str) -> bool {
        s.contains("${")
    }

    /// Extracts the dotted paths referenced by `${...}` occurrences, in
    /// left-to-right order, including duplicates.
    pub fn extract_variables(&self, s: &str) -> Vec<String> {
        find_occurrences(s).into_iter().map(|(_, _, path)| path).collect()
    }

    /// Substitutes every resolvable `${path}` occurrence in `s`. Occurrences
    /// whose path cannot be resolved are left in the output verbatim.
    pub fn resolve_string(&self, s: &str, ctx: &ExecutionContext) -> String {
        if !self.has_variables(s) {
            return s.to_string();
        }
        let eval_ctx = ctx.to_evaluation_context();
        self.resolve_string_against(s, &eval_ctx)
    }

    /// Same as [`Self::resolve_string`] but against an already-materialized
    /// evaluation context, so callers that need multiple resolutions (e.g.
    /// the HTTP pipeline resolving url/headers/params/body) pay the
    /// `to_evaluation_context` cost only once.
    pub fn resolve_string_against(&self, s: &str, eval_ctx: &Value) -> String {
        if !self.has_variables(s) {
            return s.to_string();
        }

        let occurrences = find_occurrences(s);
        if occurrences.is_empty() {
            return s.to_string();
        }

        let mut out = String::with_capacity(s.len());
        let mut cursor = 0;
        for (start, end, path) in occurrences {
            out.push_str(&s[cursor..start]);
            match resolve_path(eval_ctx, &path) {
                Some(value) => out.push_str(&stringify(&value)),
                None => out.push_str(&s[start..end]),
            }
            cursor = end;
        }
        out.push_str(&s[cursor..]);
        out
    }

    /// Recursively resolves every string value in a JSON object/array,
    /// leaving non-string scalars untouched.
    pub fn resolve_value(&self, value: &Value, ctx: &ExecutionContext) -> Value {
        let eval_ctx = ctx.to_evaluation_context();
        self.resolve_value_against(value, &eval_ctx)
    }

    fn resolve_value_against(&self, value: &Value, eval_ctx: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve_string_against(s, eval_ctx)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve_value_against(v, eval_ctx))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value_against(v, eval_ctx)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Substitutes variables in every string value of a map, per `spec.md`
    /// §4.1's `ResolveMap`.
    pub fn resolve_map(
        &self,
        map: &std::collections::HashMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> std::collections::HashMap<String, Value> {
        let eval_ctx = ctx.to_evaluation_context();
        map.iter()
            .map(|(k, v)| (k.clone(), self.resolve_value_against(v, &eval_ctx)))
            .collect()
    }
}

/// Finds non-overlapping `${...}` occurrences, returning
/// `(byte_start, byte_end, inner_path)` triples in left-to-right order.
fn find_occurrences(s: &str) -> Vec<(usize, usize, String)> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'{' {
            if let Some(rel_close) = s[i + 2..].find('}') {
                let close = i + 2 + rel_close;
                let path = s[i + 2..close].trim().to_string();
                out.push((i, close + 1, path));
                i = close + 1;
                continue;
            }
        }
        i += 1;
    }
    out
}

/// Walks a dotted path against a JSON value, resolving the head as a
/// top-level key and each remaining segment as a key into a mapping value.
fn resolve_path(root: &Value, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let head = segments.next()?;
    let mut current = root.as_object()?.get(head)?.clone();
    for segment in segments {
        current = current.as_object()?.get(segment)?.clone();
    }
    Some(current)
}

/// Stringifies a resolved value using the language's default "print" form.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
