//! Safe expression evaluator for conditional workflow nodes.
//!
//! Wraps `evalexpr`: builds a `HashMapContext`, binds variables via
//! `ContextWithMutableVariables`, and calls `eval_with_context`, restricted
//! to the conditional-node whitelist: arithmetic, power with a bounded
//! exponent, comparisons, boolean logic, parentheses, literals, and the
//! functions `abs`, `min`, `max`, `len`, `str`. `evalexpr` has no attribute
//! access, subscripting, function definition, imports, or assignment to
//! begin with, so the remaining work is the two numeric resource caps the
//! grammar doesn't enforce on its own, plus mapping the whitelisted function
//! names onto `evalexpr`'s actual builtins.

use evalexpr::{eval_with_context, ContextWithMutableVariables, HashMapContext, Value as EvalValue};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::zerg::error::ZergError;

const MAX_EXPRESSION_LEN: usize = 500;
const MAX_STRING_OPERAND_LEN: usize = 1000;

/// Result of evaluating a conditional expression, before node-boundary
/// boolean coercion is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluatedValue {
    Number(f64),
    Boolean(bool),
    Str(String),
    Null,
}

impl EvaluatedValue {
    /// Boolean coercion applied only at the node boundary (branch selection),
    /// never inside the expression itself.
    pub fn as_branch_bool(&self) -> bool {
        match self {
            EvaluatedValue::Boolean(b) => *b,
            EvaluatedValue::Number(n) => *n != 0.0,
            EvaluatedValue::Str(s) => !s.is_empty(),
            EvaluatedValue::Null => false,
        }
    }
}

/// Evaluate `expression` against a pre-resolved symbol table. Variable
/// resolution (the `${N}` grammar) happens before this is called; by the
/// time an expression reaches here every identifier is a plain scalar.
pub fn evaluate(expression: &str, variables: &HashMap<String, JsonValue>) -> Result<EvaluatedValue, ZergError> {
    if expression.len() > MAX_EXPRESSION_LEN {
        return Err(ZergError::validation(format!(
            "expression exceeds {MAX_EXPRESSION_LEN} characters"
        )));
    }
    for value in variables.values() {
        if let JsonValue::String(s) = value {
            if s.len() > MAX_STRING_OPERAND_LEN {
                return Err(ZergError::validation(format!(
                    "string operand exceeds {MAX_STRING_OPERAND_LEN} characters"
                )));
            }
        }
    }
    reject_oversized_exponent(expression)?;

    let mut context = HashMapContext::new();
    for (key, value) in variables {
        context
            .set_value(key.clone(), json_to_eval(value))
            .map_err(|e| ZergError::internal(e.to_string()))?;
    }

    let normalized = normalize_whitelisted_functions(expression);
    let result = eval_with_context(&normalized, &context)
        .map_err(|e| ZergError::validation(format!("expression error: {e}")))?;
    eval_to_evaluated(result)
}

/// `evalexpr` exposes `abs`/`min`/`max`/`len` as builtins already and formats
/// values to strings via `str::from`; the only rewrite needed is the
/// whitelist's bare `str(...)` spelling onto that builtin.
fn normalize_whitelisted_functions(expression: &str) -> String {
    expression.replace("str(", "str::from(")
}

fn reject_oversized_exponent(expression: &str) -> Result<(), ZergError> {
    let mut search_from = 0;
    while let Some(offset) = expression[search_from..].find("**") {
        let pos = search_from + offset;
        let after = &expression[pos + 2..];
        let exponent: String = after.chars().skip_while(|c| c.is_whitespace()).take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(n) = exponent.parse::<u32>() {
            if n > 100 {
                return Err(ZergError::validation("exponent exceeds the maximum of 100"));
            }
        }
        search_from = pos + 2;
    }
    Ok(())
}

fn json_to_eval(value: &JsonValue) -> EvalValue {
    match value {
        JsonValue::Null => EvalValue::Empty,
        JsonValue::Bool(b) => EvalValue::Boolean(*b),
        JsonValue::Number(n) => EvalValue::Float(n.as_f64().unwrap_or(0.0)),
        JsonValue::String(s) => EvalValue::String(s.clone()),
        other => EvalValue::String(other.to_string()),
    }
}

fn eval_to_evaluated(value: EvalValue) -> Result<EvaluatedValue, ZergError> {
    Ok(match value {
        EvalValue::Boolean(b) => EvaluatedValue::Boolean(b),
        EvalValue::Int(i) => EvaluatedValue::Number(i as f64),
        EvalValue::Float(f) => EvaluatedValue::Number(f),
        EvalValue::String(s) => EvaluatedValue::Str(s),
        EvalValue::Empty => EvaluatedValue::Null,
        other => return Err(ZergError::validation(format!("unsupported expression result: {other:?}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, JsonValue)]) -> HashMap<String, JsonValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn arithmetic_and_comparison_evaluate() {
        let result = evaluate("a + b > 10", &vars(&[("a", JsonValue::from(7)), ("b", JsonValue::from(5))])).unwrap();
        assert_eq!(result, EvaluatedValue::Boolean(true));
    }

    #[test]
    fn whitelisted_len_function_is_available() {
        let result = evaluate("len(name) == 5", &vars(&[("name", JsonValue::from("alice"))])).unwrap();
        assert_eq!(result, EvaluatedValue::Boolean(true));
    }

    #[test]
    fn expression_over_length_cap_is_rejected() {
        let long = "1".repeat(600);
        assert!(evaluate(&long, &HashMap::new()).is_err());
    }

    #[test]
    fn exponent_over_cap_is_rejected() {
        assert!(evaluate("2 ** 200", &HashMap::new()).is_err());
    }

    #[test]
    fn boolean_coercion_only_happens_at_branch_boundary() {
        let result = evaluate("5", &HashMap::new()).unwrap();
        assert_eq!(result, EvaluatedValue::Number(5.0));
        assert!(result.as_branch_bool());
        assert!(!EvaluatedValue::Number(0.0).as_branch_bool());
    }
}
