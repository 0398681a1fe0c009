//! Local tools the model may call during a generation turn.

use crate::error::ToolError;
use crate::generation::{ToolCall, ToolSchema};
use chrono::{Duration, Local, NaiveDate};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;

pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    fn execute(&self, arguments: &Value) -> Result<String, ToolError>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Calculator, date calculator and text analyzer.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Calculator));
        registry.register(Arc::new(DateCalculator));
        registry.register(Arc::new(TextAnalyzer));
        registry
    }

    /// Adds a tool, replacing any tool registered under the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|existing| existing.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|tool| tool.schema()).collect()
    }

    pub fn invoke(&self, call: &ToolCall) -> Result<String, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|tool| tool.name() == call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;
        tool.execute(&call.arguments)
    }
}

fn string_arg<'a>(arguments: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    match arguments.get(name) {
        Some(Value::String(value)) => Ok(value),
        Some(other) => Err(ToolError::InvalidArgument(format!(
            "`{name}` must be a string, got {other}"
        ))),
        None => Err(ToolError::MissingArgument(name.to_string())),
    }
}

fn integer_arg(arguments: &Value, name: &str) -> Result<i64, ToolError> {
    match arguments.get(name) {
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|value| value.fract() == 0.0).map(|value| value as i64))
            .ok_or_else(|| ToolError::InvalidArgument(format!("`{name}` must be an integer"))),
        Some(Value::String(text)) => text
            .trim()
            .parse()
            .map_err(|_| ToolError::InvalidArgument(format!("`{name}` must be an integer"))),
        Some(_) => Err(ToolError::InvalidArgument(format!("`{name}` must be an integer"))),
        None => Err(ToolError::MissingArgument(name.to_string())),
    }
}

fn date_arg(arguments: &Value, name: &str) -> Result<NaiveDate, ToolError> {
    let raw = string_arg(arguments, name)?;
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|error| {
        ToolError::InvalidArgument(format!("`{name}` must be YYYY-MM-DD ({error})"))
    })
}

pub struct Calculator;

impl Tool for Calculator {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Expression using + - * / % ^, parentheses, sqrt sin cos tan log ln abs, pi and e, e.g. '125.7 * 0.23'"
                }
            },
            "required": ["expression"]
        })
    }

    fn execute(&self, arguments: &Value) -> Result<String, ToolError> {
        let expression = string_arg(arguments, "expression")?;
        let value = evaluate(expression)?;
        Ok(format!("Result: {value}"))
    }
}

const MAX_EXPRESSION_CHARS: usize = 1024;
const MAX_NESTING: usize = 64;

/// Evaluates an arithmetic expression. Angles are radians, `log` is base 10.
pub fn evaluate(expression: &str) -> Result<f64, ToolError> {
    if expression.chars().count() > MAX_EXPRESSION_CHARS {
        return Err(ToolError::Evaluation(format!(
            "expression longer than {MAX_EXPRESSION_CHARS} characters"
        )));
    }
    let mut parser = ExpressionParser {
        chars: expression.chars().filter(|c| !c.is_whitespace()).collect(),
        position: 0,
        depth: 0,
    };
    let value = parser.expression()?;
    if let Some(rest) = parser.peek() {
        return Err(ToolError::Evaluation(format!(
            "unexpected `{rest}` at position {}",
            parser.position
        )));
    }
    if !value.is_finite() {
        return Err(ToolError::Evaluation("result is not a finite number".to_string()));
    }
    Ok(value)
}

struct ExpressionParser {
    chars: Vec<char>,
    position: usize,
    depth: usize,
}

impl ExpressionParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expression(&mut self) -> Result<f64, ToolError> {
        let mut value = self.term()?;
        loop {
            if self.eat('+') {
                value += self.term()?;
            } else if self.eat('-') {
                value -= self.term()?;
            } else {
                return Ok(value);
            }
        }
    }

    fn term(&mut self) -> Result<f64, ToolError> {
        let mut value = self.unary()?;
        loop {
            if self.eat('*') {
                value *= self.unary()?;
            } else if self.eat('/') {
                let divisor = self.unary()?;
                if divisor == 0.0 {
                    return Err(ToolError::Evaluation("division by zero".to_string()));
                }
                value /= divisor;
            } else if self.eat('%') {
                let divisor = self.unary()?;
                if divisor == 0.0 {
                    return Err(ToolError::Evaluation("modulo by zero".to_string()));
                }
                value %= divisor;
            } else {
                return Ok(value);
            }
        }
    }

    // Every recursive path passes through here, so this bounds the stack.
    fn unary(&mut self) -> Result<f64, ToolError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ToolError::Evaluation("expression nested too deeply".to_string()));
        }
        let value = self.signed();
        self.depth -= 1;
        value
    }

    fn signed(&mut self) -> Result<f64, ToolError> {
        if self.eat('-') {
            return Ok(-self.unary()?);
        }
        if self.eat('+') {
            return self.unary();
        }
        self.power()
    }

    // Right associative: 2^3^2 == 2^9.
    fn power(&mut self) -> Result<f64, ToolError> {
        let base = self.primary()?;
        if self.eat('^') {
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, ToolError> {
        match self.peek() {
            Some('(') => {
                self.position += 1;
                let value = self.expression()?;
                if !self.eat(')') {
                    return Err(ToolError::Evaluation("missing closing parenthesis".to_string()));
                }
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.identifier(),
            Some(c) => Err(ToolError::Evaluation(format!("unexpected `{c}`"))),
            None => Err(ToolError::Evaluation("unexpected end of expression".to_string())),
        }
    }

    fn number(&mut self) -> Result<f64, ToolError> {
        let start = self.position;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
            self.position += 1;
        }
        let literal = self.chars[start..self.position].iter().collect::<String>();
        literal
            .parse()
            .map_err(|_| ToolError::Evaluation(format!("invalid number `{literal}`")))
    }

    fn identifier(&mut self) -> Result<f64, ToolError> {
        let start = self.position;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphabetic()) {
            self.position += 1;
        }
        let name = self.chars[start..self.position]
            .iter()
            .collect::<String>()
            .to_ascii_lowercase();

        match name.as_str() {
            "pi" => return Ok(std::f64::consts::PI),
            "e" => return Ok(std::f64::consts::E),
            _ => {}
        }

        let function: fn(f64) -> f64 = match name.as_str() {
            "sqrt" => f64::sqrt,
            "sin" => f64::sin,
            "cos" => f64::cos,
            "tan" => f64::tan,
            "log" => f64::log10,
            "ln" => f64::ln,
            "abs" => f64::abs,
            _ => return Err(ToolError::Evaluation(format!("unknown function `{name}`"))),
        };

        if !self.eat('(') {
            return Err(ToolError::Evaluation(format!("`{name}` needs parentheses")));
        }
        let argument = self.expression()?;
        if !self.eat(')') {
            return Err(ToolError::Evaluation("missing closing parenthesis".to_string()));
        }
        let value = function(argument);
        if value.is_nan() {
            return Err(ToolError::Evaluation(format!("{name}({argument}) is undefined")));
        }
        Ok(value)
    }
}

pub struct DateCalculator;

impl Tool for DateCalculator {
    fn name(&self) -> &str {
        "date_calculator"
    }

    fn description(&self) -> &str {
        "Current date or time, days between two dates, or a date plus a number of days"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["current_date", "current_time", "date_diff", "add_days"]
                },
                "date1": { "type": "string", "description": "YYYY-MM-DD, for date_diff and add_days" },
                "date2": { "type": "string", "description": "YYYY-MM-DD, for date_diff" },
                "days": { "type": "integer", "description": "Days to add, for add_days" }
            },
            "required": ["operation"]
        })
    }

    fn execute(&self, arguments: &Value) -> Result<String, ToolError> {
        match string_arg(arguments, "operation")? {
            "current_date" => Ok(format!("Current date: {}", Local::now().date_naive())),
            "current_time" => Ok(format!(
                "Current time: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S")
            )),
            "date_diff" => {
                let first = date_arg(arguments, "date1")?;
                let second = date_arg(arguments, "date2")?;
                Ok(format!(
                    "Date difference: {} days",
                    (second - first).num_days()
                ))
            }
            "add_days" => {
                let start = date_arg(arguments, "date1")?;
                let days = integer_arg(arguments, "days")?;
                let result = Duration::try_days(days)
                    .and_then(|delta| start.checked_add_signed(delta))
                    .ok_or_else(|| ToolError::Evaluation("date out of range".to_string()))?;
                Ok(format!("Result date: {result}"))
            }
            other => Err(ToolError::InvalidArgument(format!(
                "unknown date operation `{other}`"
            ))),
        }
    }
}

pub struct TextAnalyzer;

impl Tool for TextAnalyzer {
    fn name(&self) -> &str {
        "text_analyzer"
    }

    fn description(&self) -> &str {
        "Count words or characters, or extract numbers or email addresses from text"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "analysis_type": {
                    "type": "string",
                    "enum": ["word_count", "char_count", "extract_numbers", "extract_emails"]
                }
            },
            "required": ["text", "analysis_type"]
        })
    }

    fn execute(&self, arguments: &Value) -> Result<String, ToolError> {
        let text = string_arg(arguments, "text")?;
        match string_arg(arguments, "analysis_type")? {
            "word_count" => Ok(format!("Word count: {}", text.split_whitespace().count())),
            "char_count" => Ok(format!("Character count: {}", text.chars().count())),
            "extract_numbers" => {
                let found = find_all(r"\d+(?:\.\d+)?", text)?;
                Ok(format!("Numbers found: {}", found.join(", ")))
            }
            "extract_emails" => {
                let found = find_all(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b", text)?;
                Ok(format!("Emails found: {}", found.join(", ")))
            }
            other => Err(ToolError::InvalidArgument(format!(
                "unknown analysis type `{other}`"
            ))),
        }
    }
}

fn find_all<'a>(pattern: &str, text: &'a str) -> Result<Vec<&'a str>, ToolError> {
    let regex = Regex::new(pattern).map_err(|error| ToolError::Evaluation(error.to_string()))?;
    Ok(regex.find_iter(text).map(|found| found.as_str()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            name: name.to_string(),
            arguments,
        }
    }

    #[test]
    fn arithmetic_follows_precedence() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(evaluate("-2 ^ 2").unwrap(), -4.0);
        assert_eq!(evaluate("10 % 4").unwrap(), 2.0);
        assert_eq!(evaluate("sqrt(16) + abs(-3)").unwrap(), 7.0);
        assert!((evaluate("log(1000)").unwrap() - 3.0).abs() < 1e-12);
        assert!((evaluate("ln(e)").unwrap() - 1.0).abs() < 1e-12);
        assert!(evaluate("sin(pi)").unwrap().abs() < 1e-12);
    }

    #[test]
    fn bad_expressions_are_reported() {
        assert!(matches!(evaluate("1 / 0"), Err(ToolError::Evaluation(_))));
        assert!(matches!(evaluate("2 +"), Err(ToolError::Evaluation(_))));
        assert!(matches!(evaluate("(1 + 2"), Err(ToolError::Evaluation(_))));
        assert!(matches!(evaluate("import(os)"), Err(ToolError::Evaluation(_))));
        assert!(matches!(evaluate("sqrt(-1)"), Err(ToolError::Evaluation(_))));
        assert!(matches!(evaluate("3)"), Err(ToolError::Evaluation(_))));
    }

    #[test]
    fn deep_nesting_is_an_error_not_a_crash() {
        let nested = format!("{}1{}", "(".repeat(30), ")".repeat(30));
        assert_eq!(evaluate(&nested).unwrap(), 1.0);

        let too_deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert!(matches!(
            evaluate(&too_deep),
            Err(ToolError::Evaluation(message)) if message.contains("nested too deeply")
        ));
        assert!(matches!(
            evaluate(&format!("{}1", "-".repeat(200))),
            Err(ToolError::Evaluation(message)) if message.contains("nested too deeply")
        ));
    }

    #[test]
    fn oversized_expressions_are_rejected_before_parsing() {
        let long = format!("{}1", "1+".repeat(600));
        assert!(matches!(
            evaluate(&long),
            Err(ToolError::Evaluation(message)) if message.contains("longer than")
        ));
        assert!(evaluate(&format!("{}1", "-".repeat(200_000))).is_err());
    }

    #[test]
    fn registry_dispatches_by_name() {
        let registry = ToolRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec!["calculator", "date_calculator", "text_analyzer"]
        );
        let output = registry
            .invoke(&call("calculator", json!({ "expression": "125.7 * 2" })))
            .unwrap();
        assert_eq!(output, "Result: 251.4");

        let unknown = registry.invoke(&call("shell", json!({})));
        assert!(matches!(unknown, Err(ToolError::UnknownTool(_))));
    }

    #[test]
    fn missing_arguments_are_typed_errors() {
        let registry = ToolRegistry::builtin();
        let result = registry.invoke(&call("calculator", json!({})));
        assert!(matches!(result, Err(ToolError::MissingArgument(name)) if name == "expression"));
    }

    #[test]
    fn date_operations() {
        let tool = DateCalculator;
        let diff = tool
            .execute(&json!({ "operation": "date_diff", "date1": "2024-01-01", "date2": "2024-03-01" }))
            .unwrap();
        assert_eq!(diff, "Date difference: 60 days");

        let added = tool
            .execute(&json!({ "operation": "add_days", "date1": "2024-02-27", "days": 3 }))
            .unwrap();
        assert_eq!(added, "Result date: 2024-03-01");

        let bad = tool.execute(&json!({ "operation": "date_diff", "date1": "01/02/2024", "date2": "2024-01-01" }));
        assert!(matches!(bad, Err(ToolError::InvalidArgument(_))));

        assert!(tool
            .execute(&json!({ "operation": "current_date" }))
            .unwrap()
            .starts_with("Current date: "));
    }

    #[test]
    fn text_analysis() {
        let tool = TextAnalyzer;
        let text = "Revenue grew 23% to $125.7 million. Contact ir@example.com or cfo@example.org.";
        assert_eq!(
            tool.execute(&json!({ "text": "one two  three", "analysis_type": "word_count" }))
                .unwrap(),
            "Word count: 3"
        );
        assert_eq!(
            tool.execute(&json!({ "text": text, "analysis_type": "extract_numbers" }))
                .unwrap(),
            "Numbers found: 23, 125.7"
        );
        assert_eq!(
            tool.execute(&json!({ "text": text, "analysis_type": "extract_emails" }))
                .unwrap(),
            "Emails found: ir@example.com, cfo@example.org"
        );
    }

    #[test]
    fn schemas_describe_every_tool() {
        let schemas = ToolRegistry::builtin().schemas();
        assert_eq!(schemas.len(), 3);
        assert!(schemas
            .iter()
            .all(|schema| schema.parameters["type"] == "object"));
    }
}
