//! Arithmetic over numbers passed as strings

use serde_json::{Map, Value};

use crate::catalog::{Behavior, InputParameter, ToolSpec, Toolkit, ValueSchema, ValueType};
use crate::error::ToolError;
use crate::executor::{from_fn, ToolContext};

pub const TOOLKIT_NAME: &str = "Math";

type BinaryOp = fn(f64, f64) -> Result<f64, ToolError>;

fn add(a: f64, b: f64) -> Result<f64, ToolError> {
    Ok(a + b)
}

fn subtract(a: f64, b: f64) -> Result<f64, ToolError> {
    Ok(a - b)
}

fn multiply(a: f64, b: f64) -> Result<f64, ToolError> {
    Ok(a * b)
}

fn divide(a: f64, b: f64) -> Result<f64, ToolError> {
    if b == 0.0 {
        return Err(ToolError::execution("Cannot divide by zero"));
    }
    Ok(a / b)
}

fn modulus(a: f64, b: f64) -> Result<f64, ToolError> {
    if b == 0.0 {
        return Err(ToolError::execution("Cannot take the modulus by zero"));
    }
    Ok(a % b)
}

pub fn toolkit() -> Toolkit {
    let binary: [(&str, &str, &str, BinaryOp); 5] = [
        ("Add", "Add two numbers together", "The sum of the two numbers as a string", add),
        (
            "Subtract",
            "Subtract two numbers",
            "The difference of the two numbers as a string",
            subtract,
        ),
        (
            "Multiply",
            "Multiply two numbers together",
            "The product of the two numbers as a string",
            multiply,
        ),
        ("Divide", "Divide two numbers", "The quotient of the two numbers as a string", divide),
        (
            "Mod",
            "Calculate the remainder (modulus) of one number divided by another",
            "The remainder after dividing a by b as a string",
            modulus,
        ),
    ];

    let mut kit =
        Toolkit::new(TOOLKIT_NAME, env!("CARGO_PKG_VERSION")).description("Arithmetic tools");

    for (name, description, output, op) in binary {
        let handler = from_fn(move |_: &ToolContext, args: &Map<String, Value>| {
            let a = number_arg(args, "a")?;
            let b = number_arg(args, "b")?;
            Ok(Value::String(format_number(op(a, b)?)?))
        });
        kit = kit.tool(
            ToolSpec::new(name, description, handler)
                .param(string_param("a", "The first number as a string"))
                .param(string_param("b", "The second number as a string"))
                .output(output, ValueSchema::of(ValueType::String))
                .behavior(Behavior::pure()),
        );
    }

    let sqrt = from_fn(|_: &ToolContext, args: &Map<String, Value>| {
        let a = number_arg(args, "a")?;
        if a < 0.0 {
            return Err(ToolError::execution("Cannot take the square root of a negative number"));
        }
        Ok(Value::String(format_number(a.sqrt())?))
    });

    let sum_list = from_fn(|_: &ToolContext, args: &Map<String, Value>| {
        let items = args
            .get("numbers")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::input("'numbers' must be a list of strings"))?;
        let mut total = 0.0;
        for item in items {
            let s = item.as_str().unwrap_or_default();
            total += parse_number(s)?;
        }
        Ok(Value::String(format_number(total)?))
    });

    kit.tool(
        ToolSpec::new("Sqrt", "Get the square root of a number", sqrt)
            .param(string_param("a", "The number to square root as a string"))
            .output(
                "The square root of the number as a string",
                ValueSchema::of(ValueType::String),
            )
            .behavior(Behavior::pure()),
    )
    .tool(
        ToolSpec::new("SumList", "Sum all numbers in a list", sum_list)
            .param(InputParameter::required(
                "numbers",
                ValueSchema::array_of(ValueType::String),
                "The list of numbers as strings",
            ))
            .output(
                "The sum of the numbers in the list as a string",
                ValueSchema::of(ValueType::String),
            )
            .behavior(Behavior::pure()),
    )
}

fn string_param(name: &str, description: &str) -> InputParameter {
    InputParameter::required(name, ValueSchema::of(ValueType::String), description)
}

fn number_arg(args: &Map<String, Value>, key: &str) -> Result<f64, ToolError> {
    let raw = args
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::input(format!("'{}' must be a number as a string", key)))?;
    parse_number(raw)
}

fn parse_number(raw: &str) -> Result<f64, ToolError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ToolError::input(format!("'{}' is not a valid number", raw)))
}

/// Integral values print without a fractional part.
fn format_number(value: f64) -> Result<String, ToolError> {
    if !value.is_finite() {
        return Err(ToolError::execution("Result is not a finite number"));
    }
    if value.fract() == 0.0 && value.abs() < 1e15 {
        Ok(format!("{}", value as i64))
    } else {
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ToolCatalog;
    use crate::error::ErrorCode;
    use crate::executor::ToolExecutor;
    use serde_json::json;

    fn catalog() -> ToolCatalog {
        ToolCatalog::builder().add_toolkit(toolkit()).unwrap().build()
    }

    async fn call(name: &str, args: Value) -> crate::executor::ToolCallOutput {
        let catalog = catalog();
        let tool = catalog.get_tool_by_name(name).unwrap();
        ToolExecutor::new()
            .run(tool, ToolContext::default(), args.as_object().cloned().unwrap())
            .await
    }

    #[test]
    fn test_toolkit_contents() {
        let catalog = catalog();
        let names: Vec<String> = catalog
            .iter()
            .map(|t| t.definition.fully_qualified_name.clone())
            .collect();
        assert_eq!(
            names,
            vec![
                "Math.Add",
                "Math.Divide",
                "Math.Mod",
                "Math.Multiply",
                "Math.Sqrt",
                "Math.Subtract",
                "Math.SumList"
            ]
        );
    }

    #[tokio::test]
    async fn test_arithmetic() {
        assert_eq!(call("Math.Add", json!({"a": "2", "b": "3"})).await.value, Some(json!("5")));
        assert_eq!(
            call("Math_Subtract", json!({"a": "2", "b": "3"})).await.value,
            Some(json!("-1"))
        );
        assert_eq!(
            call("Math.Multiply", json!({"a": "1.5", "b": "4"})).await.value,
            Some(json!("6"))
        );
        assert_eq!(
            call("Math.Divide", json!({"a": "7", "b": "2"})).await.value,
            Some(json!("3.5"))
        );
        assert_eq!(call("Math.Mod", json!({"a": "7", "b": "4"})).await.value, Some(json!("3")));
        assert_eq!(call("Math.Sqrt", json!({"a": "16"})).await.value, Some(json!("4")));
        assert_eq!(
            call("Math.SumList", json!({"numbers": ["1", "2", "3.5"]})).await.value,
            Some(json!("6.5"))
        );
    }

    #[tokio::test]
    async fn test_divide_by_zero_is_execution_error() {
        let out = call("Math.Divide", json!({"a": "1", "b": "0"})).await;
        let err = out.error.unwrap();
        assert_eq!(err.code, ErrorCode::Fatal);
        assert!(err.message.contains("ToolExecutionError"));
        assert!(err.message.ends_with("Cannot divide by zero"));
    }

    #[tokio::test]
    async fn test_bad_number_is_input_error() {
        let out = call("Math.Add", json!({"a": "two", "b": "3"})).await;
        assert_eq!(out.error.unwrap().code, ErrorCode::BadInputValue);

        let out = call("Math.Sqrt", json!({"a": "-4"})).await;
        assert!(out.error.unwrap().message.contains("negative"));
    }
}
