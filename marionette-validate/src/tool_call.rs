//! Shape, type, and bounds validation of tool calls.

use std::collections::{HashMap, HashSet};

use marionette_types::{ParamType, ToolCall, ToolDefinition, ToolResult, WindowBounds};

/// Parameters holding coordinates, bounds-checked against the window.
const COORDINATE_PARAMS: [&str; 6] = ["x", "y", "start_x", "start_y", "end_x", "end_y"];

/// Parameters that must be strictly positive.
const POSITIVE_PARAMS: [&str; 4] = ["width", "height", "delay", "timeout"];

/// Longest accepted string argument.
const MAX_STRING_LENGTH: usize = 10_000;

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// The offending field.
    pub field: String,
    /// What was wrong.
    pub message: String,
    /// The offending value, rendered.
    pub value: Option<String>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}: {} (got: {})", self.field, self.message, value),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

/// Outcome of validating one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    /// Whether the call may execute.
    pub valid: bool,
    /// Field-level failures.
    pub errors: Vec<ValidationError>,
    /// Non-blocking notes (e.g. sensitive-tool warnings).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// A passing result.
    #[must_use]
    pub fn success() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// A failing result.
    #[must_use]
    pub fn failure(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: false,
            errors,
            warnings: Vec::new(),
        }
    }

    /// Convert to a tool result the model can learn from.
    #[must_use]
    pub fn to_tool_result(&self) -> ToolResult {
        if self.valid {
            return ToolResult::success("Validation passed");
        }
        let joined = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        ToolResult::failure(format!("Validation failed: {joined}"))
    }
}

/// Validates model-issued tool calls against registered definitions.
pub struct ToolCallValidator {
    registered_tools: HashMap<String, ToolDefinition>,
    sensitive_tools: HashSet<String>,
}

impl ToolCallValidator {
    /// Create a validator over the given registry.
    #[must_use]
    pub fn new(
        registered_tools: HashMap<String, ToolDefinition>,
        sensitive_tools: HashSet<String>,
    ) -> Self {
        Self {
            registered_tools,
            sensitive_tools,
        }
    }

    /// Validate one call. Unknown tools fail fast; everything else is
    /// accumulated so the model sees every problem at once.
    #[must_use]
    pub fn validate(&self, call: &ToolCall, window_bounds: Option<&WindowBounds>) -> ValidationResult {
        let Some(definition) = self.registered_tools.get(&call.name) else {
            return ValidationResult::failure(vec![ValidationError {
                field: "name".into(),
                message: format!("Tool '{}' does not exist", call.name),
                value: Some(call.name.clone()),
            }]);
        };

        let mut errors = Vec::new();
        let empty = serde_json::Map::new();
        let arguments = call.arguments.as_object().unwrap_or(&empty);

        // Required parameters.
        let missing: Vec<&str> = definition
            .parameters
            .iter()
            .filter(|p| p.required && !arguments.contains_key(&p.name))
            .map(|p| p.name.as_str())
            .collect();
        if !missing.is_empty() {
            errors.push(ValidationError {
                field: "arguments".into(),
                message: format!("Missing required parameters: {missing:?}"),
                value: Some(format!("{:?}", arguments.keys().collect::<Vec<_>>())),
            });
        }

        // Declared types and positivity.
        let declared: HashMap<&str, ParamType> = definition
            .parameters
            .iter()
            .map(|p| (p.name.as_str(), p.param_type))
            .collect();
        for (name, value) in arguments {
            if let Some(expected) = declared.get(name.as_str()) {
                if let Some(error) = check_type(name, value, *expected) {
                    errors.push(error);
                }
            }
            if POSITIVE_PARAMS.contains(&name.as_str()) {
                if let Some(number) = value.as_f64() {
                    if number <= 0.0 {
                        errors.push(ValidationError {
                            field: name.clone(),
                            message: "Must be positive".into(),
                            value: Some(value.to_string()),
                        });
                    }
                }
            }
        }

        // Coordinate bounds.
        if let Some(bounds) = window_bounds {
            errors.extend(check_coordinates(arguments, bounds));
        }

        // String length.
        for (name, value) in arguments {
            if let Some(text) = value.as_str() {
                if text.len() > MAX_STRING_LENGTH {
                    errors.push(ValidationError {
                        field: name.clone(),
                        message: format!("String too long (max {MAX_STRING_LENGTH})"),
                        value: Some(format!("length={}", text.len())),
                    });
                }
            }
        }

        if !errors.is_empty() {
            return ValidationResult::failure(errors);
        }

        let mut result = ValidationResult::success();
        if self.sensitive_tools.contains(&call.name) {
            result
                .warnings
                .push(format!("Tool '{}' is a sensitive operation", call.name));
        }
        result
    }

    /// Whether a tool requires user confirmation.
    #[must_use]
    pub fn is_sensitive(&self, tool_name: &str) -> bool {
        self.sensitive_tools.contains(tool_name)
    }

    /// Names of every registered tool.
    #[must_use]
    pub fn available_tools(&self) -> Vec<&str> {
        self.registered_tools.keys().map(String::as_str).collect()
    }
}

/// Check a runtime value against its declared type. Booleans are never
/// integers, and integers satisfy `number`.
fn check_type(name: &str, value: &serde_json::Value, expected: ParamType) -> Option<ValidationError> {
    let matches = match expected {
        ParamType::String => value.is_string(),
        ParamType::Integer => value.is_i64() || value.is_u64(),
        ParamType::Number => value.is_number(),
        ParamType::Boolean => value.is_boolean(),
        ParamType::Array => value.is_array(),
        ParamType::Object => value.is_object(),
    };
    if matches {
        None
    } else {
        Some(ValidationError {
            field: name.to_string(),
            message: format!("Expected type '{}'", expected.as_str()),
            value: Some(value.to_string()),
        })
    }
}

/// Bounds-check every coordinate argument present.
fn check_coordinates(
    arguments: &serde_json::Map<String, serde_json::Value>,
    bounds: &WindowBounds,
) -> Vec<ValidationError> {
    let min_x = bounds.x as f64;
    let min_y = bounds.y as f64;
    let max_x = min_x + bounds.width as f64;
    let max_y = min_y + bounds.height as f64;

    let mut errors = Vec::new();
    for name in COORDINATE_PARAMS {
        let Some(value) = arguments.get(name) else {
            continue;
        };
        let Some(number) = value.as_f64() else {
            continue;
        };
        if name.contains('x') && (number < min_x || number > max_x) {
            errors.push(ValidationError {
                field: name.to_string(),
                message: format!("X coordinate out of bounds [{min_x}, {max_x}]"),
                value: Some(value.to_string()),
            });
        }
        if name.contains('y') && (number < min_y || number > max_y) {
            errors.push(ValidationError {
                field: name.to_string(),
                message: format!("Y coordinate out of bounds [{min_y}, {max_y}]"),
                value: Some(value.to_string()),
            });
        }
    }
    errors
}
