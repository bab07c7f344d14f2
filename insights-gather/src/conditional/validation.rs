// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./validation_test.rs"]
mod validation_test;

use super::functions::Registry;
use super::rules::RawConfiguration;
use itertools::Itertools;
use regex::Regex;
use serde_json::{Map, Value};
use std::fmt::Display;

pub const NAMESPACE_PATTERN: &str = "^openshift-[A-Za-z0-9_.-]{1,128}$";
pub const ALERT_NAME_PATTERN: &str = "^[A-Za-z0-9]{1,128}$";
pub const CONTAINER_NAME_PATTERN: &str = "^[A-Za-z0-9_.-]{1,128}$";
pub const POD_NAME_PATTERN: &str = "^[A-Za-z0-9_.-]{1,253}$";

const MAX_RULES: usize = 64;
const MAX_CONDITIONS: usize = 8;
const CONDITION_TYPES: &[&str] = &["alert_is_firing", "cluster_version_matches"];

const ALERT_IS_FIRING_PARAMS: &[FieldSchema] = &[FieldSchema::required(
  "name",
  FieldKind::string(ALERT_NAME_PATTERN),
)];

const CLUSTER_VERSION_MATCHES_PARAMS: &[FieldSchema] = &[FieldSchema::required(
  "version",
  FieldKind::String {
    pattern: None,
    min_length: 1,
    max_length: 64,
  },
)];

const CONTAINER_LOGS_REQUEST: &[FieldSchema] = &[
  FieldSchema::required("namespace", FieldKind::string(NAMESPACE_PATTERN)),
  FieldSchema::required(
    "pod_name_regex",
    FieldKind::String {
      pattern: None,
      min_length: 1,
      max_length: 1024,
    },
  ),
  FieldSchema::required(
    "messages",
    FieldKind::StringArray {
      pattern: None,
      min_items: 1,
      max_items: 64,
    },
  ),
  FieldSchema::optional("previous", FieldKind::Boolean),
];

//
// FieldKind
//

/// The accepted shape of a single params field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
  String {
    pattern: Option<&'static str>,
    min_length: usize,
    max_length: usize,
  },
  Integer {
    minimum: i64,
    maximum: i64,
  },
  Boolean,
  StringArray {
    pattern: Option<&'static str>,
    min_items: usize,
    max_items: usize,
  },
}

impl FieldKind {
  /// A string whose length is bounded by the pattern alone.
  #[must_use]
  pub const fn string(pattern: &'static str) -> Self {
    Self::String {
      pattern: Some(pattern),
      min_length: 0,
      max_length: usize::MAX,
    }
  }

  #[must_use]
  pub const fn integer(minimum: i64, maximum: i64) -> Self {
    Self::Integer { minimum, maximum }
  }
}

//
// FieldSchema
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSchema {
  pub name: &'static str,
  pub kind: FieldKind,
  pub required: bool,
}

impl FieldSchema {
  #[must_use]
  pub const fn required(name: &'static str, kind: FieldKind) -> Self {
    Self {
      name,
      kind,
      required: true,
    }
  }

  #[must_use]
  pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
    Self {
      name,
      kind,
      required: false,
    }
  }
}

//
// ValidationError
//

/// A single offending field. The path is dotted from the rule index, empty for the document root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
  pub path: String,
  pub message: String,
}

impl ValidationError {
  fn new(path: &str, message: impl Into<String>) -> Self {
    Self {
      path: path.to_string(),
      message: message.into(),
    }
  }
}

impl Display for ValidationError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.path.is_empty() {
      write!(f, "(root): {}", self.message)
    } else {
      write!(f, "{}: {}", self.path, self.message)
    }
  }
}

//
// ValidationErrors
//

/// Every validation failure of a configuration, reported as one error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("conditional gathering rules are invalid: {}", .0.iter().join("; "))]
pub struct ValidationErrors(pub Vec<ValidationError>);

fn join_path(path: &str, element: impl Display) -> String {
  if path.is_empty() {
    element.to_string()
  } else {
    format!("{path}.{element}")
  }
}

fn type_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "boolean",
    Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

fn invalid_type(path: &str, expected: &str, given: &Value) -> ValidationError {
  ValidationError::new(
    path,
    format!(
      "Invalid type. Expected: {expected}, given: {}",
      type_name(given)
    ),
  )
}

fn check_pattern(path: &str, pattern: &str, value: &str, errors: &mut Vec<ValidationError>) {
  match Regex::new(pattern) {
    Ok(regex) if regex.is_match(value) => {},
    Ok(_) => errors.push(ValidationError::new(
      path,
      format!("Does not match pattern '{pattern}'"),
    )),
    Err(e) => errors.push(ValidationError::new(
      path,
      format!("invalid pattern '{pattern}': {e}"),
    )),
  }
}

fn check_unique(path: &str, items: &[Value], errors: &mut Vec<ValidationError>) {
  for (i, j) in (0 .. items.len()).tuple_combinations() {
    if items[i] == items[j] {
      errors.push(ValidationError::new(
        path,
        format!("array items[{i},{j}] must be unique"),
      ));
    }
  }
}

fn validate_field(path: &str, kind: FieldKind, value: &Value, errors: &mut Vec<ValidationError>) {
  match kind {
    FieldKind::String {
      pattern,
      min_length,
      max_length,
    } => {
      let Some(s) = value.as_str() else {
        errors.push(invalid_type(path, "string", value));
        return;
      };
      let length = s.chars().count();
      if length < min_length {
        errors.push(ValidationError::new(
          path,
          format!("String length must be greater than or equal to {min_length}"),
        ));
      }
      if length > max_length {
        errors.push(ValidationError::new(
          path,
          format!("String length must be less than or equal to {max_length}"),
        ));
      }
      if let Some(pattern) = pattern {
        check_pattern(path, pattern, s, errors);
      }
    },
    FieldKind::Integer { minimum, maximum } => {
      let Some(n) = value.as_i64() else {
        errors.push(invalid_type(path, "integer", value));
        return;
      };
      if n < minimum {
        errors.push(ValidationError::new(
          path,
          format!("Must be greater than or equal to {minimum}"),
        ));
      }
      if n > maximum {
        errors.push(ValidationError::new(
          path,
          format!("Must be less than or equal to {maximum}"),
        ));
      }
    },
    FieldKind::Boolean => {
      if !value.is_boolean() {
        errors.push(invalid_type(path, "boolean", value));
      }
    },
    FieldKind::StringArray {
      pattern,
      min_items,
      max_items,
    } => {
      let Some(items) = value.as_array() else {
        errors.push(invalid_type(path, "array", value));
        return;
      };
      if items.len() < min_items {
        errors.push(ValidationError::new(
          path,
          format!("Array must have at least {min_items} items"),
        ));
      }
      if items.len() > max_items {
        errors.push(ValidationError::new(
          path,
          format!("Array must have at most {max_items} items"),
        ));
      }
      check_unique(path, items, errors);
      for (i, item) in items.iter().enumerate() {
        let item_path = join_path(path, i);
        match item.as_str() {
          Some(s) => {
            if let Some(pattern) = pattern {
              check_pattern(&item_path, pattern, s, errors);
            }
          },
          None => errors.push(invalid_type(&item_path, "string", item)),
        }
      }
    },
  }
}

/// Validates a params object against its field schemas. Unknown fields are rejected.
pub fn validate_object(
  path: &str,
  value: &Value,
  fields: &[FieldSchema],
  errors: &mut Vec<ValidationError>,
) {
  let Some(object) = value.as_object() else {
    errors.push(invalid_type(path, "object", value));
    return;
  };

  for field in fields {
    match object.get(field.name) {
      Some(value) => validate_field(&join_path(path, field.name), field.kind, value, errors),
      None if field.required => {
        errors.push(ValidationError::new(
          path,
          format!("{} is required", field.name),
        ));
      },
      None => {},
    }
  }

  for key in object.keys() {
    if !fields.iter().any(|field| field.name == key) {
      errors.push(ValidationError::new(
        path,
        format!("Additional property {key} is not allowed"),
      ));
    }
  }
}

fn check_additional_properties(
  path: &str,
  object: &Map<String, Value>,
  allowed: &[&str],
  errors: &mut Vec<ValidationError>,
) {
  for key in object.keys() {
    if !allowed.contains(&key.as_str()) {
      errors.push(ValidationError::new(
        path,
        format!("Additional property {key} is not allowed"),
      ));
    }
  }
}

fn validate_condition(path: &str, condition: &Value, errors: &mut Vec<ValidationError>) {
  let Some(object) = condition.as_object() else {
    errors.push(invalid_type(path, "object", condition));
    return;
  };
  check_additional_properties(path, object, &["type", "params"], errors);

  let Some(condition_type) = object.get("type") else {
    errors.push(ValidationError::new(path, "type is required"));
    return;
  };
  let type_path = join_path(path, "type");
  let params_schema = match condition_type.as_str() {
    Some("alert_is_firing") => ALERT_IS_FIRING_PARAMS,
    Some("cluster_version_matches") => CLUSTER_VERSION_MATCHES_PARAMS,
    Some(_) => {
      errors.push(ValidationError::new(
        &type_path,
        format!(
          "{type_path} must be one of the following: {}",
          CONDITION_TYPES.iter().map(|t| format!("\"{t}\"")).join(", ")
        ),
      ));
      return;
    },
    None => {
      errors.push(invalid_type(&type_path, "string", condition_type));
      return;
    },
  };

  match object.get("params") {
    Some(params) => validate_object(&join_path(path, "params"), params, params_schema, errors),
    None => errors.push(ValidationError::new(path, "params is required")),
  }
}

fn validate_rule(
  path: &str,
  rule: &Value,
  registry: &Registry,
  errors: &mut Vec<ValidationError>,
) {
  let Some(object) = rule.as_object() else {
    errors.push(invalid_type(path, "object", rule));
    return;
  };
  check_additional_properties(path, object, &["conditions", "gathering_functions"], errors);

  if let Some(conditions) = object.get("conditions") {
    let conditions_path = join_path(path, "conditions");
    match conditions.as_array() {
      Some(conditions) => {
        if conditions.len() > MAX_CONDITIONS {
          errors.push(ValidationError::new(
            &conditions_path,
            format!("Array must have at most {MAX_CONDITIONS} items"),
          ));
        }
        check_unique(&conditions_path, conditions, errors);
        for (i, condition) in conditions.iter().enumerate() {
          validate_condition(&join_path(&conditions_path, i), condition, errors);
        }
      },
      None => errors.push(invalid_type(&conditions_path, "array", conditions)),
    }
  }

  let Some(functions) = object.get("gathering_functions") else {
    errors.push(ValidationError::new(path, "gathering_functions is required"));
    return;
  };
  let functions_path = join_path(path, "gathering_functions");
  let Some(functions) = functions.as_object() else {
    errors.push(invalid_type(&functions_path, "object", functions));
    return;
  };
  if functions.is_empty() {
    errors.push(ValidationError::new(
      &functions_path,
      "Must have at least 1 properties",
    ));
  }
  for (name, params) in functions {
    match registry.get(name) {
      Some(function) => validate_object(
        &join_path(&functions_path, name),
        params,
        function.params_schema(),
        errors,
      ),
      None => errors.push(ValidationError::new(
        &functions_path,
        format!("Additional property {name} is not allowed"),
      )),
    }
  }
}

/// Validates the rules and log requests of a configuration against the registered function
/// schemas. Returns every offending field, or nothing if the configuration is valid.
#[must_use]
pub fn validate_configuration(
  configuration: &RawConfiguration,
  registry: &Registry,
) -> Vec<ValidationError> {
  let mut errors = Vec::new();

  match configuration.rules.as_array() {
    Some(rules) if rules.is_empty() => {
      errors.push(ValidationError::new("", "there are no conditional rules"));
    },
    Some(rules) => {
      if rules.len() > MAX_RULES {
        errors.push(ValidationError::new(
          "",
          format!("Array must have at most {MAX_RULES} items"),
        ));
      }
      check_unique("", rules, &mut errors);
      for (i, rule) in rules.iter().enumerate() {
        validate_rule(&i.to_string(), rule, registry, &mut errors);
      }
    },
    None => errors.push(invalid_type("", "array", &configuration.rules)),
  }

  match configuration.container_logs.as_array() {
    Some(requests) => {
      for (i, request) in requests.iter().enumerate() {
        let path = join_path("container_logs", i);
        validate_object(&path, request, CONTAINER_LOGS_REQUEST, &mut errors);
        if let Some(pod_name_regex) = request.get("pod_name_regex").and_then(Value::as_str)
          && let Err(e) = Regex::new(pod_name_regex)
        {
          errors.push(ValidationError::new(
            &join_path(&path, "pod_name_regex"),
            format!("invalid regex: {e}"),
          ));
        }
      }
    },
    None => errors.push(invalid_type(
      "container_logs",
      "array",
      &configuration.container_logs,
    )),
  }

  errors
}
