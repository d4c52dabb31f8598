//! Application and command specifications.
//!
//! An [`ApplicationSpec`] describes one scientific tool a client wraps: its
//! identity (`slug` + `version`) and the commands it can execute. Specs are
//! built programmatically by the adapter at client startup, validated before
//! registration, and upserted into server state by the registration flow.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Validation failures for specs and for parameter maps checked against them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("spec field '{0}' must not be empty")]
    EmptyField(&'static str),
    #[error("application '{0}' declares no commands")]
    NoCommands(String),
    #[error("duplicate command name '{0}'")]
    DuplicateCommand(String),
    #[error("duplicate parameter '{parameter}' on command '{command}'")]
    DuplicateParameter { command: String, parameter: String },
    #[error("missing required parameter '{0}'")]
    MissingParameter(String),
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("parameter '{name}' expects dtype '{expected}'")]
    WrongParameterType { name: String, expected: ParameterType },
}

// ---------------------------------------------------------------------------
// Parameter model
// ---------------------------------------------------------------------------

/// Declared type of a command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    Str,
    Int,
    Float,
    Bool,
}

impl ParameterType {
    /// Whether a free-form value is acceptable for this dtype. Integers are
    /// accepted where a float is declared.
    #[must_use]
    pub fn accepts(self, value: &rmpv::Value) -> bool {
        match self {
            Self::Str => value.is_str(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_f32() || value.is_f64() || value.is_i64() || value.is_u64(),
            Self::Bool => value.is_bool(),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        }
    }
}

impl std::fmt::Display for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared parameter of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub dtype: ParameterType,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub default_value: Option<rmpv::Value>,
}

fn default_required() -> bool {
    true
}

impl ParameterSpec {
    /// A required parameter with no default.
    #[must_use]
    pub fn required(name: impl Into<String>, dtype: ParameterType) -> Self {
        Self {
            name: name.into(),
            dtype,
            required: true,
            default_value: None,
        }
    }

    /// An optional parameter with a default used when the caller omits it.
    #[must_use]
    pub fn optional(name: impl Into<String>, dtype: ParameterType, default: rmpv::Value) -> Self {
        Self {
            name: name.into(),
            dtype,
            required: false,
            default_value: Some(default),
        }
    }
}

// ---------------------------------------------------------------------------
// Command and application specs
// ---------------------------------------------------------------------------

/// One invocable operation of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Command-line template with `{param}` placeholders, present for
    /// commands implemented by spawning an external executable.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub call_pattern: Option<String>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            call_pattern: None,
        }
    }

    #[must_use]
    pub fn with_call_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.call_pattern = Some(pattern.into());
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Checks a caller-supplied parameter map against this command's schema
    /// and returns the effective map with defaults filled in.
    ///
    /// Fails on unknown parameters, missing required parameters, and dtype
    /// mismatches.
    pub fn resolve_parameters(
        &self,
        supplied: &HashMap<String, rmpv::Value>,
    ) -> Result<HashMap<String, rmpv::Value>, SpecError> {
        for name in supplied.keys() {
            if self.parameter(name).is_none() {
                return Err(SpecError::UnknownParameter(name.clone()));
            }
        }

        let mut resolved = HashMap::with_capacity(self.parameters.len());
        for spec in &self.parameters {
            match supplied.get(&spec.name) {
                Some(value) => {
                    if !spec.dtype.accepts(value) {
                        return Err(SpecError::WrongParameterType {
                            name: spec.name.clone(),
                            expected: spec.dtype,
                        });
                    }
                    resolved.insert(spec.name.clone(), value.clone());
                }
                None => {
                    if let Some(default) = &spec.default_value {
                        resolved.insert(spec.name.clone(), default.clone());
                    } else if spec.required {
                        return Err(SpecError::MissingParameter(spec.name.clone()));
                    }
                }
            }
        }
        Ok(resolved)
    }
}

/// Identity and command surface of one client-implemented application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub name: String,
    pub slug: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub email: Option<String>,
    pub commands: Vec<CommandSpec>,
}

impl ApplicationSpec {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        slug: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            version: version.into(),
            description: None,
            url: None,
            email: None,
            commands: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.commands.push(command);
        self
    }

    pub fn command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands.iter().map(|c| c.name.clone()).collect()
    }

    /// Structural validation applied before registration is attempted and
    /// again server-side before the spec is upserted.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.trim().is_empty() {
            return Err(SpecError::EmptyField("name"));
        }
        if self.slug.trim().is_empty() {
            return Err(SpecError::EmptyField("slug"));
        }
        if self.version.trim().is_empty() {
            return Err(SpecError::EmptyField("version"));
        }
        if self.commands.is_empty() {
            return Err(SpecError::NoCommands(self.slug.clone()));
        }
        let mut seen = Vec::with_capacity(self.commands.len());
        for command in &self.commands {
            if command.name.trim().is_empty() {
                return Err(SpecError::EmptyField("command.name"));
            }
            if seen.contains(&command.name.as_str()) {
                return Err(SpecError::DuplicateCommand(command.name.clone()));
            }
            seen.push(command.name.as_str());

            let mut params = Vec::with_capacity(command.parameters.len());
            for parameter in &command.parameters {
                if params.contains(&parameter.name.as_str()) {
                    return Err(SpecError::DuplicateParameter {
                        command: command.name.clone(),
                        parameter: parameter.name.clone(),
                    });
                }
                params.push(parameter.name.as_str());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> ApplicationSpec {
        ApplicationSpec::new("CrystalExplorer", "crystal_explorer", "21.5").with_command(
            CommandSpec::new("open_file")
                .with_call_pattern("crystalexplorer {input_file}")
                .with_parameter(ParameterSpec::required("input_file", ParameterType::Str))
                .with_parameter(ParameterSpec::optional(
                    "background",
                    ParameterType::Bool,
                    rmpv::Value::Boolean(true),
                )),
        )
    }

    #[test]
    fn valid_spec_passes_validation() {
        assert_eq!(sample_spec().validate(), Ok(()));
    }

    #[test]
    fn empty_slug_rejected() {
        let mut spec = sample_spec();
        spec.slug = "  ".to_string();
        assert_eq!(spec.validate(), Err(SpecError::EmptyField("slug")));
    }

    #[test]
    fn spec_without_commands_rejected() {
        let mut spec = sample_spec();
        spec.commands.clear();
        assert_eq!(
            spec.validate(),
            Err(SpecError::NoCommands("crystal_explorer".to_string()))
        );
    }

    #[test]
    fn duplicate_command_names_rejected() {
        let spec = sample_spec().with_command(CommandSpec::new("open_file"));
        assert_eq!(
            spec.validate(),
            Err(SpecError::DuplicateCommand("open_file".to_string()))
        );
    }

    #[test]
    fn duplicate_parameter_names_rejected() {
        let spec = ApplicationSpec::new("Tool", "tool", "1.0").with_command(
            CommandSpec::new("run")
                .with_parameter(ParameterSpec::required("x", ParameterType::Int))
                .with_parameter(ParameterSpec::required("x", ParameterType::Str)),
        );
        assert_eq!(
            spec.validate(),
            Err(SpecError::DuplicateParameter {
                command: "run".to_string(),
                parameter: "x".to_string(),
            })
        );
    }

    #[test]
    fn resolve_fills_defaults_and_validates_types() {
        let spec = sample_spec();
        let command = spec.command("open_file").unwrap();

        let mut supplied = HashMap::new();
        supplied.insert(
            "input_file".to_string(),
            rmpv::Value::from("a.cif"),
        );

        let resolved = command.resolve_parameters(&supplied).unwrap();
        assert_eq!(resolved["input_file"], rmpv::Value::from("a.cif"));
        assert_eq!(resolved["background"], rmpv::Value::Boolean(true));
    }

    #[test]
    fn resolve_rejects_missing_required_parameter() {
        let spec = sample_spec();
        let command = spec.command("open_file").unwrap();

        let err = command.resolve_parameters(&HashMap::new()).unwrap_err();
        assert_eq!(err, SpecError::MissingParameter("input_file".to_string()));
    }

    #[test]
    fn resolve_rejects_unknown_parameter() {
        let spec = sample_spec();
        let command = spec.command("open_file").unwrap();

        let mut supplied = HashMap::new();
        supplied.insert("input_file".to_string(), rmpv::Value::from("a.cif"));
        supplied.insert("nope".to_string(), rmpv::Value::from(1));

        let err = command.resolve_parameters(&supplied).unwrap_err();
        assert_eq!(err, SpecError::UnknownParameter("nope".to_string()));
    }

    #[test]
    fn resolve_rejects_wrong_dtype() {
        let spec = sample_spec();
        let command = spec.command("open_file").unwrap();

        let mut supplied = HashMap::new();
        supplied.insert("input_file".to_string(), rmpv::Value::from(42));

        let err = command.resolve_parameters(&supplied).unwrap_err();
        assert_eq!(
            err,
            SpecError::WrongParameterType {
                name: "input_file".to_string(),
                expected: ParameterType::Str,
            }
        );
    }

    #[test]
    fn int_accepted_where_float_declared() {
        let command = CommandSpec::new("calc")
            .with_parameter(ParameterSpec::required("tolerance", ParameterType::Float));

        let mut supplied = HashMap::new();
        supplied.insert("tolerance".to_string(), rmpv::Value::from(3));
        assert!(command.resolve_parameters(&supplied).is_ok());
    }

    #[test]
    fn spec_round_trips_through_msgpack() {
        let spec = sample_spec();
        let bytes = rmp_serde::to_vec_named(&spec).unwrap();
        let decoded: ApplicationSpec = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(spec, decoded);
    }
}
