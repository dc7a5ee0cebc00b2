//! Tool catalog
//!
//! Toolkits are registered explicitly through [`ToolCatalogBuilder`]; the
//! resulting [`ToolCatalog`] is immutable and shared by every transport.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use arcade_protocol::mcp::{McpTool, ToolAnnotations};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::executor::ToolHandler;

/// `Toolkit.Name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FullyQualifiedName {
    pub toolkit: String,
    pub name: String,
}

impl FullyQualifiedName {
    pub fn new(toolkit: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            toolkit: toolkit.into(),
            name: name.into(),
        }
    }

    /// Parse `Toolkit.Name`.
    pub fn parse(value: &str) -> Option<Self> {
        let (toolkit, name) = value.split_once('.')?;
        if toolkit.is_empty() || name.is_empty() || name.contains('.') {
            return None;
        }
        Some(Self::new(toolkit, name))
    }

    /// Name as exposed over MCP, where dots are not allowed
    pub fn mcp_name(&self) -> String {
        format!("{}_{}", self.toolkit, self.name)
    }

    fn key(&self) -> String {
        format!("{}.{}", self.toolkit, self.name).to_lowercase()
    }
}

impl fmt::Display for FullyQualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.toolkit, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Integer,
    Number,
    Boolean,
    Json,
    Array,
}

impl ValueType {
    pub fn json_schema_type(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Integer => "integer",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Json => "object",
            ValueType::Array => "array",
        }
    }

    /// Whether a JSON value is acceptable for this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueType::String => value.is_string(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Number => value.is_number(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Json => value.is_object(),
            ValueType::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSchema {
    pub val_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_val_type: Option<ValueType>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

impl ValueSchema {
    pub fn of(val_type: ValueType) -> Self {
        Self {
            val_type,
            inner_val_type: None,
            enum_values: None,
        }
    }

    pub fn array_of(inner: ValueType) -> Self {
        Self {
            val_type: ValueType::Array,
            inner_val_type: Some(inner),
            enum_values: None,
        }
    }

    fn json_schema(&self) -> Map<String, Value> {
        let mut schema = Map::new();
        schema.insert("type".into(), json!(self.val_type.json_schema_type()));
        if let Some(values) = &self.enum_values {
            schema.insert("enum".into(), json!(values));
        }
        if let (ValueType::Array, Some(inner)) = (self.val_type, self.inner_val_type) {
            schema.insert("items".into(), json!({"type": inner.json_schema_type()}));
        }
        schema
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputParameter {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub value_schema: ValueSchema,
    #[serde(default = "default_inferrable")]
    pub inferrable: bool,
}

fn default_inferrable() -> bool {
    true
}

impl InputParameter {
    pub fn required(
        name: impl Into<String>,
        schema: ValueSchema,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            required: true,
            description: Some(description.into()),
            value_schema: schema,
            inferrable: true,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        schema: ValueSchema,
        description: impl Into<String>,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, schema, description)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolInput {
    pub parameters: Vec<InputParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub available_modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_schema: Option<ValueSchema>,
}

impl Default for ToolOutput {
    fn default() -> Self {
        Self {
            description: None,
            available_modes: vec!["value".into(), "error".into()],
            value_schema: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth2Requirement {
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequirement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    pub provider_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<OAuth2Requirement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretRequirement {
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthRequirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretRequirement>,
}

/// Behavior hints surfaced as MCP tool annotations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Behavior {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destructive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_world: Option<bool>,
}

impl Behavior {
    /// Pure computation: read-only, idempotent, closed world.
    pub fn pure() -> Self {
        Self {
            read_only: Some(true),
            destructive: Some(false),
            idempotent: Some(true),
            open_world: Some(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolkitDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub fully_qualified_name: String,
    pub description: String,
    pub toolkit: ToolkitDefinition,
    pub input: ToolInput,
    pub output: ToolOutput,
    #[serde(default)]
    pub requirements: ToolRequirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<Behavior>,
}

impl ToolDefinition {
    pub fn fqn(&self) -> FullyQualifiedName {
        FullyQualifiedName::new(&self.toolkit.name, &self.name)
    }

    pub fn secret_keys(&self) -> impl Iterator<Item = &str> {
        self.requirements.secrets.iter().map(|s| s.key.as_str())
    }

    /// JSON Schema for `tools/list`
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for param in &self.input.parameters {
            let mut schema = param.value_schema.json_schema();
            if let Some(desc) = &param.description {
                schema.insert("description".into(), json!(desc));
            }
            properties.insert(param.name.clone(), Value::Object(schema));
            if param.required {
                required.push(param.name.clone());
            }
        }

        let mut schema = json!({
            "type": "object",
            "properties": properties,
            "additionalProperties": false,
        });
        if !required.is_empty() {
            schema["required"] = json!(required);
        }
        schema
    }

    pub fn to_mcp_tool(&self) -> McpTool {
        let behavior = self.behavior.unwrap_or_default();
        McpTool {
            name: self.fqn().mcp_name(),
            description: self.description.clone(),
            input_schema: self.input_schema(),
            annotations: Some(ToolAnnotations {
                title: Some(self.name.clone()),
                read_only_hint: behavior.read_only,
                destructive_hint: behavior.destructive,
                idempotent_hint: behavior.idempotent,
                open_world_hint: behavior.open_world,
            }),
        }
    }
}

/// A definition paired with the code that runs it
#[derive(Clone)]
pub struct MaterializedTool {
    pub definition: ToolDefinition,
    pub handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for MaterializedTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializedTool")
            .field("definition", &self.definition.fully_qualified_name)
            .finish()
    }
}

/// Declaration of a single tool inside a [`Toolkit`]
pub struct ToolSpec {
    name: String,
    description: String,
    parameters: Vec<InputParameter>,
    output: ToolOutput,
    requirements: ToolRequirements,
    behavior: Option<Behavior>,
    handler: Arc<dyn ToolHandler>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            output: ToolOutput::default(),
            requirements: ToolRequirements::default(),
            behavior: None,
            handler,
        }
    }

    pub fn param(mut self, param: InputParameter) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn output(mut self, description: impl Into<String>, schema: ValueSchema) -> Self {
        self.output.description = Some(description.into());
        self.output.value_schema = Some(schema);
        self
    }

    pub fn secret(mut self, key: impl Into<String>) -> Self {
        self.requirements.secrets.push(SecretRequirement { key: key.into() });
        self
    }

    pub fn authorization(mut self, requirement: AuthRequirement) -> Self {
        self.requirements.authorization = Some(requirement);
        self
    }

    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = Some(behavior);
        self
    }
}

pub struct Toolkit {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    tools: Vec<ToolSpec>,
}

impl Toolkit {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            tools: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("Invalid tool name '{0}'")]
    InvalidName(String),

    #[error("Tool '{tool}' has the same MCP name as '{existing}'")]
    McpNameCollision { tool: String, existing: String },

    #[error("Tool '{tool}' declares parameter '{param}' more than once")]
    DuplicateParameter { tool: String, param: String },
}

#[derive(Default)]
pub struct ToolCatalogBuilder {
    tools: BTreeMap<String, MaterializedTool>,
    // lowercased MCP name -> catalog key
    mcp_index: HashMap<String, String>,
}

impl ToolCatalogBuilder {
    pub fn add_toolkit(mut self, toolkit: Toolkit) -> Result<Self, CatalogError> {
        let toolkit_def = ToolkitDefinition {
            name: toolkit.name.clone(),
            description: toolkit.description.clone(),
            version: Some(toolkit.version.clone()),
        };

        for spec in toolkit.tools {
            if spec.name.is_empty() || spec.name.contains('.') {
                return Err(CatalogError::InvalidName(spec.name));
            }
            let fqn = FullyQualifiedName::new(&toolkit.name, &spec.name);

            let mut seen = std::collections::HashSet::new();
            for p in &spec.parameters {
                if !seen.insert(p.name.as_str()) {
                    return Err(CatalogError::DuplicateParameter {
                        tool: fqn.to_string(),
                        param: p.name.clone(),
                    });
                }
            }

            let key = fqn.key();
            if self.tools.contains_key(&key) {
                return Err(CatalogError::DuplicateTool(fqn.to_string()));
            }
            // `A_B.C` and `A.B_C` share the MCP name `A_B_C`
            let mcp_key = fqn.mcp_name().to_lowercase();
            if let Some(existing) = self.mcp_index.get(&mcp_key) {
                return Err(CatalogError::McpNameCollision {
                    tool: fqn.to_string(),
                    existing: self
                        .tools
                        .get(existing)
                        .map(|t| t.definition.fully_qualified_name.clone())
                        .unwrap_or_else(|| existing.clone()),
                });
            }

            let definition = ToolDefinition {
                name: spec.name,
                fully_qualified_name: fqn.to_string(),
                description: spec.description,
                toolkit: toolkit_def.clone(),
                input: ToolInput {
                    parameters: spec.parameters,
                },
                output: spec.output,
                requirements: spec.requirements,
                behavior: spec.behavior,
            };
            self.mcp_index.insert(mcp_key, key.clone());
            self.tools.insert(
                key,
                MaterializedTool {
                    definition,
                    handler: spec.handler,
                },
            );
        }
        Ok(self)
    }

    pub fn build(self) -> ToolCatalog {
        let catalog = ToolCatalog {
            tools: self.tools,
            mcp_index: self.mcp_index,
        };
        info!(
            tools = catalog.len(),
            toolkits = catalog.toolkit_names().len(),
            "Tool catalog built"
        );
        catalog
    }
}

/// Immutable set of tools, ordered by fully qualified name
#[derive(Clone, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, MaterializedTool>,
    mcp_index: HashMap<String, String>,
}

impl ToolCatalog {
    pub fn builder() -> ToolCatalogBuilder {
        ToolCatalogBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get(&self, fqn: &FullyQualifiedName) -> Option<&MaterializedTool> {
        self.tools.get(&fqn.key())
    }

    /// Look up by `Toolkit.Name` or the MCP form `Toolkit_Name`,
    /// case-insensitively.
    pub fn get_tool_by_name(&self, name: &str) -> Option<&MaterializedTool> {
        if let Some(tool) = FullyQualifiedName::parse(name).and_then(|fqn| self.get(&fqn)) {
            return Some(tool);
        }
        self.mcp_index
            .get(&name.to_lowercase())
            .and_then(|key| self.tools.get(key))
    }

    /// Find a tool by toolkit and name, optionally pinned to a version.
    pub fn find(
        &self,
        toolkit: &str,
        name: &str,
        version: Option<&str>,
    ) -> Option<&MaterializedTool> {
        let tool = self.get(&FullyQualifiedName::new(toolkit, name))?;
        match version {
            Some(v) if tool.definition.toolkit.version.as_deref() != Some(v) => None,
            _ => Some(tool),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MaterializedTool> {
        self.tools.values()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.iter().map(|t| t.definition.clone()).collect()
    }

    pub fn mcp_tools(&self) -> Vec<McpTool> {
        self.iter().map(|t| t.definition.to_mcp_tool()).collect()
    }

    pub fn toolkit_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.iter().map(|t| t.definition.toolkit.name.clone()).collect();
        names.dedup();
        names
    }

    /// SHA-256 over the definitions in name order; changes whenever any
    /// definition changes.
    pub fn catalog_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for tool in self.iter() {
            if let Ok(bytes) = serde_json::to_vec(&tool.definition) {
                hasher.update(&bytes);
            }
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::from_fn;

    fn echo() -> Arc<dyn ToolHandler> {
        from_fn(|_, args| Ok(Value::Object(args.clone())))
    }

    fn sample_catalog() -> ToolCatalog {
        let toolkit = Toolkit::new("Demo", "1.0.0")
            .description("Demo tools")
            .tool(
                ToolSpec::new("Echo", "Echo the input", echo())
                    .param(InputParameter::required(
                        "text",
                        ValueSchema::of(ValueType::String),
                        "Text",
                    ))
                    .param(InputParameter::optional(
                        "tags",
                        ValueSchema::array_of(ValueType::String),
                        "Tags",
                    )),
            )
            .tool(
                ToolSpec::new("Noop", "Does nothing", echo())
                    .secret("DEMO_KEY")
                    .behavior(Behavior::pure()),
            );

        ToolCatalog::builder().add_toolkit(toolkit).unwrap().build()
    }

    #[test]
    fn test_fully_qualified_name_parse() {
        let fqn = FullyQualifiedName::parse("Math.Add").unwrap();
        assert_eq!(fqn.toolkit, "Math");
        assert_eq!(fqn.name, "Add");
        assert_eq!(fqn.to_string(), "Math.Add");
        assert_eq!(fqn.mcp_name(), "Math_Add");
        assert!(FullyQualifiedName::parse("NoDot").is_none());
        assert!(FullyQualifiedName::parse("a.b.c").is_none());
    }

    #[test]
    fn test_lookup_accepts_both_name_forms() {
        let catalog = sample_catalog();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.get_tool_by_name("Demo.Echo").is_some());
        assert!(catalog.get_tool_by_name("Demo_Echo").is_some());
        assert!(catalog.get_tool_by_name("demo.echo").is_some());
        assert!(catalog.get_tool_by_name("Demo.Missing").is_none());
    }

    #[test]
    fn test_find_respects_version() {
        let catalog = sample_catalog();
        assert!(catalog.find("Demo", "Echo", Some("1.0.0")).is_some());
        assert!(catalog.find("Demo", "Echo", Some("2.0.0")).is_none());
        assert!(catalog.find("Demo", "Echo", None).is_some());
    }

    #[test]
    fn test_duplicate_tool_rejected() {
        let toolkit = Toolkit::new("Demo", "1.0.0")
            .tool(ToolSpec::new("Echo", "a", echo()))
            .tool(ToolSpec::new("echo", "b", echo()));
        let err = ToolCatalog::builder().add_toolkit(toolkit).err().unwrap();
        assert!(matches!(err, CatalogError::DuplicateTool(_)));
    }

    #[test]
    fn test_mcp_name_collision_rejected() {
        let first = Toolkit::new("A_B", "1.0.0").tool(ToolSpec::new("C", "a", echo()));
        let second = Toolkit::new("A", "1.0.0").tool(ToolSpec::new("B_C", "b", echo()));
        let err = ToolCatalog::builder()
            .add_toolkit(first)
            .unwrap()
            .add_toolkit(second)
            .err()
            .unwrap();
        match err {
            CatalogError::McpNameCollision { tool, existing } => {
                assert_eq!(tool, "A.B_C");
                assert_eq!(existing, "A_B.C");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_mcp_names_unique_in_catalog() {
        let catalog = sample_catalog();
        let mut names: Vec<String> = catalog.mcp_tools().into_iter().map(|t| t.name).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_input_schema_shape() {
        let catalog = sample_catalog();
        let tool = catalog.get_tool_by_name("Demo.Echo").unwrap();
        let schema = tool.definition.input_schema();

        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["text"]["type"], "string");
        assert_eq!(schema["properties"]["tags"]["items"]["type"], "string");
        assert_eq!(schema["required"], json!(["text"]));
        assert_eq!(schema["additionalProperties"], false);

        let noop = catalog.get_tool_by_name("Demo.Noop").unwrap();
        assert!(noop.definition.input_schema().get("required").is_none());
    }

    #[test]
    fn test_json_type_maps_to_object() {
        assert_eq!(ValueType::Json.json_schema_type(), "object");
        assert!(ValueType::Integer.accepts(&json!(3)));
        assert!(!ValueType::Integer.accepts(&json!(3.5)));
        assert!(ValueType::Number.accepts(&json!(3)));
    }

    #[test]
    fn test_mcp_tool_uses_underscore_name() {
        let catalog = sample_catalog();
        let tools = catalog.mcp_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Demo_Echo", "Demo_Noop"]);
        assert_eq!(tools[0].annotations.as_ref().unwrap().title.as_deref(), Some("Echo"));
        assert!(tools[0].annotations.as_ref().unwrap().read_only_hint.is_none());
        assert_eq!(tools[1].annotations.as_ref().unwrap().read_only_hint, Some(true));
    }

    #[test]
    fn test_catalog_hash_stable_and_sensitive() {
        let a = sample_catalog().catalog_hash();
        let b = sample_catalog().catalog_hash();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other = ToolCatalog::builder()
            .add_toolkit(
                Toolkit::new("Demo", "1.0.1").tool(ToolSpec::new("Echo", "Echo the input", echo())),
            )
            .unwrap()
            .build();
        assert_ne!(a, other.catalog_hash());
    }
}
