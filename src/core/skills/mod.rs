//! Skills loaded from YAML.
//!
//! A skill bundles instructions, the tools the model may call and an
//! optional resource table. Skill content lives entirely in configuration;
//! the dispatcher only ever sees tool definitions and generic handlers.
//!
//! ```yaml
//! skills:
//!   - name: coaching
//!     instructions: "Guide the user through a short routine."
//!     lookup_tool: get_resources
//!     tools:
//!       - name: get_resources
//!         description: "Fetch reference items for a topic"
//!         parameters:
//!           type: object
//!           properties:
//!             topic: { type: string }
//!           required: [topic]
//!     resources:
//!       warmup: ["Neck rolls", "Arm circles"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

use crate::core::realtime::{
    FunctionCallDispatcher, FunctionError, FunctionHandler, FunctionResult, RealtimeResult,
    ToolDefinition,
};

#[derive(Debug, Error)]
pub enum SkillError {
    #[error("Failed to read skills file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse skills YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid skill configuration: {0}")]
    Invalid(String),
}

/// Topic → items table served by [`ResourceLookup`].
pub type ResourceTable = BTreeMap<String, Vec<Value>>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Skill {
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub resources: ResourceTable,
    /// Tool answered from `resources`
    #[serde(default)]
    pub lookup_tool: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SkillSet {
    #[serde(default)]
    pub skills: Vec<Skill>,
}

impl SkillSet {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SkillError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate.
    pub fn from_yaml(contents: &str) -> Result<Self, SkillError> {
        let set: SkillSet = serde_yaml::from_str(contents)?;
        set.validate()?;
        Ok(set)
    }

    /// Skill names must be unique and non-empty, tool names unique across
    /// the set, and a `lookup_tool` must be one of the skill's own tools.
    pub fn validate(&self) -> Result<(), SkillError> {
        let mut skill_names = HashSet::new();
        let mut tool_names = HashSet::new();

        for skill in &self.skills {
            if skill.name.trim().is_empty() {
                return Err(SkillError::Invalid("skill name must not be empty".into()));
            }
            if !skill_names.insert(skill.name.as_str()) {
                return Err(SkillError::Invalid(format!(
                    "duplicate skill '{}'",
                    skill.name
                )));
            }

            for tool in &skill.tools {
                if tool.name.trim().is_empty() {
                    return Err(SkillError::Invalid(format!(
                        "skill '{}' has a tool without a name",
                        skill.name
                    )));
                }
                if !tool_names.insert(tool.name.as_str()) {
                    return Err(SkillError::Invalid(format!(
                        "tool '{}' is declared more than once",
                        tool.name
                    )));
                }
            }

            if let Some(lookup) = &skill.lookup_tool
                && !skill.tools.iter().any(|tool| &tool.name == lookup)
            {
                return Err(SkillError::Invalid(format!(
                    "skill '{}' uses lookup tool '{}' which it does not declare",
                    skill.name, lookup
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.iter().find(|skill| skill.name == name)
    }

    /// All tool definitions, in declaration order.
    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.skills
            .iter()
            .flat_map(|skill| skill.tools.iter().cloned())
            .collect()
    }

    /// Non-empty instructions joined by blank lines.
    pub fn instructions(&self) -> String {
        self.skills
            .iter()
            .map(|skill| skill.instructions.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Install the tool set on `dispatcher` and register a [`ResourceLookup`]
    /// for every skill that names a lookup tool.
    pub fn register(&self, dispatcher: &FunctionCallDispatcher) -> RealtimeResult<()> {
        for skill in &self.skills {
            if let Some(lookup) = &skill.lookup_tool {
                let handler = ResourceLookup::new(skill.resources.clone()).into_handler();
                dispatcher.register(lookup.clone(), handler);
            }
        }

        let tools = self.tools();
        info!(
            skills = self.skills.len(),
            tools = tools.len(),
            "Registering skills"
        );
        dispatcher.set_tools(Arc::new(tools))
    }
}

/// Function handler answering `{"topic": ...}` from a resource table.
#[derive(Debug, Clone)]
pub struct ResourceLookup {
    resources: Arc<ResourceTable>,
}

impl ResourceLookup {
    pub fn new(resources: ResourceTable) -> Self {
        Self {
            resources: Arc::new(resources),
        }
    }

    pub fn lookup(&self, args: &Value) -> FunctionResult {
        let topic = args["topic"]
            .as_str()
            .ok_or_else(|| FunctionError::Execution("missing 'topic' argument".into()))?;

        let items = self
            .resources
            .get(topic)
            .ok_or_else(|| FunctionError::Execution(format!("unknown topic '{topic}'")))?;

        Ok(json!({ "topic": topic, "items": items }))
    }

    pub fn into_handler(self) -> FunctionHandler {
        Arc::new(
            move |args: Value| -> Pin<Box<dyn Future<Output = FunctionResult> + Send>> {
                let result = self.lookup(&args);
                Box::pin(async move { result })
            },
        )
    }
}
