use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dish::DishType;
use crate::operation::ArgValue;

pub const RECIPE_VERSION: u32 = 1;

fn default_version() -> u32 {
    RECIPE_VERSION
}

/// An ordered, user-assembled list of operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub steps: Vec<RecipeStep>,
    #[serde(default)]
    pub options: BakeOptions,
}

impl Default for Recipe {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Recipe {
    pub fn new(steps: Vec<RecipeStep>) -> Self {
        Self {
            version: RECIPE_VERSION,
            steps,
            options: BakeOptions::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
        let recipe = Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse recipe YAML: {}", path.display()))?;
        Ok(recipe)
    }

    /// Parses YAML; JSON recipes parse too.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let recipe: Recipe = serde_yaml::from_str(content)?;
        Ok(recipe)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialise recipe")
    }

    pub fn step(mut self, step: RecipeStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends `op` with positional arguments.
    pub fn then<I, A>(self, op: &str, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ArgValue>,
    {
        self.step(RecipeStep::new(op, args))
    }

    pub fn with_output_type(mut self, output_type: DishType) -> Self {
        self.options.output_type = Some(output_type);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeStep {
    pub op: String,
    #[serde(default)]
    pub args: Vec<ArgValue>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub breakpoint: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl RecipeStep {
    pub fn new<I, A>(op: &str, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ArgValue>,
    {
        Self {
            op: op.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            disabled: false,
            breakpoint: false,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn breakpoint(mut self) -> Self {
        self.breakpoint = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BakeOptions {
    /// Representation the final dish is converted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<DishType>,
    #[serde(default)]
    pub ignore_breakpoints: bool,
}
