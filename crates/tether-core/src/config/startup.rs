//! Startup function calls

use serde::{Deserialize, Serialize};

/// A backend function invoked once after the initial deploy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallSpec {
    /// Function path, e.g. `init:seed`
    pub name: String,

    /// JSON arguments passed to the function
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl FunctionCallSpec {
    /// Call `name` with no arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: serde_json::Map::new(),
        }
    }

    /// Add an argument
    pub fn with_arg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }
}
