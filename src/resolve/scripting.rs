//! Script generation for server objects.

use std::sync::Arc;

use async_trait::async_trait;

use crate::db::{ScriptableObject, ServerClient};
use crate::error::{FleetError, Result};

/// Serializes a server object into SQL text.
#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    async fn generate_script(&self, object: &ScriptableObject) -> Result<String>;
}

/// Generates scripts from object definitions stored on a server.
pub struct ServerScriptGenerator {
    client: Arc<dyn ServerClient>,
}

impl ServerScriptGenerator {
    pub fn new(client: Arc<dyn ServerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ScriptGenerator for ServerScriptGenerator {
    async fn generate_script(&self, object: &ScriptableObject) -> Result<String> {
        match self.client.script_object(object).await {
            Ok(text) if text.trim().is_empty() => Err(FleetError::generation(format!(
                "Script for {object} is empty"
            ))),
            Ok(text) => Ok(text),
            Err(e @ FleetError::Generation(_)) => Err(e),
            Err(e) => Err(FleetError::generation(format!("Failed to script {object}: {e}"))),
        }
    }
}
