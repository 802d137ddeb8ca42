use async_trait::async_trait;
use serde_json::{Value, json};

use fusion_sim::domain::collaborators::{InvocationRequest, UnitInvoker};
use fusion_sim::error::{Error, Result};

/// Invoker that fails every invocation of one designated unit and answers
/// instantly for the rest.
#[derive(Debug)]
pub struct FlakyInvoker {
    pub fail_unit: String,
}

impl FlakyInvoker {
    pub fn failing(unit_id: impl Into<String>) -> FlakyInvoker {
        FlakyInvoker { fail_unit: unit_id.into() }
    }
}

#[async_trait]
impl UnitInvoker for FlakyInvoker {
    async fn invoke(&self, request: InvocationRequest) -> Result<Value> {
        if request.unit.id == self.fail_unit {
            return Err(Error::ExecutionError { unit_id: request.unit.id.clone(), cause: "injected failure".to_string() });
        }
        Ok(json!({ "unit": request.unit.id, "output": format!("{}-done", request.unit.id) }))
    }
}
