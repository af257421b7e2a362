//! Remote function backend.
//!
//! Posts the request envelope to the function service and maps its
//! response back. The service itself (scaling, sandboxing) is an external
//! collaborator; the edge only speaks its invoke contract.

use super::{FunctionResponse, InvokeArgs, InvokeError, InvokeResult, request_envelope};
use std::time::Duration;

pub struct RemoteInvoker {
    base: String,
    client: reqwest::Client,
}

impl RemoteInvoker {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base: base.into(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn invoke(&self, args: &InvokeArgs) -> Result<InvokeResult, InvokeError> {
        let payload = serde_json::json!({
            "arn": args.arn,
            "captureLogs": args.capture_logs,
            "request": request_envelope(args),
        });

        let response = self
            .client
            .post(format!("{}/invoke", self.base))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(InvokeError::InvalidResponse(format!(
                "function service returned {}",
                response.status()
            )));
        }

        let decoded: FunctionResponse = response.json().await?;
        let result = decoded.into_result();

        if args.capture_logs {
            if let Some(queue) = &args.log_queue {
                for log in &result.logs {
                    queue(log.clone());
                }
            }
        }

        Ok(result.normalize())
    }
}
