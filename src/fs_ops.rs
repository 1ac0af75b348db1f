//! Filesystem primitives fulfilled in-process for agents.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsResponse {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl FsResponse {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub async fn read_file(request_id: Option<&str>, file_path: &str) -> FsResponse {
    let mut response = FsResponse {
        msg_type: "readFileResponse",
        request_id: request_id.map(ToOwned::to_owned),
        success: false,
        message: String::new(),
        content: None,
    };

    if file_path.trim().is_empty() {
        response.message = "filePath is required".into();
        return response;
    }

    match tokio::fs::read_to_string(file_path).await {
        Ok(content) => {
            response.success = true;
            response.message = format!("Read {} bytes from {file_path}", content.len());
            response.content = Some(content);
        }
        Err(error) => {
            tracing::debug!(
                target = "agent_gateway::fs_ops",
                path = %file_path,
                error = %error,
                "readFile failed"
            );
            response.message = format!("Failed to read {file_path}: {error}");
        }
    }
    response
}

pub async fn write_file(request_id: Option<&str>, file_path: &str, content: &str) -> FsResponse {
    let mut response = FsResponse {
        msg_type: "writeFileResponse",
        request_id: request_id.map(ToOwned::to_owned),
        success: false,
        message: String::new(),
        content: None,
    };

    if file_path.trim().is_empty() {
        response.message = "filePath is required".into();
        return response;
    }

    let result = async {
        if let Some(parent) = Path::new(file_path).parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(file_path, content).await
    }
    .await;

    match result {
        Ok(()) => {
            response.success = true;
            response.message = format!("Wrote {} bytes to {file_path}", content.len());
        }
        Err(error) => {
            tracing::debug!(
                target = "agent_gateway::fs_ops",
                path = %file_path,
                error = %error,
                "writeFile failed"
            );
            response.message = format!("Failed to write {file_path}: {error}");
        }
    }
    response
}
