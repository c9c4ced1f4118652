// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use tracing::debug;

use super::Error;

const DEFAULT_EXEC_API_VERSION: &str = "client.authentication.k8s.io/v1beta1";

/// An `exec` credential plugin from a kubeconfig user.
#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecConfig {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Option<Vec<ExecEnvVar>>,
    pub api_version: Option<String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecEnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredentialStatus {
    pub token: Option<String>,
    pub client_certificate_data: Option<String>,
    pub client_key_data: Option<String>,
}

#[derive(Deserialize)]
struct ExecCredential {
    status: Option<ExecCredentialStatus>,
}

/// Runs the plugin and returns the credentials it printed.
pub async fn run(cfg: &ExecConfig) -> Result<ExecCredentialStatus, Error> {
    let name = cfg.command.display().to_string();
    let api_version = cfg
        .api_version
        .as_deref()
        .unwrap_or(DEFAULT_EXEC_API_VERSION);
    let exec_info = serde_json::json!({
        "apiVersion": api_version,
        "kind": "ExecCredential",
        "spec": { "interactive": false },
    });
    debug!(command = name, "running exec credential plugin");
    let output = tokio::process::Command::new(&cfg.command)
        .args(&cfg.args)
        .envs(
            cfg.env
                .iter()
                .flatten()
                .map(|e| (e.name.as_str(), e.value.as_str())),
        )
        .env("KUBERNETES_EXEC_INFO", exec_info.to_string())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::Exec(name.clone(), e.to_string()))?;
    if !output.status.success() {
        return Err(Error::Exec(
            name,
            format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    let credential: ExecCredential = serde_json::from_slice(&output.stdout)
        .map_err(|e| Error::Exec(name.clone(), format!("invalid ExecCredential: {e}")))?;
    let status = credential
        .status
        .ok_or_else(|| Error::Exec(name.clone(), "ExecCredential has no status".to_string()))?;
    if status.token.is_none() && status.client_certificate_data.is_none() {
        return Err(Error::Exec(name, "no token or client certificate returned".to_string()));
    }
    Ok(status)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use matches::assert_matches;

    fn sh(script: &str) -> ExecConfig {
        ExecConfig {
            command: "sh".into(),
            args: vec!["-c".to_string(), script.to_string()],
            env: Some(vec![ExecEnvVar {
                name: "TOKEN".to_string(),
                value: "from-env".to_string(),
            }]),
            api_version: None,
        }
    }

    #[tokio::test]
    async fn token_from_plugin() {
        let status = run(&sh(
            r#"echo "{\"kind\":\"ExecCredential\",\"status\":{\"token\":\"$TOKEN\"}}""#,
        ))
        .await
        .unwrap();
        assert_eq!(status.token.as_deref(), Some("from-env"));
    }

    #[tokio::test]
    async fn plugin_failure() {
        let res = run(&sh("echo denied >&2; exit 3")).await;
        assert_matches!(res, Err(Error::Exec(_, msg)) if msg.contains("denied"));
    }

    #[tokio::test]
    async fn plugin_without_credentials() {
        let res = run(&sh(r#"echo '{"status":{}}'"#)).await;
        assert_matches!(res, Err(Error::Exec(..)));
    }
}
