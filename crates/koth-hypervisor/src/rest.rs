//! REST + console-websocket client for a Proxmox-style hypervisor API.
//!
//! This is the one place that knows vendor endpoints. API calls use a
//! token (`PVEAPIToken=<id>=<secret>`); the console path additionally
//! performs a ticket login because the console proxy only accepts
//! cookie-authenticated websockets.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, trace};

use koth_core::config::HypervisorConfig;

use crate::client::{ConsoleChannel, ConsoleHandle, ContainerInfo, Ctid, HypervisorClient};
use crate::error::{HvResult, HypervisorError};
use crate::spec::CtOption;

const CREATE_TASK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const POWER_TASK_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// REST-backed vendor client.
pub struct PveRestClient {
    http: reqwest::Client,
    base: String,
    host: String,
    port: u16,
    token_id: String,
    token_secret: String,
    username: String,
    password: String,
    insecure: bool,
}

impl PveRestClient {
    pub fn new(config: &HypervisorConfig) -> HvResult<Self> {
        let port = if config.port == 0 { 8006 } else { config.port };
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| HypervisorError::Vendor(e.to_string()))?;

        Ok(Self {
            http,
            base: format!("https://{}:{}/api2/json", config.host, port),
            host: config.host.clone(),
            port,
            token_id: config.token_id.clone(),
            token_secret: config.token_secret.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            insecure: config.insecure_skip_verify,
        })
    }

    fn auth_header(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.token_secret)
    }

    /// Terminal user for the console handshake: the proxy-reported user,
    /// else the token owner, normalized to `user@realm`.
    fn terminal_user(&self, reported: &str) -> String {
        if !reported.is_empty() {
            return reported.to_string();
        }

        let mut user = self
            .token_id
            .split('!')
            .next()
            .unwrap_or_default()
            .to_string();
        if user.is_empty() {
            user = self.username.clone();
        }
        if user.is_empty() {
            return String::new();
        }
        if !user.contains('@') {
            user = format!("{user}@pam");
        }
        user
    }

    async fn get_data(&self, path: &str) -> HvResult<Value> {
        let response = self
            .http
            .get(format!("{}{path}", self.base))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| HypervisorError::Vendor(e.to_string()))?;

        Self::decode_data(response).await
    }

    async fn post_data(&self, path: &str, form: &[(String, String)]) -> HvResult<Value> {
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .header("Authorization", self.auth_header())
            .form(form)
            .send()
            .await
            .map_err(|e| HypervisorError::Vendor(e.to_string()))?;

        Self::decode_data(response).await
    }

    async fn decode_data(response: reqwest::Response) -> HvResult<Value> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| HypervisorError::Vendor(e.to_string()))?;

        if !status.is_success() {
            return Err(HypervisorError::Vendor(format!(
                "request failed ({status}): {body}"
            )));
        }

        let parsed: Value =
            serde_json::from_str(&body).map_err(|e| HypervisorError::Vendor(e.to_string()))?;
        Ok(parsed.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Poll a task UPID until it stops, then check its exit status.
    async fn wait_task(&self, node: &str, upid: &str, timeout: Duration) -> HvResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self
                .get_data(&format!("/nodes/{node}/tasks/{upid}/status"))
                .await?;

            if status["status"].as_str() == Some("stopped") {
                let exit = status["exitstatus"].as_str().unwrap_or_default();
                if exit == "OK" {
                    return Ok(());
                }
                return Err(HypervisorError::TaskFailed(exit.to_string()));
            }

            if Instant::now() >= deadline {
                return Err(HypervisorError::TaskFailed(format!(
                    "task {upid} did not finish within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    /// Run a container power/delete task and wait for it.
    async fn container_task(
        &self,
        ctid: Ctid,
        method: reqwest::Method,
        path_suffix: &str,
    ) -> HvResult<()> {
        let node = self.locate(ctid).await?;
        let url = format!("{}/nodes/{node}/lxc/{ctid}{path_suffix}", self.base);

        let response = self
            .http
            .request(method, url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| HypervisorError::Vendor(e.to_string()))?;

        let data = Self::decode_data(response).await?;
        let upid = data.as_str().unwrap_or_default();
        if upid.is_empty() {
            return Ok(());
        }
        self.wait_task(&node, upid, POWER_TASK_TIMEOUT).await
    }

    async fn locate(&self, ctid: Ctid) -> HvResult<String> {
        self.list_containers()
            .await?
            .into_iter()
            .find(|c| c.ctid == ctid)
            .map(|c| c.node)
            .ok_or(HypervisorError::NotFound(ctid))
    }

    /// Ticket login for the console path.
    async fn login_ticket(&self) -> HvResult<(String, String)> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(HypervisorError::Console(
                "missing hypervisor username/password for console ticket login".to_string(),
            ));
        }

        let data = self
            .post_data(
                "/access/ticket",
                &[
                    ("username".to_string(), self.username.clone()),
                    ("password".to_string(), self.password.clone()),
                ],
            )
            .await?;

        let ticket = data["ticket"].as_str().unwrap_or_default().to_string();
        let csrf = data["CSRFPreventionToken"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if ticket.is_empty() || csrf.is_empty() {
            return Err(HypervisorError::Console(
                "received empty ticket or CSRF token".to_string(),
            ));
        }
        Ok((ticket, csrf))
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl HypervisorClient for PveRestClient {
    async fn nodes(&self) -> HvResult<Vec<String>> {
        let data = self.get_data("/nodes").await?;
        let mut nodes = Vec::new();
        for entry in data.as_array().map(Vec::as_slice).unwrap_or_default() {
            if entry["status"].as_str() == Some("online") {
                if let Some(name) = entry["node"].as_str() {
                    nodes.push(name.to_string());
                }
            }
        }
        Ok(nodes)
    }

    async fn next_ctid(&self) -> HvResult<Ctid> {
        let data = self.get_data("/cluster/nextid").await?;
        value_as_i64(&data)
            .ok_or_else(|| HypervisorError::Vendor(format!("unexpected nextid payload: {data}")))
    }

    async fn is_ctid_free(&self, ctid: Ctid) -> HvResult<bool> {
        // The nextid endpoint rejects ids already in use.
        let response = self
            .http
            .get(format!("{}/cluster/nextid", self.base))
            .query(&[("vmid", ctid)])
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| HypervisorError::Vendor(e.to_string()))?;

        Ok(response.status().is_success())
    }

    async fn create_container(&self, node: &str, ctid: Ctid, options: &[CtOption]) -> HvResult<()> {
        let mut form: Vec<(String, String)> = vec![("vmid".to_string(), ctid.to_string())];
        form.extend(options.iter().map(|o| (o.name.clone(), o.value.clone())));

        let data = self.post_data(&format!("/nodes/{node}/lxc"), &form).await?;
        let upid = data.as_str().unwrap_or_default();
        if upid.is_empty() {
            return Err(HypervisorError::Vendor(
                "create did not return a task id".to_string(),
            ));
        }
        self.wait_task(node, upid, CREATE_TASK_TIMEOUT).await
    }

    async fn start_container(&self, ctid: Ctid) -> HvResult<()> {
        self.container_task(ctid, reqwest::Method::POST, "/status/start")
            .await
    }

    async fn stop_container(&self, ctid: Ctid) -> HvResult<()> {
        self.container_task(ctid, reqwest::Method::POST, "/status/stop")
            .await
    }

    async fn delete_container(&self, ctid: Ctid) -> HvResult<()> {
        self.container_task(ctid, reqwest::Method::DELETE, "").await
    }

    async fn list_containers(&self) -> HvResult<Vec<ContainerInfo>> {
        let mut containers = Vec::new();
        for node in self.nodes().await? {
            let data = self.get_data(&format!("/nodes/{node}/lxc")).await?;
            for entry in data.as_array().map(Vec::as_slice).unwrap_or_default() {
                let Some(ctid) = value_as_i64(&entry["vmid"]) else {
                    continue;
                };
                containers.push(ContainerInfo {
                    ctid,
                    name: entry["name"].as_str().unwrap_or_default().to_string(),
                    status: entry["status"].as_str().unwrap_or_default().to_string(),
                    node: node.clone(),
                });
            }
        }
        Ok(containers)
    }

    async fn open_console(&self, node: &str, ctid: Ctid) -> HvResult<ConsoleHandle> {
        let (auth_ticket, csrf) = self.login_ticket().await?;

        let response = self
            .http
            .post(format!("{}/nodes/{node}/lxc/{ctid}/termproxy", self.base))
            .header("Cookie", format!("PVEAuthCookie={auth_ticket}"))
            .header("CSRFPreventionToken", &csrf)
            .send()
            .await
            .map_err(|e| HypervisorError::Console(e.to_string()))?;

        let session = Self::decode_data(response)
            .await
            .map_err(|e| HypervisorError::Console(e.to_string()))?;

        let term_ticket = session["ticket"].as_str().unwrap_or_default().to_string();
        let term_port = value_as_i64(&session["port"]).unwrap_or_default();
        if term_ticket.is_empty() || term_port == 0 {
            return Err(HypervisorError::Console(
                "termproxy response missing ticket or port".to_string(),
            ));
        }

        let user = self.terminal_user(session["user"].as_str().unwrap_or_default());
        if user.is_empty() {
            return Err(HypervisorError::Console(
                "could not determine terminal user for handshake".to_string(),
            ));
        }

        // Build the websocket URL with proper query encoding.
        let mut url = reqwest::Url::parse(&format!(
            "wss://{}:{}/api2/json/nodes/{node}/lxc/{ctid}/vncwebsocket",
            self.host, self.port
        ))
        .map_err(|e| HypervisorError::Console(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("port", &term_port.to_string())
            .append_pair("vncticket", &term_ticket);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| HypervisorError::Console(e.to_string()))?;
        request.headers_mut().insert(
            "Cookie",
            format!("PVEAuthCookie={auth_ticket}")
                .parse()
                .map_err(|_| HypervisorError::Console("invalid cookie header".to_string()))?,
        );

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(self.insecure)
            .build()
            .map_err(|e| HypervisorError::Console(e.to_string()))?;

        let (ws, _) = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            Some(tokio_tungstenite::Connector::NativeTls(connector)),
        )
        .await
        .map_err(|e| HypervisorError::Console(e.to_string()))?;

        debug!(ctid, node, "console websocket connected");
        Ok(ConsoleHandle {
            user,
            ticket: term_ticket,
            channel: Box::new(WsConsoleChannel { ws }),
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Console channel over the vendor websocket.
struct WsConsoleChannel {
    ws: WsStream,
}

#[async_trait]
impl ConsoleChannel for WsConsoleChannel {
    async fn send(&mut self, frame: &[u8]) -> HvResult<()> {
        self.ws
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| HypervisorError::Console(e.to_string()))
    }

    async fn recv(&mut self) -> HvResult<Vec<u8>> {
        loop {
            match self.ws.next().await {
                None => return Err(HypervisorError::Console("websocket closed".to_string())),
                Some(Err(e)) => return Err(HypervisorError::Console(e.to_string())),
                Some(Ok(Message::Binary(bytes))) => return Ok(bytes),
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Close(_))) => {
                    return Err(HypervisorError::Console("websocket closed".to_string()))
                }
                Some(Ok(other)) => {
                    trace!(?other, "ignoring non-data websocket frame");
                }
            }
        }
    }
}
