//! Transport that talks HTTP/1.1 to the LocalAPI UNIX socket.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;

use tailtray_localapi::{
    masked_prefs, watch_path, FrameSplitter, IpnBusFrame, LocalApiError, LOCALAPI_HOST,
    MAX_RESPONSE_BYTES, NOTIFY_INITIAL_PREFS, NOTIFY_INITIAL_STATE, PATH_LOGIN_INTERACTIVE,
    PATH_LOGOUT, PATH_PREFS, PATH_STATUS,
};

use super::{CommandGateway, FrameStream, LoginFlags, UpFlags};
use crate::config::TrayConfig;
use crate::error::{Result, TrayError};
use crate::extract::extract_json_object;
use crate::types::Preference;

type RequestBody = Full<Bytes>;

#[derive(Debug, Clone)]
pub struct SocketGateway {
    socket_path: PathBuf,
    connect_timeout: Duration,
    timeout: Duration,
}

impl SocketGateway {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let defaults = TrayConfig::default();
        Self {
            socket_path: socket_path.into(),
            connect_timeout: defaults.connect_timeout(),
            timeout: defaults.command_timeout(),
        }
    }

    pub fn from_config(config: &TrayConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            connect_timeout: config.connect_timeout(),
            timeout: config.command_timeout(),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.timeout = request;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn connect(&self) -> Result<UnixStream> {
        let context = format!("connecting to {}", self.socket_path.display());
        let connect = UnixStream::connect(&self.socket_path);
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(TrayError::transport(context, err)),
            Err(_) => Err(TrayError::timeout(context, self.connect_timeout)),
        }
    }

    /// Opens a fresh connection and sends one request on it.
    ///
    /// The connection task ends once the response body is dropped.
    async fn send(&self, request: Request<RequestBody>) -> Result<Response<Incoming>> {
        let path = request.uri().path().to_string();
        let stream = self.connect().await?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|source| TrayError::Http {
                context: format!("handshake for {}", path),
                source,
            })?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(error = %err, "LocalAPI connection closed with error");
            }
        });

        sender
            .send_request(request)
            .await
            .map_err(|source| TrayError::Http {
                context: format!("sending {}", path),
                source,
            })
    }

    async fn round_trip(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Bytes)> {
        let operation = format!("{} {}", method, path);
        let request = build_request(method, path, body)?;

        match tokio::time::timeout(self.timeout, self.exchange(request, path)).await {
            Ok(result) => result,
            Err(_) => Err(TrayError::timeout(operation, self.timeout)),
        }
    }

    async fn exchange(&self, request: Request<RequestBody>, path: &str) -> Result<(StatusCode, Bytes)> {
        let response = self.send(request).await?;
        let status = response.status();
        let body = collect_body(response.into_body(), path).await?;
        Ok((status, body))
    }

    /// Performs a request and returns the body of a 2xx response.
    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<String> {
        let (status, bytes) = self.round_trip(method, path, body).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if !status.is_success() {
            return Err(TrayError::HttpStatus {
                path: path.to_string(),
                status: status.as_u16(),
                body: text.trim().to_string(),
            });
        }
        Ok(text)
    }

    async fn patch_prefs(&self, fields: &[(&str, Value)]) -> Result<String> {
        let mut body = Map::new();
        for (field, value) in fields {
            if let Value::Object(masked) = masked_prefs(field, value.clone()) {
                body.extend(masked);
            }
        }
        self.request(Method::PATCH, PATH_PREFS, Some(&Value::Object(body)))
            .await
    }

    async fn open_watch(&self, mask: u32) -> Result<SocketFrameStream> {
        let path = watch_path(mask);
        let request = build_request(Method::GET, &path, None)?;

        let response = match tokio::time::timeout(self.connect_timeout, self.send(request)).await {
            Ok(result) => result?,
            Err(_) => return Err(TrayError::timeout(path, self.connect_timeout)),
        };

        let status = response.status();
        if !status.is_success() {
            let body =
                match tokio::time::timeout(self.connect_timeout, collect_body(response.into_body(), &path))
                    .await
                {
                    Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).trim().to_string(),
                    _ => String::new(),
                };
            return Err(TrayError::HttpStatus {
                path,
                status: status.as_u16(),
                body,
            });
        }

        Ok(SocketFrameStream {
            body: response.into_body(),
            splitter: FrameSplitter::new(),
            ready: VecDeque::new(),
        })
    }
}

#[async_trait]
impl CommandGateway for SocketGateway {
    async fn fetch_status(&self) -> Result<String> {
        self.request(Method::GET, PATH_STATUS, None).await
    }

    async fn fetch_prefs(&self) -> Result<String> {
        self.request(Method::GET, PATH_PREFS, None).await
    }

    async fn watch(&self) -> Result<Option<Box<dyn FrameStream>>> {
        let stream = self
            .open_watch(NOTIFY_INITIAL_STATE | NOTIFY_INITIAL_PREFS)
            .await?;
        Ok(Some(Box::new(stream)))
    }

    async fn up(&self, flags: &UpFlags) -> Result<String> {
        let mut fields = vec![("WantRunning", Value::Bool(true))];
        if flags.accept_routes {
            fields.push(("RouteAll", Value::Bool(true)));
        }
        if let Some(operator) = &flags.operator {
            fields.push(("OperatorUser", Value::String(operator.clone())));
        }
        self.patch_prefs(&fields).await
    }

    async fn down(&self) -> Result<String> {
        self.patch_prefs(&[("WantRunning", Value::Bool(false))]).await
    }

    async fn login(&self, flags: &LoginFlags) -> Result<String> {
        if flags.login_server.is_some() {
            tracing::warn!("login_server is only honored by the CLI transport");
        }

        // Subscribe first so the BrowseToURL notification cannot be missed.
        let mut watch = self.open_watch(NOTIFY_INITIAL_STATE).await?;
        self.request(Method::POST, PATH_LOGIN_INTERACTIVE, None)
            .await?;

        match tokio::time::timeout(self.timeout, wait_for_browse_url(&mut watch)).await {
            Ok(Ok(Some(url))) => return Ok(url),
            Ok(Ok(None)) => tracing::debug!("Watch ended without a login URL"),
            Ok(Err(err)) => tracing::warn!(error = %err, "Watch failed while waiting for login URL"),
            Err(_) => tracing::debug!("Timed out waiting for login URL on the bus"),
        }
        drop(watch);

        let status = self.fetch_status().await?;
        extract_json_object(&status)
            .and_then(|status| {
                status
                    .get("AuthURL")
                    .and_then(Value::as_str)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
            })
            .ok_or_else(|| TrayError::CommandFailed {
                command: format!("POST {}", PATH_LOGIN_INTERACTIVE),
                details: "no login URL reported".to_string(),
            })
    }

    async fn logout(&self) -> Result<String> {
        self.request(Method::POST, PATH_LOGOUT, None).await
    }

    async fn set_exit_node(&self, node: Option<&str>) -> Result<String> {
        // The prefs API takes a stable node id; names only work through the CLI.
        let id = node.unwrap_or_default().to_string();
        self.patch_prefs(&[("ExitNodeID", Value::String(id))]).await
    }

    async fn set_preference(&self, preference: Preference, enabled: bool) -> Result<String> {
        self.patch_prefs(&[(preference.prefs_field(), Value::Bool(enabled))])
            .await
    }
}

fn build_request(method: Method, path: &str, body: Option<&Value>) -> Result<Request<RequestBody>> {
    let payload = match body {
        Some(value) => serde_json::to_vec(value).map_err(|source| TrayError::Json {
            context: format!("encoding body for {}", path),
            source,
        })?,
        None => Vec::new(),
    };

    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(HOST, LOCALAPI_HOST);
    if body.is_some() {
        builder = builder.header(CONTENT_TYPE, "application/json");
    }
    builder
        .body(Full::new(Bytes::from(payload)))
        .map_err(|source| TrayError::Request {
            context: path.to_string(),
            source,
        })
}

/// Reads a whole response body, capped at `MAX_RESPONSE_BYTES`.
async fn collect_body(body: Incoming, path: &str) -> Result<Bytes> {
    match Limited::new(body, MAX_RESPONSE_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.is::<LengthLimitError>() => Err(LocalApiError::TooLarge {
            limit: MAX_RESPONSE_BYTES,
        }
        .into()),
        Err(err) => match err.downcast::<hyper::Error>() {
            Ok(source) => Err(TrayError::Http {
                context: format!("reading {}", path),
                source: *source,
            }),
            Err(other) => Err(TrayError::MalformedPayload(format!(
                "reading {}: {}",
                path, other
            ))),
        },
    }
}

/// Reads bus frames until one carries a login URL.
async fn wait_for_browse_url(watch: &mut SocketFrameStream) -> Result<Option<String>> {
    while let Some(frame) = watch.next_frame().await? {
        let Ok(frame) = serde_json::from_str::<IpnBusFrame>(&frame) else {
            continue;
        };
        if let Some(url) = frame.browse_to_url.filter(|url| !url.is_empty()) {
            return Ok(Some(url));
        }
    }
    Ok(None)
}

/// Body of a `watch-ipn-bus` response, split into JSON frames.
struct SocketFrameStream {
    body: Incoming,
    splitter: FrameSplitter,
    ready: VecDeque<String>,
}

#[async_trait]
impl FrameStream for SocketFrameStream {
    async fn next_frame(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            let Some(frame) = self.body.frame().await else {
                return Ok(None);
            };
            let frame = frame.map_err(|source| TrayError::Http {
                context: "reading watch stream".to_string(),
                source,
            })?;
            if let Ok(data) = frame.into_data() {
                self.ready.extend(self.splitter.push(&data));
            }
        }
    }
}
