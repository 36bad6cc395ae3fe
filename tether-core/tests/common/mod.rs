//! In-process fake homeserver for integration tests.
//!
//! Every request is recorded. Replies are scripted per (method, path suffix);
//! several replies for the same route are served in order and the last one
//! repeats. Unscripted routes get a Matrix-style 404.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use futures::{stream, StreamExt};
use matrix_sdk::ruma::UserId;
use reqwest::Url;
use tether_core::matrix::{
    event_channel, ClientConfig, EventReceiver, HomeserverClient, Session, SessionClient,
    SettingsStore, SyncController,
};

pub const ACCESS_TOKEN: &str = "token-1";
pub const USER_ID: &str = "@alice:localhost";

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
}

impl Recorded {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("request body should be JSON")
    }
}

#[derive(Debug, Clone)]
struct Reply {
    status: u16,
    body: String,
    delay: Option<Duration>,
    stall: bool,
}

#[derive(Debug)]
struct Route {
    method: Method,
    suffix: String,
    replies: VecDeque<Reply>,
}

#[derive(Debug, Default)]
struct Script {
    routes: Vec<Route>,
    requests: Vec<Recorded>,
}

#[derive(Clone)]
pub struct MockHomeserver {
    script: Arc<Mutex<Script>>,
    pub base_url: String,
}

impl MockHomeserver {
    pub async fn start() -> Self {
        let script = Arc::new(Mutex::new(Script::default()));
        let app = Router::new().fallback(handle).with_state(script.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock homeserver");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock homeserver");
        });

        Self {
            script,
            base_url: format!("http://{addr}"),
        }
    }

    pub fn on(&self, method: Method, suffix: &str, status: u16, body: impl Into<String>) -> &Self {
        self.push(method, suffix, status, body.into(), None, false)
    }

    /// Like [`on`](Self::on) but the reply is held back for `delay`.
    pub fn on_delayed(
        &self,
        method: Method,
        suffix: &str,
        status: u16,
        body: impl Into<String>,
        delay: Duration,
    ) -> &Self {
        self.push(method, suffix, status, body.into(), Some(delay), false)
    }

    /// Sends `body` and then keeps the response open without ever finishing it.
    pub fn on_stalled(
        &self,
        method: Method,
        suffix: &str,
        status: u16,
        body: impl Into<String>,
    ) -> &Self {
        self.push(method, suffix, status, body.into(), None, true)
    }

    fn push(
        &self,
        method: Method,
        suffix: &str,
        status: u16,
        body: String,
        delay: Option<Duration>,
        stall: bool,
    ) -> &Self {
        let reply = Reply {
            status,
            body,
            delay,
            stall,
        };
        let mut script = self.script.lock().unwrap();
        match script
            .routes
            .iter_mut()
            .find(|r| r.method == method && r.suffix == suffix)
        {
            Some(route) => route.replies.push_back(reply),
            None => script.routes.push(Route {
                method,
                suffix: suffix.to_owned(),
                replies: VecDeque::from([reply]),
            }),
        }
        self
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.script.lock().unwrap().requests.clone()
    }

    pub fn requests_to(&self, method: Method, suffix: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path.ends_with(suffix))
            .collect()
    }

    pub fn client(&self) -> HomeserverClient {
        let config = ClientConfig::new(&self.base_url).expect("mock url is valid");
        HomeserverClient::new(config).expect("build client")
    }

    pub fn session_client(&self, settings: Arc<dyn SettingsStore>) -> SessionClient {
        let hs = self.client();
        let session = Session::new(
            hs.homeserver().clone(),
            UserId::parse(USER_ID).expect("valid user id"),
            ACCESS_TOKEN,
            Some("DEVICE".into()),
        );
        hs.session(session, settings)
    }

    pub fn controller(&self, settings: Arc<dyn SettingsStore>) -> (SyncController, EventReceiver) {
        let (tx, rx) = event_channel();
        let client = self.session_client(settings.clone());
        (SyncController::new(client, settings, tx), rx)
    }
}

async fn handle(State(script): State<Arc<Mutex<Script>>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = to_bytes(body, usize::MAX).await.unwrap_or_default().to_vec();

    let full = Url::parse(&format!("http://mock{}", parts.uri)).expect("request uri");
    let query = full.query_pairs().into_owned().collect();
    let header_str = |name: header::HeaderName| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };

    let path = parts.uri.path().to_owned();
    let reply = {
        let mut script = script.lock().unwrap();
        script.requests.push(Recorded {
            method: parts.method.clone(),
            path: path.clone(),
            query,
            body,
            authorization: header_str(header::AUTHORIZATION),
            content_type: header_str(header::CONTENT_TYPE),
        });

        script
            .routes
            .iter_mut()
            .find(|r| r.method == parts.method && path.ends_with(&r.suffix))
            .and_then(|route| {
                if route.replies.len() > 1 {
                    route.replies.pop_front()
                } else {
                    route.replies.front().cloned()
                }
            })
    };

    let reply = reply.unwrap_or(Reply {
        status: 404,
        body: r#"{"errcode":"M_UNRECOGNIZED","error":"Unrecognized request"}"#.into(),
        delay: None,
        stall: false,
    });

    if let Some(delay) = reply.delay {
        tokio::time::sleep(delay).await;
    }

    let status = StatusCode::from_u16(reply.status).expect("valid status");
    if reply.stall {
        let first = stream::once(async move { Ok::<_, Infallible>(Bytes::from(reply.body)) });
        let body = Body::from_stream(first.chain(stream::pending()));
        return (
            status,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            body,
        )
            .into_response();
    }

    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        reply.body,
    )
        .into_response()
}
