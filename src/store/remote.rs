//! # Remote Store
//!
//! [`StorageComponent`] over the sync service's HTTP API.
//!
//! The contract is blocking, so the store owns a small tokio runtime and
//! drives the async `reqwest` client with `block_on`. It is only ever called
//! from the sync worker thread, never from a UI-facing one.
//!
//! ## Session
//!
//! `connect()` exchanges the user token (Basic auth) for a session id, which
//! authorizes every later request as a Bearer token. `disconnect()` ends the
//! session. Record operations without a session fail `Unavailable`.
//!
//! ## Resources
//!
//! ```text
//! POST   /v1/sessions                       -> { "session_id": ... }
//! DELETE /v1/sessions/{session}
//! GET    /v1/users/{token}/runs             -> { "ids": [...] }
//! GET    /v1/users/{token}/runs/{id}        -> { "record": ..., "edit_time": ... }
//! PUT    /v1/users/{token}/runs/{id}          { "record": ..., "edit_time": ... }
//! DELETE /v1/users/{token}/runs/{id}
//! GET    /v1/users/{token}/ghosts           -> { "ids": [...] }
//! PUT    /v1/users/{token}/ghosts/{id}
//! DELETE /v1/users/{token}/ghosts/{id}
//! GET    /v1/users/{token}/aggregate        -> { "record": ..., "edit_time": ... }
//! PUT    /v1/users/{token}/aggregate          { "record": ..., "edit_time": ... }
//! ```
//!
//! A 404 on a GET means the resource is absent.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use base64::Engine;
use log::{debug, info, warn};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

use crate::config::RemoteConfig;
use crate::elapsed_ms;
use crate::error::{DecodeResultExt, PersistenceError, Result};
use crate::model::{AggregateRecord, EditClock, EditTime, RunId, RunRecord, UserToken};
use crate::store::{RemoteSession, StorageComponent};

/// Body of a stored record on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    record: T,
    edit_time: EditTime,
}

#[derive(Debug, Deserialize)]
struct IdList {
    ids: Vec<RunId>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_id: String,
}

/// Backoff before retry `attempt` (1-based) after a 429: 500ms, 1s, 2s, 4s max.
fn backoff_for(attempt: u32) -> Duration {
    Duration::from_millis(500 * (1 << attempt.saturating_sub(1).min(3)))
}

/// HTTP-backed [`StorageComponent`].
pub struct RemoteStore {
    runtime: Runtime,
    client: Client,
    base_url: Url,
    token: UserToken,
    session: Option<String>,
    clock: EditClock,
    max_retries: u32,
}

impl RemoteStore {
    pub fn new(config: &RemoteConfig, token: UserToken) -> Result<Self> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/')).map_err(|e| {
            PersistenceError::config(format!("Invalid base URL '{}': {}", config.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(PersistenceError::config(format!(
                "Base URL '{}' cannot carry paths",
                config.base_url
            )));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("runsync-remote")
            .enable_all()
            .build()
            .map_err(|e| PersistenceError::unavailable(format!("Failed to create runtime: {}", e)))?;

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| {
                PersistenceError::config(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            runtime,
            client,
            base_url,
            token,
            session: None,
            clock: EditClock::new(),
            max_retries: config.max_retries,
        })
    }

    /// URL under the base with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PersistenceError::config("Base URL cannot carry paths"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn user_url(&self, rest: &[&str]) -> Result<Url> {
        let mut segments = vec!["v1", "users", self.token.as_str()];
        segments.extend_from_slice(rest);
        self.url(&segments)
    }

    fn basic_auth(&self) -> String {
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("USER:{}", self.token.as_str()));
        format!("Basic {}", credentials)
    }

    fn bearer(&self) -> Result<String> {
        self.session
            .as_ref()
            .map(|s| format!("Bearer {}", s))
            .ok_or_else(|| PersistenceError::unavailable("No open remote session"))
    }

    /// Send a request, retrying 429s with backoff. Returns the response for
    /// any other status; transport failures map to `Unavailable`.
    fn send(&self, build: impl Fn(&Client) -> RequestBuilder) -> Result<Response> {
        let start = Instant::now();
        let mut retries = 0;
        self.runtime.block_on(async {
            loop {
                match build(&self.client).send().await {
                    Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                        retries += 1;
                        if retries > self.max_retries {
                            return Err(PersistenceError::unavailable(
                                "Max retries exceeded (429)",
                            ));
                        }
                        let wait = backoff_for(retries);
                        warn!(
                            "[RemoteStore] 429 Too Many Requests after {} ms, retry {} with {:?} backoff",
                            elapsed_ms(start),
                            retries,
                            wait
                        );
                        tokio::time::sleep(wait).await;
                    }
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        return Err(PersistenceError::unavailable(format!(
                            "Request error: {}",
                            e
                        )))
                    }
                }
            }
        })
    }

    fn authorized(&self, method: Method, url: Url) -> Result<Response> {
        let auth = self.bearer()?;
        let resp = self.send(|client| {
            client
                .request(method.clone(), url.clone())
                .header("Authorization", &auth)
        })?;
        check_status(resp)
    }

    fn authorized_json<B: Serialize>(&self, method: Method, url: Url, body: &B) -> Result<()> {
        let auth = self.bearer()?;
        let resp = self.send(|client| {
            client
                .request(method.clone(), url.clone())
                .header("Authorization", &auth)
                .json(body)
        })?;
        check_status(resp).map(|_| ())
    }

    /// GET a JSON resource; `Ok(None)` on 404.
    fn get_optional<T: DeserializeOwned>(&self, url: Url, key: &str) -> Result<Option<T>> {
        let auth = self.bearer()?;
        let resp = self.send(|client| client.get(url.clone()).header("Authorization", &auth))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp)?;
        let bytes = self
            .runtime
            .block_on(resp.bytes())
            .map_err(|e| PersistenceError::unavailable(format!("Body download error: {}", e)))?;
        serde_json::from_slice(&bytes).or_corrupt(key).map(Some)
    }

    fn get_ids(&self, collection: &str) -> Result<BTreeSet<RunId>> {
        let url = self.user_url(&[collection])?;
        let list: Option<IdList> = self.get_optional(url, collection)?;
        Ok(list.map(|l| l.ids.into_iter().collect()).unwrap_or_default())
    }

    fn stamp(&self, hint: Option<EditTime>) -> EditTime {
        match hint {
            Some(edit_time) => {
                self.clock.observe(edit_time);
                edit_time
            }
            None => self.clock.next(),
        }
    }
}

/// Map non-success statuses onto the error taxonomy.
fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(PersistenceError::unavailable(format!(
            "HTTP {} from {}",
            status,
            resp.url().path()
        )))
    }
}

impl StorageComponent for RemoteStore {
    fn bind_user(&mut self, token: &UserToken) {
        if &self.token != token {
            info!("[RemoteStore] Rebinding to a new user namespace");
            self.token = token.clone();
            // A session belongs to the token that opened it
            self.session = None;
        }
    }

    fn list_real_ids(&self) -> Result<BTreeSet<RunId>> {
        self.get_ids("runs")
    }

    fn list_ghost_ids(&self) -> Result<BTreeSet<RunId>> {
        self.get_ids("ghosts")
    }

    fn get_record(&self, id: RunId) -> Result<Option<RunRecord>> {
        let id_str = id.to_string();
        let url = self.user_url(&["runs", &id_str])?;
        let envelope: Option<Envelope<RunRecord>> =
            self.get_optional(url, &format!("run/{}", id))?;
        Ok(envelope.map(|e| e.record))
    }

    fn save_record(
        &mut self,
        record: &RunRecord,
        edit_time: Option<EditTime>,
    ) -> Result<EditTime> {
        let edit_time = self.stamp(edit_time);
        let id_str = record.id.to_string();
        let url = self.user_url(&["runs", &id_str])?;
        self.authorized_json(Method::PUT, url, &Envelope { record, edit_time })?;
        debug!("[RemoteStore] Uploaded run {} @ {}", record.id, edit_time);
        Ok(edit_time)
    }

    fn get_edit_time(&self, id: RunId) -> Result<EditTime> {
        let id_str = id.to_string();
        let url = self.user_url(&["runs", &id_str])?;
        let envelope: Option<Envelope<serde_json::Value>> =
            self.get_optional(url, &format!("run/{}", id))?;
        Ok(envelope.map(|e| e.edit_time).unwrap_or(EditTime::ABSENT))
    }

    fn delete_record(&mut self, id: RunId) -> Result<()> {
        let id_str = id.to_string();
        let url = self.user_url(&["runs", &id_str])?;
        self.authorized(Method::DELETE, url)?;
        debug!("[RemoteStore] Deleted run {}", id);
        Ok(())
    }

    fn save_ghost(&mut self, id: RunId) -> Result<()> {
        let id_str = id.to_string();
        let url = self.user_url(&["ghosts", &id_str])?;
        self.authorized(Method::PUT, url)?;
        debug!("[RemoteStore] Saved ghost {}", id);
        Ok(())
    }

    fn delete_ghost(&mut self, id: RunId) -> Result<()> {
        let id_str = id.to_string();
        let url = self.user_url(&["ghosts", &id_str])?;
        self.authorized(Method::DELETE, url)?;
        debug!("[RemoteStore] Deleted ghost {}", id);
        Ok(())
    }

    fn get_aggregate(&self) -> Result<Option<AggregateRecord>> {
        let url = self.user_url(&["aggregate"])?;
        let envelope: Option<Envelope<AggregateRecord>> = self.get_optional(url, "aggregate")?;
        Ok(envelope.map(|e| e.record))
    }

    fn get_aggregate_edit_time(&self) -> Result<EditTime> {
        let url = self.user_url(&["aggregate"])?;
        let envelope: Option<Envelope<serde_json::Value>> =
            self.get_optional(url, "aggregate")?;
        Ok(envelope.map(|e| e.edit_time).unwrap_or(EditTime::ABSENT))
    }

    fn save_aggregate(
        &mut self,
        record: &AggregateRecord,
        edit_time: Option<EditTime>,
    ) -> Result<EditTime> {
        let edit_time = self.stamp(edit_time);
        let url = self.user_url(&["aggregate"])?;
        self.authorized_json(Method::PUT, url, &Envelope { record, edit_time })?;
        debug!("[RemoteStore] Uploaded aggregate @ {}", edit_time);
        Ok(edit_time)
    }
}

impl RemoteSession for RemoteStore {
    fn connect(&mut self) -> Result<()> {
        let start = Instant::now();
        let url = self.url(&["v1", "sessions"])?;
        let auth = self.basic_auth();
        let resp = self.send(|client| client.post(url.clone()).header("Authorization", &auth))?;
        let resp = check_status(resp)?;
        let bytes = self
            .runtime
            .block_on(resp.bytes())
            .map_err(|e| PersistenceError::unavailable(format!("Body download error: {}", e)))?;
        let session: SessionResponse = serde_json::from_slice(&bytes).or_corrupt("session")?;
        self.session = Some(session.session_id);
        info!("[RemoteStore] Session opened ({} ms)", elapsed_ms(start));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let url = self.url(&["v1", "sessions", &session])?;
        let auth = format!("Bearer {}", session);
        let resp = self.send(|client| client.delete(url.clone()).header("Authorization", &auth))?;
        check_status(resp)?;
        info!("[RemoteStore] Session closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunTelemetry;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};

    fn store(base_url: &str) -> RemoteStore {
        let config = RemoteConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        };
        RemoteStore::new(&config, UserToken::new("user/1 x")).unwrap()
    }

    #[test]
    fn test_user_urls_are_namespaced_and_encoded() {
        let remote = store("https://sync.example.com/api/");
        let url = remote.user_url(&["runs", "1000"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://sync.example.com/api/v1/users/user%2F1%20x/runs/1000"
        );
    }

    #[test]
    fn test_basic_auth_encodes_token() {
        let remote = store("https://sync.example.com");
        let expected = base64::engine::general_purpose::STANDARD.encode("USER:user/1 x");
        assert_eq!(remote.basic_auth(), format!("Basic {}", expected));
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let config = RemoteConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            RemoteStore::new(&config, UserToken::new("t")),
            Err(PersistenceError::Config { .. })
        ));
    }

    #[test]
    fn test_operations_without_session_are_unavailable() {
        let mut remote = store("https://sync.example.com");
        assert!(!remote.is_connected());
        assert!(matches!(
            remote.list_real_ids(),
            Err(PersistenceError::Unavailable { .. })
        ));
        assert!(matches!(
            remote.save_ghost(RunId(1)),
            Err(PersistenceError::Unavailable { .. })
        ));
        // Disconnecting without a session is a no-op
        assert!(remote.disconnect().is_ok());
    }

    #[test]
    fn test_unreachable_host_is_unavailable() {
        // Port 9 (discard) on localhost is not expected to accept HTTP
        let mut remote = store("http://127.0.0.1:9");
        assert!(matches!(
            remote.connect(),
            Err(PersistenceError::Unavailable { .. })
        ));
        assert!(!remote.is_connected());
    }

    #[test]
    fn test_rebinding_drops_session() {
        let mut remote = store("https://sync.example.com");
        remote.session = Some("abc".to_string());
        remote.bind_user(&UserToken::new("someone-else"));
        assert!(!remote.is_connected());
    }

    #[test]
    fn test_envelope_wire_format() {
        let record = RunRecord::new(RunId(1000), RunTelemetry::default());
        let json = serde_json::to_value(Envelope {
            record: &record,
            edit_time: EditTime(77),
        })
        .unwrap();
        assert_eq!(json["edit_time"], 77);
        assert_eq!(json["record"]["id"], 1000);

        let back: Envelope<RunRecord> = serde_json::from_value(json).unwrap();
        assert_eq!(back.record, record);
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_for(1), Duration::from_millis(500));
        assert_eq!(backoff_for(2), Duration::from_millis(1000));
        assert_eq!(backoff_for(10), Duration::from_millis(4000));
    }

    // ------------------------------------------------------------------------
    // Against a local HTTP server
    // ------------------------------------------------------------------------

    fn reply(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Serve one canned response per connection, in order. The handle yields
    /// the raw requests received.
    fn serve(responses: Vec<String>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                requests.push(read_request(&mut stream));
                stream.write_all(response.as_bytes()).unwrap();
            }
            requests
        });
        (base_url, handle)
    }

    fn local_store(base_url: &str, max_retries: u32) -> RemoteStore {
        let config = RemoteConfig {
            base_url: base_url.to_string(),
            request_timeout_secs: 5,
            max_retries,
        };
        RemoteStore::new(&config, UserToken::new("tok")).unwrap()
    }

    fn with_session(base_url: &str) -> RemoteStore {
        let mut remote = local_store(base_url, 3);
        remote.session = Some("s-1".to_string());
        remote
    }

    #[test]
    fn test_session_is_opened_and_closed() {
        let (base_url, server) = serve(vec![
            reply("200 OK", r#"{"session_id":"s-1"}"#),
            reply("200 OK", ""),
        ]);
        let mut remote = local_store(&base_url, 3);
        let basic = remote.basic_auth().to_lowercase();

        remote.connect().unwrap();
        assert!(remote.is_connected());
        remote.disconnect().unwrap();
        assert!(!remote.is_connected());

        let requests = server.join().unwrap();
        assert!(requests[0].starts_with("POST /v1/sessions HTTP/1.1"));
        assert!(requests[0]
            .to_lowercase()
            .contains(&format!("authorization: {}", basic)));
        assert!(requests[1].starts_with("DELETE /v1/sessions/s-1 HTTP/1.1"));
        assert!(requests[1]
            .to_lowercase()
            .contains("authorization: bearer s-1"));
    }

    #[test]
    fn test_missing_resources_read_as_absent() {
        let (base_url, server) = serve(vec![
            reply("404 Not Found", ""),
            reply("404 Not Found", ""),
            reply("404 Not Found", ""),
        ]);
        let remote = with_session(&base_url);

        assert_eq!(remote.get_record(RunId(5)).unwrap(), None);
        assert_eq!(remote.get_aggregate_edit_time().unwrap(), EditTime::ABSENT);
        assert!(remote.list_ghost_ids().unwrap().is_empty());

        let requests = server.join().unwrap();
        assert!(requests[0].starts_with("GET /v1/users/tok/runs/5 HTTP/1.1"));
        assert!(requests[1].starts_with("GET /v1/users/tok/aggregate HTTP/1.1"));
        assert!(requests[2].starts_with("GET /v1/users/tok/ghosts HTTP/1.1"));
    }

    #[test]
    fn test_server_errors_are_unavailable() {
        let (base_url, server) = serve(vec![
            reply("503 Service Unavailable", ""),
            reply("500 Internal Server Error", ""),
        ]);
        let mut remote = with_session(&base_url);

        assert!(matches!(
            remote.get_aggregate(),
            Err(PersistenceError::Unavailable { .. })
        ));
        assert!(matches!(
            remote.save_ghost(RunId(3)),
            Err(PersistenceError::Unavailable { .. })
        ));
        server.join().unwrap();
    }

    #[test]
    fn test_undecodable_bodies_are_corrupt() {
        let (base_url, server) = serve(vec![
            reply("200 OK", "{}"),
            reply("200 OK", "not json"),
        ]);
        let mut remote = local_store(&base_url, 3);

        assert!(matches!(
            remote.connect(),
            Err(PersistenceError::CorruptData { ref key, .. }) if key == "session"
        ));
        assert!(!remote.is_connected());

        remote.session = Some("s-1".to_string());
        assert!(matches!(
            remote.get_record(RunId(5)),
            Err(PersistenceError::CorruptData { ref key, .. }) if key == "run/5"
        ));
        server.join().unwrap();
    }

    #[test]
    fn test_rate_limited_request_is_retried() {
        let (base_url, server) = serve(vec![
            reply("429 Too Many Requests", ""),
            reply("200 OK", r#"{"ids":[2,1]}"#),
        ]);
        let remote = with_session(&base_url);

        let ids = remote.list_real_ids().unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![RunId(1), RunId(2)]);
        assert_eq!(server.join().unwrap().len(), 2);
    }

    #[test]
    fn test_rate_limit_gives_up_after_max_retries() {
        let (base_url, server) = serve(vec![
            reply("429 Too Many Requests", ""),
            reply("429 Too Many Requests", ""),
        ]);
        let mut remote = local_store(&base_url, 1);
        remote.session = Some("s-1".to_string());

        assert!(matches!(
            remote.list_real_ids(),
            Err(PersistenceError::Unavailable { .. })
        ));
        assert_eq!(server.join().unwrap().len(), 2);
    }

    #[test]
    fn test_saved_record_carries_edit_time() {
        let (base_url, server) = serve(vec![reply("204 No Content", "")]);
        let mut remote = with_session(&base_url);
        let record = RunRecord::new(RunId(1000), RunTelemetry::default());

        let stored = remote.save_record(&record, Some(EditTime(77))).unwrap();
        assert_eq!(stored, EditTime(77));

        let requests = server.join().unwrap();
        assert!(requests[0].starts_with("PUT /v1/users/tok/runs/1000 HTTP/1.1"));
        assert!(requests[0].contains(r#""edit_time":77"#));
    }
}
