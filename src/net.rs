//! Process-wide HTTP stack: client construction/caching behind a refcounted
//! guard, and the external stop event.

use crate::{config::Config, error::Error};
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, COOKIE};
use std::sync::Arc;
use tokio::sync::watch;

/// Shared client cache. Clients are keyed by the connection-affecting subset
/// of the configuration so concurrent downloads with identical transport
/// settings share pools.
pub(crate) struct HttpStack {
  clients: DashMap<String, reqwest::Client>,
}

impl HttpStack {
  fn new() -> Self {
    Self { clients: DashMap::new() }
  }

  pub fn client_for(&self, cfg: &Config) -> Result<reqwest::Client, Error> {
    let key = client_key(cfg);
    if let Some(existing) = self.clients.get(&key) {
      return Ok(existing.clone());
    }
    let client = build_client(cfg)?;
    self.clients.insert(key, client.clone());
    Ok(client)
  }
}

static STACK: Mutex<Option<(Arc<HttpStack>, usize)>> = Mutex::new(None);

/// Refcounted handle to the process-wide stack. The first holder brings the
/// stack up; dropping the last tears it down.
pub(crate) struct NetGuard {
  stack: Arc<HttpStack>,
}

impl NetGuard {
  pub fn acquire() -> Self {
    let mut slot = STACK.lock();
    match slot.as_mut() {
      Some((stack, refs)) => {
        *refs += 1;
        Self { stack: stack.clone() }
      }
      None => {
        let stack = Arc::new(HttpStack::new());
        *slot = Some((stack.clone(), 1));
        tracing::debug!("http stack initialized");
        Self { stack }
      }
    }
  }

  pub fn stack(&self) -> &HttpStack {
    &self.stack
  }
}

impl Drop for NetGuard {
  fn drop(&mut self) {
    let mut slot = STACK.lock();
    if let Some((_, refs)) = slot.as_mut() {
      *refs -= 1;
      if *refs == 0 {
        *slot = None;
        tracing::debug!("http stack torn down");
      }
    }
  }
}

#[cfg(test)]
pub(crate) fn stack_is_initialized() -> bool {
  STACK.lock().is_some()
}

static GLOBAL_GUARD: Mutex<Option<NetGuard>> = Mutex::new(None);

/// Optionally pin the HTTP stack for the whole process. Idempotent; without
/// it the stack simply follows the lifetime of running downloads.
pub fn global_init() {
  let mut slot = GLOBAL_GUARD.lock();
  if slot.is_none() {
    *slot = Some(NetGuard::acquire());
  }
}

/// Release the process-wide pin. Idempotent.
pub fn global_shutdown() {
  GLOBAL_GUARD.lock().take();
}

fn client_key(cfg: &Config) -> String {
  format!(
    "{:?}|{:?}|{:?}|{}|{}|{:?}|{:?}|{:?}",
    cfg.conn_timeout,
    cfg.read_timeout,
    cfg.proxy,
    cfg.verify_ca_enabled,
    cfg.verify_host_enabled,
    cfg.ca_path,
    cfg.cookie_list,
    cfg.http_headers,
  )
}

fn build_client(cfg: &Config) -> Result<reqwest::Client, Error> {
  let mut headers = HeaderMap::new();
  // Compressed transfer would break byte offsets; always ask for identity.
  headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
  for (k, v) in &cfg.http_headers {
    let name = HeaderName::from_bytes(k.as_bytes())
      .map_err(|_| Error::Unknown(format!("invalid header name: {k}")))?;
    let value = HeaderValue::from_str(v)
      .map_err(|_| Error::Unknown(format!("invalid header value for {k}")))?;
    headers.append(name, value);
  }
  if let Some(cookies) = &cfg.cookie_list {
    let value = HeaderValue::from_str(cookies)
      .map_err(|_| Error::Unknown("invalid cookie list".into()))?;
    headers.insert(COOKIE, value);
  }

  let mut builder = reqwest::Client::builder()
    .user_agent(concat!("zoe/", env!("CARGO_PKG_VERSION")))
    .redirect(reqwest::redirect::Policy::limited(10))
    .connect_timeout(cfg.conn_timeout)
    .default_headers(headers);
  if let Some(read_timeout) = cfg.read_timeout {
    builder = builder.read_timeout(read_timeout);
  }
  if let Some(proxy) = &cfg.proxy {
    let proxy =
      reqwest::Proxy::all(proxy).map_err(|e| Error::InvalidUrl(format!("proxy: {e}")))?;
    builder = builder.proxy(proxy);
  }
  // rustls ties hostname and chain verification together, so disabling
  // either one skips certificate verification as a whole.
  if !cfg.verify_ca_enabled || !cfg.verify_host_enabled {
    builder = builder.danger_accept_invalid_certs(true);
  }
  if let Some(ca_path) = &cfg.ca_path {
    let pem = std::fs::read(ca_path)
      .map_err(|e| Error::Unknown(format!("read ca bundle {}: {e}", ca_path.display())))?;
    let cert = reqwest::Certificate::from_pem(&pem)
      .map_err(|e| Error::Unknown(format!("parse ca bundle: {e}")))?;
    builder = builder.add_root_certificate(cert);
  }

  builder.build().map_err(|e| Error::Unknown(format!("failed to build http client: {e}")))
}

/// Externally settable cancel signal. Setting it is equivalent to calling
/// `stop()` on every download that subscribed to it.
#[derive(Clone)]
pub struct StopEvent {
  tx: Arc<watch::Sender<bool>>,
}

impl StopEvent {
  pub fn new() -> Self {
    Self { tx: Arc::new(watch::Sender::new(false)) }
  }

  pub fn set(&self) {
    self.tx.send_replace(true);
  }

  pub fn unset(&self) {
    self.tx.send_replace(false);
  }

  pub fn is_set(&self) -> bool {
    *self.tx.subscribe().borrow()
  }

  pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for StopEvent {
  fn default() -> Self {
    Self::new()
  }
}
