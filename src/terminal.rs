//! Seam to the external market data terminal.
//!
//! The terminal itself only runs inside its vendor process, so the pipeline talks to it through
//! [`MarketTerminal`]. [`HttpTerminal`] drives a local bridge process that exposes the terminal
//! calls as JSON endpoints.

use crate::candle::Timeframe;
use crate::error::TerminalError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Credentials for one terminal login.
#[derive(Debug, Clone, Copy)]
pub struct LoginRequest<'a> {
    pub terminal_path: &'a Path,
    pub login: u64,
    pub password: &'a str,
    pub server: &'a str,
    pub timeout: Duration,
}

/// Bar as reported by the terminal, before normalization.
///
/// Bridges are loose about numeric types, so every numeric column accepts numbers or
/// numeric strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    /// Open time, seconds since the Unix epoch.
    pub time: i64,
    #[serde(deserialize_with = "deserialize_f64_lenient")]
    pub open: f64,
    #[serde(deserialize_with = "deserialize_f64_lenient")]
    pub high: f64,
    #[serde(deserialize_with = "deserialize_f64_lenient")]
    pub low: f64,
    #[serde(deserialize_with = "deserialize_f64_lenient")]
    pub close: f64,
    #[serde(deserialize_with = "deserialize_f64_lenient")]
    pub tick_volume: f64,
    #[serde(deserialize_with = "deserialize_f64_lenient")]
    pub spread: f64,
    #[serde(deserialize_with = "deserialize_f64_lenient", default)]
    pub real_volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    #[serde(deserialize_with = "deserialize_f64_lenient")]
    pub tick_size: f64,
    #[serde(deserialize_with = "deserialize_f64_lenient")]
    pub tick_value: f64,
}

struct LenientF64Visitor;

impl<'de> Visitor<'de> for LenientF64Visitor {
    type Value = f64;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a float, an integer, or a string representing a number")
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
        Ok(v)
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
        Ok(v as f64)
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
        Ok(v as f64)
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        v.trim().parse::<f64>().map_err(E::custom)
    }
}

fn deserialize_f64_lenient<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(LenientF64Visitor)
}

/// Operations the pipeline needs from a terminal session.
#[async_trait]
pub trait MarketTerminal: Send {
    async fn connect(&mut self, request: &LoginRequest<'_>) -> Result<(), TerminalError>;

    async fn list_symbols(&mut self) -> Result<Vec<String>, TerminalError>;

    /// Adds the symbol to the terminal's market watch. Idempotent.
    async fn select_symbol(&mut self, symbol: &str) -> Result<(), TerminalError>;

    /// `Ok(None)` mirrors the terminal returning nothing at all for the request.
    async fn fetch_bars(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Option<Vec<RawBar>>, TerminalError>;

    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo, TerminalError>;

    async fn account_balance(&mut self) -> Result<f64, TerminalError>;

    /// Best effort; must be safe to call without an active session.
    async fn disconnect(&mut self);
}

/// Produces fresh terminal handles, one per worker.
pub trait TerminalFactory: Send + Sync {
    fn create(&self) -> Box<dyn MarketTerminal>;
}

// HTTP BRIDGE

#[derive(Serialize)]
struct ConnectBody<'a> {
    path: String,
    login: u64,
    password: &'a str,
    server: &'a str,
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct BalanceBody {
    #[serde(deserialize_with = "deserialize_f64_lenient")]
    balance: f64,
}

pub struct HttpTerminal {
    client: Client,
    base_url: String,
    connected: bool,
}

impl HttpTerminal {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            connected: false,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}/{path}")
    }

    /// `symbols/<symbol>/<action>`, with the symbol encoded as a single path segment.
    fn symbol_endpoint(&self, symbol: &str, action: &str) -> Result<Url, TerminalError> {
        let invalid = || TerminalError::Transport(format!("invalid bridge url {}", self.base_url));
        let mut url = Url::parse(&self.endpoint("symbols")).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .push(symbol)
            .push(action);
        Ok(url)
    }

    fn ensure_connected(&self) -> Result<(), TerminalError> {
        if self.connected {
            Ok(())
        } else {
            Err(TerminalError::NotConnected)
        }
    }
}

#[async_trait]
impl MarketTerminal for HttpTerminal {
    async fn connect(&mut self, request: &LoginRequest<'_>) -> Result<(), TerminalError> {
        let body = ConnectBody {
            path: request.terminal_path.display().to_string(),
            login: request.login,
            password: request.password,
            server: request.server,
            timeout_ms: request.timeout.as_millis().min(u64::MAX as u128) as u64,
        };

        let response = self
            .client
            .post(self.endpoint("connect"))
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                self.connected = true;
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(TerminalError::MissingExecutable(body.path)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let text = response.text().await.unwrap_or_default();
                Err(TerminalError::LoginRejected(format!(
                    "login {} on {}: {}",
                    request.login, request.server, text
                )))
            }
            status => Err(TerminalError::Transport(format!(
                "connect returned {status}"
            ))),
        }
    }

    async fn list_symbols(&mut self) -> Result<Vec<String>, TerminalError> {
        self.ensure_connected()?;
        let symbols = self
            .client
            .get(self.endpoint("symbols"))
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<String>>()
            .await?;
        Ok(symbols)
    }

    async fn select_symbol(&mut self, symbol: &str) -> Result<(), TerminalError> {
        self.ensure_connected()?;
        let response = self
            .client
            .post(self.symbol_endpoint(symbol, "select")?)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TerminalError::SymbolUnavailable(symbol.to_string()))
        }
    }

    async fn fetch_bars(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Option<Vec<RawBar>>, TerminalError> {
        self.ensure_connected()?;
        let response = self
            .client
            .get(self.endpoint("bars"))
            .query(&[
                ("symbol", symbol.to_string()),
                ("timeframe", timeframe.as_str().to_string()),
                ("count", count.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let bytes = response.bytes().await?;
        let bars: Option<Vec<RawBar>> = serde_json::from_slice(&bytes)?;
        debug!(symbol, %timeframe, returned = bars.as_ref().map(Vec::len), "bars fetched");
        Ok(bars)
    }

    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo, TerminalError> {
        self.ensure_connected()?;
        let info = self
            .client
            .get(self.symbol_endpoint(symbol, "info")?)
            .send()
            .await?
            .error_for_status()?
            .json::<SymbolInfo>()
            .await?;
        Ok(info)
    }

    async fn account_balance(&mut self) -> Result<f64, TerminalError> {
        self.ensure_connected()?;
        let body = self
            .client
            .get(self.endpoint("account"))
            .send()
            .await?
            .error_for_status()?
            .json::<BalanceBody>()
            .await?;
        Ok(body.balance)
    }

    async fn disconnect(&mut self) {
        // Also sent after a failed connect: the bridge may have started the terminal.
        self.connected = false;
        if let Err(e) = self.client.post(self.endpoint("disconnect")).send().await {
            debug!(error = %e, "disconnect request failed");
        }
    }
}

pub struct HttpTerminalFactory {
    client: Client,
    base_url: String,
}

impl HttpTerminalFactory {
    pub fn new(base_url: impl Into<String>) -> reqwest::Result<Self> {
        let client = Client::builder().pool_max_idle_per_host(8).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

impl TerminalFactory for HttpTerminalFactory {
    fn create(&self) -> Box<dyn MarketTerminal> {
        Box::new(HttpTerminal::new(self.client.clone(), self.base_url.clone()))
    }
}
