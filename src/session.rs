use crate::config::BrokerSettings;
use crate::error::{PipelineError, TerminalError};
use crate::terminal::{LoginRequest, MarketTerminal};
use std::time::Duration;
use tracing::{debug, warn};

/// Exclusive lease on one terminal login.
///
/// The terminal accepts a single authenticated session per process, so each gate owns exactly
/// one terminal handle and refuses to open a second session while one is live. Callers pair
/// every [`acquire`](Self::acquire) with [`release`](Self::release) on all paths, including
/// after failures.
pub struct SessionGate {
    terminal: Box<dyn MarketTerminal>,
    active: Option<String>,
    connect_timeout: Duration,
}

impl SessionGate {
    pub fn new(terminal: Box<dyn MarketTerminal>, connect_timeout: Duration) -> Self {
        Self {
            terminal,
            active: None,
            connect_timeout,
        }
    }

    /// Identity of the broker holding the session, if any.
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Logs into `settings` on behalf of `identity` and hands out the terminal.
    pub async fn acquire(
        &mut self,
        identity: &str,
        settings: &BrokerSettings,
    ) -> Result<&mut dyn MarketTerminal, PipelineError> {
        if let Some(holder) = &self.active {
            return Err(PipelineError::Connection(format!(
                "session already held by {holder}, cannot open one for {identity}"
            )));
        }

        let request = LoginRequest {
            terminal_path: &settings.terminal_path,
            login: settings.login,
            password: &settings.password,
            server: &settings.server,
            timeout: self.connect_timeout,
        };

        if let Err(e) = self.terminal.connect(&request).await {
            // A half-initialised terminal still needs shutting down.
            self.terminal.disconnect().await;
            return Err(connection_error(identity, e));
        }

        debug!(broker = identity, login = settings.login, "session acquired");
        self.active = Some(identity.to_string());
        Ok(self.terminal.as_mut())
    }

    /// Ends the current session. Safe to call when nothing is held.
    pub async fn release(&mut self) {
        if let Some(holder) = self.active.take() {
            debug!(broker = %holder, "session released");
        }
        self.terminal.disconnect().await;
    }

    /// Final unconditional release used by the top-level guard.
    pub async fn force_release(&mut self) {
        if let Some(holder) = self.active() {
            warn!(broker = %holder, "session still held at shutdown, releasing");
        }
        self.release().await;
    }
}

fn connection_error(identity: &str, err: TerminalError) -> PipelineError {
    PipelineError::Connection(format!("{identity}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::scripted::ScriptedTerminal;
    use std::path::PathBuf;

    fn settings(login: u64) -> BrokerSettings {
        BrokerSettings {
            terminal_path: PathBuf::from("/opt/terminal64.exe"),
            login,
            password: "secret".to_string(),
            server: "Demo".to_string(),
            base_folder: PathBuf::from("/tmp/unused"),
        }
    }

    #[tokio::test]
    async fn acquire_then_release() {
        let terminal = ScriptedTerminal::new();
        terminal.account(7, 10.0, &["EURUSD"]);
        let mut gate = SessionGate::new(Box::new(terminal.clone()), Duration::from_secs(1));

        let session = gate.acquire("deriv1", &settings(7)).await.unwrap();
        assert_eq!(session.list_symbols().await.unwrap(), vec!["EURUSD"]);
        assert_eq!(gate.active(), Some("deriv1"));

        gate.release().await;
        assert_eq!(gate.active(), None);
        assert_eq!(terminal.calls(), vec!["connect:7", "disconnect"]);
    }

    #[tokio::test]
    async fn second_acquire_is_refused_while_held() {
        let terminal = ScriptedTerminal::new();
        terminal.account(7, 10.0, &[]).account(8, 10.0, &[]);
        let mut gate = SessionGate::new(Box::new(terminal.clone()), Duration::from_secs(1));

        gate.acquire("a", &settings(7)).await.unwrap();
        let err = gate.acquire("b", &settings(8)).await.err().unwrap();
        assert!(err.is_connection());
        assert_eq!(gate.active(), Some("a"));
    }

    #[tokio::test]
    async fn login_failures_are_typed_and_leave_gate_free() {
        let terminal = ScriptedTerminal::new();
        terminal.reject(9);
        let mut gate = SessionGate::new(Box::new(terminal.clone()), Duration::from_secs(1));

        let rejected = gate.acquire("x", &settings(9)).await.err().unwrap();
        assert!(rejected.to_string().contains("login rejected"));

        let missing = gate.acquire("y", &settings(404)).await.err().unwrap();
        assert!(missing.to_string().contains("not found"));

        assert_eq!(gate.active(), None);
        assert_eq!(
            terminal.calls(),
            vec!["connect:9", "disconnect", "connect:404", "disconnect"]
        );
    }
}
