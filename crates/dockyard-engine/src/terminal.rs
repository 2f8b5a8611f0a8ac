//! Interactive terminal multiplexing: one shell process per
//! (connection, tab) pair, output pumped asynchronously to the owning
//! connection's event channel.
//!
//! Sessions are created lazily on the first input for a key and torn down
//! on connection disconnect, or when an input attempt discovers a dead
//! stream. The registry is the only state shared across sessions; each
//! Active session has exactly one reader task that suspends on stream
//! readiness and exits when the stream ends or the receiver goes away.

use std::pin::Pin;
use std::sync::Arc;

use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use dashmap::DashMap;
use dockyard_common::{Error, Result};
use futures::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::files::home_dir;
use crate::manager::{engine_error, summary_id, SandboxManager};

/// Identifies one terminal: the owning connection plus the browser tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub connection: String,
    pub tab: String,
}

/// Events delivered on a connection's outbound channel. Stream failures
/// ride the same channel as output, tagged with the tab they belong to,
/// because the input calls that trigger them are fire-and-forget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEvent {
    Output { tab: String, data: String },
    Error { tab: String, message: String },
}

type ShellOutput = Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, BollardError>> + Send>>;
type ShellInput = Pin<Box<dyn AsyncWrite + Send>>;

struct TerminalSession {
    input: Mutex<ShellInput>,
    reader: JoinHandle<()>,
}

pub struct TerminalMultiplexer {
    manager: Arc<SandboxManager>,
    connections: DashMap<String, UnboundedSender<TerminalEvent>>,
    sessions: DashMap<SessionKey, Arc<TerminalSession>>,
}

impl TerminalMultiplexer {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self {
            manager,
            connections: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Installs the outbound event channel for a connection and returns
    /// its receiving half. Registering the same id again replaces the
    /// previous sender; sessions keyed under it keep running.
    pub fn register_connection(&self, connection: &str) -> UnboundedReceiver<TerminalEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(connection.to_string(), tx);
        debug!(%connection, "registered terminal connection");
        rx
    }

    /// Routes keystrokes to the session for (connection, tab), creating it
    /// on first use. Session-level failures (container missing, dead
    /// stream) are emitted as [`TerminalEvent::Error`] on the tab channel
    /// rather than returned; only an unregistered connection is an `Err`.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn send_input(
        &self,
        connection: &str,
        tab: &str,
        user: &str,
        logical_name: &str,
        bytes: &[u8],
    ) -> Result<()> {
        let events = self
            .connections
            .get(connection)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Stream(format!("connection '{connection}' is not registered")))?;

        let key = SessionKey {
            connection: connection.to_string(),
            tab: tab.to_string(),
        };
        let session = match self.sessions.get(&key).map(|entry| entry.value().clone()) {
            Some(session) => session,
            None => {
                match self.open_session(&key, user, logical_name, events.clone()).await {
                    Ok(session) => session,
                    Err(err) => {
                        warn!(%connection, %tab, error = %err, "terminal session setup failed");
                        let _ = events.send(TerminalEvent::Error {
                            tab: tab.to_string(),
                            message: err.to_string(),
                        });
                        return Ok(());
                    }
                }
            }
        };

        let mut input = session.input.lock().await;
        let write = async {
            input.write_all(bytes).await?;
            input.flush().await
        }
        .await;
        drop(input);

        if let Err(err) = write {
            warn!(%connection, %tab, error = %err, "terminal write failed, closing session");
            self.close_session(&key);
            let _ = events.send(TerminalEvent::Error {
                tab: tab.to_string(),
                message: format!("terminal write failed: {err}"),
            });
        }
        Ok(())
    }

    /// Allocates the in-container shell and wires its output stream to the
    /// connection's channel.
    async fn open_session(
        &self,
        key: &SessionKey,
        user: &str,
        logical_name: &str,
        events: UnboundedSender<TerminalEvent>,
    ) -> Result<Arc<TerminalSession>> {
        let summary = self.manager.resolve(user, logical_name).await?;
        let container_id = summary_id(&summary)?;

        let exec = self
            .manager
            .docker
            .create_exec(
                container_id,
                CreateExecOptions::<String> {
                    cmd: Some(vec![self.manager.settings.shell.clone()]),
                    user: Some(user.to_string()),
                    working_dir: Some(home_dir(user)),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(engine_error)?;

        let (output, input) = match self
            .manager
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(engine_error)?
        {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(Error::Stream("terminal exec started detached".to_string()))
            }
        };

        let reader = tokio::spawn(pump_output(output, events, key.tab.clone()));
        let session = Arc::new(TerminalSession {
            input: Mutex::new(input),
            reader,
        });
        self.sessions.insert(key.clone(), session.clone());
        info!(
            connection = %key.connection,
            tab = %key.tab,
            container = %container_id,
            %user,
            "opened terminal session"
        );
        Ok(session)
    }

    /// Tears down every session owned by the connection and forgets its
    /// event channel. Safe to call for unknown or already-disconnected ids.
    pub fn disconnect(&self, connection: &str) {
        self.connections.remove(connection);
        let keys: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().connection == connection)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            self.close_session(key);
        }
        if !keys.is_empty() {
            info!(%connection, sessions = keys.len(), "purged terminal sessions on disconnect");
        }
    }

    /// Unregisters the session and cancels its reader. Dropping the last
    /// handle closes the stream's write half. Idempotent.
    fn close_session(&self, key: &SessionKey) {
        if let Some((_, session)) = self.sessions.remove(key) {
            session.reader.abort();
            debug!(connection = %key.connection, tab = %key.tab, "closed terminal session");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, connection: &str, tab: &str) -> bool {
        self.sessions.contains_key(&SessionKey {
            connection: connection.to_string(),
            tab: tab.to_string(),
        })
    }
}

/// Forwards shell output to the connection channel until the stream ends,
/// errors, or the receiver is dropped. Output order per tab follows the
/// backing process; undecodable bytes are replaced, never fatal.
async fn pump_output(mut output: ShellOutput, events: UnboundedSender<TerminalEvent>, tab: String) {
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(log) => {
                let data = String::from_utf8_lossy(&log.into_bytes()).into_owned();
                if events
                    .send(TerminalEvent::Output {
                        tab: tab.clone(),
                        data,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => {
                warn!(%tab, error = %err, "terminal stream error");
                let _ = events.send(TerminalEvent::Error {
                    tab: tab.clone(),
                    message: format!("terminal stream error: {err}"),
                });
                break;
            }
        }
    }
    debug!(%tab, "terminal stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_tagged_with_tab() {
        let event = TerminalEvent::Output {
            tab: "T1".to_string(),
            data: "ls\r\n".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"output""#));
        assert!(json.contains(r#""tab":"T1""#));

        let event = TerminalEvent::Error {
            tab: "T1".to_string(),
            message: "no container named 'dev' for user alice".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"error""#));
    }

    #[test]
    fn keys_compare_by_connection_and_tab() {
        let a = SessionKey {
            connection: "C1".to_string(),
            tab: "T1".to_string(),
        };
        let b = SessionKey {
            connection: "C1".to_string(),
            tab: "T2".to_string(),
        };
        let c = SessionKey {
            connection: "C2".to_string(),
            tab: "T1".to_string(),
        };
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(
            a,
            SessionKey {
                connection: "C1".to_string(),
                tab: "T1".to_string(),
            }
        );
    }
}
