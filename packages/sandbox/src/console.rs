// ABOUTME: Interactive console driving one running session through the I/O bridge
// ABOUTME: Stops the sandbox when the transport closes, on normal return, and when dropped early

use futures::{Sink, Stream};
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bridge::{CloseHook, Frame, IoBridge, PumpStats};
use crate::error::{Result, SandboxError};
use crate::runtime::TerminalSize;
use crate::session::{stop_sandbox, Session, Teardown, TeardownGuard};

#[derive(Debug, Clone)]
pub struct ConsoleOptions {
    /// Applied before attaching
    pub size: Option<TerminalSize>,
    /// Start the stream with output produced before the attach
    pub replay_output: bool,
    /// How long remaining output may drain after the process exits
    pub drain_grace: Duration,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            size: None,
            replay_output: false,
            drain_grace: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleExit {
    pub exit_code: i64,
    /// Whether the transport side closed before the process ended
    pub transport_closed: bool,
    pub inbound: PumpStats,
    pub outbound: PumpStats,
}

/// A started session plus the guard that stops it
pub struct Console {
    session: Session,
    bridge: IoBridge,
    guard: Option<TeardownGuard>,
}

impl Console {
    /// Resolve and start `session`. From here on the sandbox is stopped when
    /// the console goes away, however that happens.
    pub async fn open(mut session: Session, bridge: IoBridge) -> Result<Self> {
        session
            .resolve()
            .await
            .map_err(|e| e.logged("Failed to resolve console session"))?;
        let guard = session.teardown_guard(Teardown::Stop);
        session
            .start()
            .await
            .map_err(|e| e.logged("Failed to start console session"))?;

        if let Some(id) = session.id() {
            info!("Console opened on sandbox {}", id);
        }
        Ok(Self {
            session,
            bridge,
            guard,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Bridge the session to a transport until the sandboxed process exits.
    ///
    /// A transport close from either direction schedules a stop without
    /// waiting for it; the stop that follows process exit runs regardless.
    pub async fn run<S, E, K>(
        mut self,
        inbound: S,
        outbound: K,
        options: ConsoleOptions,
    ) -> Result<ConsoleExit>
    where
        S: Stream<Item = std::result::Result<Frame, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
        K: Sink<Frame> + Send + Unpin + 'static,
        K::Error: Display + Send,
    {
        let id = self
            .session
            .id()
            .cloned()
            .ok_or_else(|| SandboxError::InvalidState("console without sandbox".to_string()))?;

        if let Some(size) = options.size {
            self.session.resize(size).await;
        }
        let stream = self
            .session
            .attach(options.replay_output)
            .await
            .map_err(|e| e.logged(format!("Failed to attach to sandbox {}", id)))?;

        let runtime = self.session.runtime().clone();
        let stop_id = id.clone();
        let handle = tokio::runtime::Handle::current();
        let on_close = CloseHook::new(move || {
            let runtime = runtime.clone();
            let id = stop_id.clone();
            debug!("Transport closed, stopping sandbox {}", id);
            handle.spawn(async move {
                if let Err(e) = stop_sandbox(runtime.as_ref(), &id).await {
                    warn!("Stop after transport close of {} failed: {}", id, e);
                }
            });
        });

        let pumps = self
            .bridge
            .spawn(stream, inbound, outbound, on_close.clone());

        let exit_code = self.session.wait().await;
        let stopped = self.session.stop().await;
        if stopped.is_ok() {
            if let Some(guard) = self.guard.take() {
                guard.disarm();
            }
        }
        let stats = pumps.shutdown(options.drain_grace).await;

        let exit_code =
            exit_code.map_err(|e| e.logged(format!("Waiting on sandbox {} failed", id)))?;
        stopped.map_err(|e| e.logged(format!("Stopping sandbox {} failed", id)))?;
        info!("Sandbox {} exited with code {}", id, exit_code);

        Ok(ConsoleExit {
            exit_code,
            transport_closed: on_close.has_fired(),
            inbound: stats.inbound,
            outbound: stats.outbound,
        })
    }
}
