//! Interactive shell on the final hop of a chain.

use std::io::{IsTerminal, Read};

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Pty};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chain::ChainSession;
use crate::error::{Error, Result};

const TERMINAL_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 1),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Puts the local terminal into raw mode and restores it on drop, so every
/// exit path (including errors and panics unwinding through the session)
/// leaves the terminal usable.
struct RawModeGuard;

impl RawModeGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode().map_err(|e| Error::Session(format!("failed to enable raw mode: {e}")))?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            warn!("Failed to restore terminal: {}", e);
        }
    }
}

/// Terminal resize notifications. Only delivered when a PTY was
/// negotiated, and only on unix.
struct ResizeEvents {
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl ResizeEvents {
    fn new(enabled: bool) -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let signal = if enabled {
                signal(SignalKind::window_change())
                    .inspect_err(|e| debug!("Cannot watch window size: {}", e))
                    .ok()
            } else {
                None
            };
            Self { signal }
        }
        #[cfg(not(unix))]
        {
            let _ = enabled;
            Self {}
        }
    }

    fn disabled() -> Self {
        Self::new(false)
    }

    /// Resolves on the next resize. Never resolves when disabled.
    async fn next(&mut self) {
        #[cfg(unix)]
        {
            if let Some(signal) = self.signal.as_mut() {
                if signal.recv().await.is_some() {
                    return;
                }
                self.signal = None;
            }
        }
        std::future::pending::<()>().await
    }
}

/// Open a shell on the final hop and attach it to this process's stdio.
/// Blocks until the remote side closes the channel and returns the remote
/// exit status (0 when none was sent).
pub async fn run_shell(chain: &ChainSession, term: &str) -> Result<u32> {
    let mut channel = chain
        .handle()
        .channel_open_session()
        .await
        .map_err(session_error("open session channel"))?;

    let interactive = std::io::stdin().is_terminal();
    let _raw_mode = if interactive {
        let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
        debug!("Requesting {} pty ({}x{})", term, cols, rows);
        channel
            .request_pty(
                false,
                term,
                u32::from(cols),
                u32::from(rows),
                0,
                0,
                TERMINAL_MODES,
            )
            .await
            .map_err(session_error("request pty"))?;
        Some(RawModeGuard::enter()?)
    } else {
        debug!("stdin is not a terminal, skipping pty");
        None
    };

    channel
        .request_shell(false)
        .await
        .map_err(session_error("start shell"))?;

    let input = spawn_stdin_reader();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut resize = ResizeEvents::new(interactive);

    pump(&mut channel, input, &mut stdout, &mut stderr, &mut resize).await
}

/// Read stdin on a plain thread. A blocking read on tokio's stdin would
/// keep the runtime alive after the shell exits.
fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(32);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 8192];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    rx
}

async fn pump<O, E>(
    channel: &mut Channel<Msg>,
    mut input: mpsc::Receiver<Vec<u8>>,
    stdout: &mut O,
    stderr: &mut E,
    resize: &mut ResizeEvents,
) -> Result<u32>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut input_open = true;
    let mut exit_status = None;

    loop {
        tokio::select! {
            chunk = input.recv(), if input_open => match chunk {
                Some(bytes) => {
                    channel
                        .data(&bytes[..])
                        .await
                        .map_err(session_error("send input"))?;
                }
                None => {
                    input_open = false;
                    channel.eof().await.map_err(session_error("send eof"))?;
                }
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    stderr.write_all(&data).await?;
                    stderr.flush().await?;
                }
                Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                    debug!("Remote shell exited with status {}", status);
                    exit_status = Some(status);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    debug!("Remote shell killed by {:?}", signal_name);
                    exit_status.get_or_insert(255);
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            _ = resize.next() => {
                if let Ok((cols, rows)) = crossterm::terminal::size() {
                    let _ = channel
                        .window_change(u32::from(cols), u32::from(rows), 0, 0)
                        .await;
                }
            }
        }
    }

    Ok(exit_status.unwrap_or(0))
}

fn session_error(stage: &'static str) -> impl Fn(russh::Error) -> Error {
    move |e| Error::Session(format!("failed to {stage}: {e}"))
}
