//! PTY plumbing for the remote shell.
//!
//! `connect_shell` forks an interactive shell onto a fresh
//! pseudo-terminal. Bytes read from the master side are framed as
//! `pty_output` notifications to the peer that opened the shell; incoming
//! `pty_input` frames are written back to the master.

use crate::rpc::jsonrpc::{serialize_request, Request};
use serde_json::json;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::{Child, Command, Stdio};
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, watch};
use tracing::debug;

pub struct PtySession {
    master: AsyncFd<OwnedFd>,
    child: Child,
}

/// Fork the default interactive shell onto a new PTY. The child becomes a
/// session leader so job control inside the shell behaves.
pub fn spawn_shell() -> io::Result<PtySession> {
    let pty = nix::pty::openpty(None::<&nix::pty::Winsize>, None::<&nix::sys::termios::Termios>)
        .map_err(io::Error::from)?;

    set_nonblocking(&pty.master)?;

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let mut command = Command::new(shell);
    command
        .stdin(Stdio::from(pty.slave.try_clone()?))
        .stdout(Stdio::from(pty.slave.try_clone()?))
        .stderr(Stdio::from(pty.slave));

    unsafe {
        use std::os::unix::process::CommandExt;
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(io::Error::from)?;
            Ok(())
        });
    }

    let child = command.spawn()?;
    Ok(PtySession {
        master: AsyncFd::new(pty.master)?,
        child,
    })
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

impl PtySession {
    pub fn child_pid(&self) -> u32 {
        self.child.id()
    }

    async fn read_output(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.master.readable().await?;
            match guard.try_io(|inner| {
                nix::unistd::read(inner.get_ref().as_raw_fd(), buf).map_err(io::Error::from)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_input(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.master.writable().await?;
            match guard.try_io(|inner| {
                nix::unistd::write(inner.get_ref().as_raw_fd(), data).map_err(io::Error::from)
            }) {
                Ok(written) => data = &data[written?..],
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

/// Forward bytes between the PTY and the connection until the shell exits
/// or the peer detaches (input channel closed). Reports completion on
/// `finished`.
pub async fn pump(
    mut session: PtySession,
    outbound: mpsc::Sender<Vec<u8>>,
    mut input: mpsc::Receiver<Vec<u8>>,
    finished: watch::Sender<bool>,
) {
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            read = session.read_output(&mut buf) => match read {
                // EIO is the usual way a closed PTY reports the child exit.
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = serialize_request(&Request::notification(
                        "pty_output",
                        json!({"data": hex::encode(&buf[..n])}),
                    ));
                    if outbound.send(frame).await.is_err() {
                        break;
                    }
                }
            },
            data = input.recv() => match data {
                None => break,
                Some(bytes) => {
                    if session.write_input(&bytes).await.is_err() {
                        break;
                    }
                }
            },
        }
    }

    debug!(pid = session.child_pid(), "shell session ended");
    let _ = session.child.kill();
    let _ = session.child.wait();
    let _ = finished.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shell_echoes_through_the_pty() {
        let session = match spawn_shell() {
            Ok(session) => session,
            // Sandboxed test environments may forbid PTY allocation.
            Err(_) => return,
        };

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let (fin_tx, mut fin_rx) = watch::channel(false);

        let pump_task = tokio::spawn(pump(session, out_tx, in_rx, fin_tx));

        in_tx.send(b"echo pty-roundtrip\n".to_vec()).await.unwrap();

        let mut seen = String::new();
        let deadline = tokio::time::sleep(Duration::from_secs(5));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
                    let data = value["params"]["data"].as_str().unwrap_or_default();
                    seen.push_str(&String::from_utf8_lossy(&hex::decode(data).unwrap()));
                    if seen.contains("pty-roundtrip") {
                        break;
                    }
                }
                _ = &mut deadline => break,
            }
        }
        assert!(seen.contains("pty-roundtrip"), "shell output: {seen}");

        in_tx.send(b"exit\n".to_vec()).await.unwrap();
        drop(in_tx);
        let _ = tokio::time::timeout(Duration::from_secs(5), fin_rx.changed()).await;
        pump_task.abort();
    }
}
