use std::time::Duration;

use tracing::debug;

use crate::codec;
use crate::error::ObdError;
use crate::pid::Pid;
use crate::transport::CommandLink;

/// Reference timeout for one command/response round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(3000);

/// Setup sequence every ELM327 client runs after connecting: reset, echo
/// off, linefeeds off, spaces off, protocol auto.
const INIT_SEQUENCE: [&str; 5] = ["ATZ", "ATE0", "ATL0", "ATS0", "ATSP0"];

const PROMPT: char = '>';

/// Executes one command at a time over a transport link.
///
/// Responses arrive as notification fragments; they are concatenated until
/// the `>` prompt appears, then handed back whole. `send_command` takes
/// `&mut self`, so a second request cannot be issued while one is
/// outstanding; callers that share a channel must serialize access.
pub struct CommandChannel<L> {
    link: L,
    buffer: String,
    timeout: Duration,
}

impl<L: CommandLink> CommandChannel<L> {
    pub fn new(link: L) -> Self {
        Self::with_timeout(link, DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn with_timeout(link: L, timeout: Duration) -> Self {
        Self {
            link,
            buffer: String::new(),
            timeout,
        }
    }

    /// Run the adapter init sequence, discarding the replies.
    pub async fn initialize(&mut self) -> Result<(), ObdError> {
        for command in INIT_SEQUENCE {
            let reply = self.send_command(command).await?;
            debug!(command, reply = reply.trim(), "adapter init");
        }
        Ok(())
    }

    /// Send one command and return the assembled response text.
    ///
    /// On timeout the reassembly buffer is cleared so the next call starts
    /// clean; a late fragment from the abandoned exchange is dropped with
    /// the buffer.
    pub async fn send_command(&mut self, command: &str) -> Result<String, ObdError> {
        self.buffer.clear();
        let framed = format!("{command}\r");
        self.link.write(framed.as_bytes()).await?;

        match tokio::time::timeout(
            self.timeout,
            Self::assemble(&mut self.link, &mut self.buffer),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.buffer.clear();
                Err(e)
            }
            Err(elapsed) => {
                self.buffer.clear();
                Err(ObdError::Timeout(elapsed))
            }
        }
    }

    async fn assemble(link: &mut L, buffer: &mut String) -> Result<String, ObdError> {
        loop {
            let fragment = link.next_fragment().await?;
            buffer.push_str(&String::from_utf8_lossy(&fragment));
            if buffer.contains(PROMPT) {
                return Ok(std::mem::take(buffer));
            }
        }
    }

    /// Read and decode one parameter. `Ok(None)` is the normal outcome for
    /// a no-data or malformed reply.
    pub async fn read_pid(&mut self, pid: Pid) -> Result<Option<f64>, ObdError> {
        let response = self.send_command(&pid.command()).await?;
        Ok(codec::decode(&response, pid))
    }

    /// Release the underlying link.
    pub fn into_link(self) -> L {
        self.link
    }
}
