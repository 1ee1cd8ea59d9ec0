//! Console surface
//!
//! Reads one message per line from stdin and prints replies to stdout.
//! Used by `pocketclaw chat`.

use async_trait::async_trait;
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::transport::{FormattingHints, RawEvent, TransportAdapter};

/// User id assigned to the local console user
pub const CONSOLE_USER: &str = "local";

/// Interactive stdin/stdout surface
pub struct ConsoleTransport {
    surface_id: String,
    lines: Mutex<Lines<BufReader<Stdin>>>,
    on_eof: Option<CancellationToken>,
}

impl ConsoleTransport {
    /// Create the console surface
    pub fn new(surface_id: &str) -> Self {
        Self {
            surface_id: surface_id.to_string(),
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
            on_eof: None,
        }
    }

    /// Cancel `token` when stdin reaches end of file
    pub fn with_shutdown_on_eof(mut self, token: CancellationToken) -> Self {
        self.on_eof = Some(token);
        self
    }

    fn prompt() {
        eprint!("{} ", "you>".green().bold());
    }
}

#[async_trait]
impl TransportAdapter for ConsoleTransport {
    fn surface_id(&self) -> &str {
        &self.surface_id
    }

    async fn connect(&self) -> Result<()> {
        Self::prompt();
        Ok(())
    }

    async fn receive_next(&self) -> Result<Option<RawEvent>> {
        let mut lines = self.lines.lock().await;
        loop {
            match lines.next_line().await? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        Self::prompt();
                        continue;
                    }
                    return Ok(Some(RawEvent::text(CONSOLE_USER, line)));
                }
                None => {
                    if let Some(token) = &self.on_eof {
                        token.cancel();
                    }
                    // stdin stays closed; park until the runtime stops this worker
                    futures::future::pending::<()>().await;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&self, _user_id: &str, text: &str, _hints: &FormattingHints) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        let rendered = format!("{} {}\n", "assistant>".cyan().bold(), text);
        stdout.write_all(rendered.as_bytes()).await?;
        stdout.flush().await?;
        Self::prompt();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        eprintln!();
        Ok(())
    }
}
