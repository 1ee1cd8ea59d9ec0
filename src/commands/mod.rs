/*!
Command handlers for the CLI

This module provides the handlers invoked by the CLI entrypoint:

- `run`      - serve every configured surface
- `chat`     - local console conversation
- `ask`      - one-shot prompt against the inference chain
- `sessions` - stored session inspection
- `config_cmd` - configuration validation and display

Each handler builds only the components it needs from the library.
*/

use crate::agent::Runtime;
use crate::config::{Config, SurfaceKind};
use crate::error::Result;
use crate::providers::{GenerationParams, GenerationRequest, InferenceRouter};
use colored::Colorize;

pub mod config_cmd;
pub mod sessions;

// Serve command handler
pub mod run {
    //! Long-running service mode.
    //!
    //! Starts the full runtime over the configured surfaces and serves
    //! until interrupted.

    use super::*;

    /// Serve until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns an error if a runtime component cannot be constructed
    pub async fn run_service(config: Config) -> Result<()> {
        tracing::info!(
            surfaces = config.transport.surfaces.iter().filter(|s| s.enabled).count(),
            "Starting service mode"
        );
        let runtime = Runtime::builder(config).start()?;
        runtime.run().await;
        Ok(())
    }
}

// Chat command handler
pub mod chat {
    //! Interactive console conversation.
    //!
    //! Runs the same runtime as `run`, restricted to the console surface.
    //! End of input (Ctrl-D) or Ctrl-C ends the session.

    use super::*;

    /// Start interactive chat mode
    ///
    /// # Errors
    ///
    /// Returns an error if a runtime component cannot be constructed
    pub async fn run_chat(mut config: Config) -> Result<()> {
        config
            .transport
            .surfaces
            .retain(|surface| surface.kind == SurfaceKind::Console);
        config.transport.ensure_console();

        print_welcome_banner(&config);

        let runtime = Runtime::builder(config)
            .shutdown_on_console_eof(true)
            .start()?;
        runtime.run().await;
        Ok(())
    }

    fn print_welcome_banner(config: &Config) {
        eprintln!("{}", "Pocketclaw chat".bold());
        eprintln!(
            "  backends: {}",
            config.inference.chain().join(" -> ").cyan()
        );
        eprintln!("  {}", "Ctrl-D to exit".dimmed());
        eprintln!();
    }
}

// One-shot prompt handler
pub mod ask {
    //! Single prompt, no session.
    //!
    //! Useful for checking backend credentials and the fallback chain
    //! without starting any surface.

    use super::*;
    use futures::StreamExt;
    use std::io::Write;

    /// Send `prompt` through the inference chain and print the answer
    ///
    /// # Errors
    ///
    /// Returns an error if every backend fails
    pub async fn run_ask(config: Config, prompt: String, stream: bool) -> Result<()> {
        let router = InferenceRouter::from_config(&config.inference)?;
        let request = GenerationRequest {
            system_prompt: config.agent.system_prompt.clone(),
            params: GenerationParams {
                backend_preference: None,
                temperature: config.agent.temperature,
                max_output_tokens: config.agent.max_output_tokens,
            },
            ..GenerationRequest::new(prompt)
        };

        if stream {
            let mut fragments = router.stream(&request).await?;
            let mut stdout = std::io::stdout();
            while let Some(fragment) = fragments.next().await {
                write!(stdout, "{}", fragment?)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        } else {
            let result = router.generate(&request).await?;
            println!("{}", result.text);
            tracing::debug!(
                backend = %result.backend,
                output_units = result.usage.output_units,
                "Answer received"
            );
        }
        Ok(())
    }
}
