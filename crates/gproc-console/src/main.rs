use anyhow::{bail, Context, Result};
use clap::Parser;
use gproc_console::{init_logging, load_config, Args, AuthError, Console};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args).context("invalid configuration")?;
    let _log_guard = init_logging(&config);
    info!(
        event = "console_start",
        backend = %config.backend_url,
        ws = %config.ws_url,
        state_dir = %config.state_dir.display()
    );

    let console = Console::new(config.clone());
    let resumed = console
        .resume()
        .await
        .context("reading persisted session")?;
    if !resumed {
        let Some(credentials) = config.login.as_ref() else {
            bail!("no saved session; pass --username and --password to sign in");
        };
        match console.login(credentials).await {
            Ok(session) => info!(event = "login", user = %session.user().username),
            Err(AuthError::MfaRequired) => {
                bail!("multi-factor code required; pass --mfa-code")
            }
            Err(err) => return Err(err).context("login failed"),
        }
    }

    let health = console.spawn_health_monitor();
    let mut ticker = tokio::time::interval(config.summary_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !console.session().is_authenticated() {
                    error!(event = "session_expired", "session ended; sign in again");
                    break;
                }
                print_summary(&console, health.current().healthy).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!(event = "console_stop");
                break;
            }
        }
    }

    drop(health);
    console.shutdown().await;
    Ok(())
}

async fn print_summary(console: &Console, healthy: bool) {
    let state = console.sync().state();
    let (has_processes, metrics, alerts, log_keys) = console
        .sync()
        .with_buffers(|buffers| {
            (
                buffers.processes().is_some(),
                buffers.metrics().len(),
                buffers.alerts().len(),
                buffers.log_keys().map(str::to_string).collect::<Vec<_>>(),
            )
        })
        .await;
    info!(
        event = "summary",
        state = %state,
        backend_healthy = healthy,
        processes = has_processes,
        metrics,
        alerts,
        logs = %log_keys.join(",")
    );
}
