//! Command handlers: build a session from the global options, run one
//! interaction, tear down.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use shellgate_core::{
    Requisition, RequisitionHub, RequisitionKind, SessionConfig, ShellSession,
};

use crate::cli::{ExecArgs, GlobalOpts};
use crate::error::CliError;

// ── Session setup ────────────────────────────────────────────────────

fn build_config(global: &GlobalOpts) -> Result<SessionConfig, CliError> {
    let url: Url = global.url.parse()?;

    let mut config = SessionConfig::new(url).with_request_timeout(if global.timeout == 0 {
        None
    } else {
        Some(Duration::from_secs(global.timeout))
    });

    if let (Some(user), Some(password)) = (&global.user, &global.password) {
        config = config.with_credentials(user.clone(), SecretString::from(password.clone()));
    }

    Ok(config)
}

/// Connect and wait for the socket to come up, bounded by
/// `--connect-timeout`.
async fn connect(global: &GlobalOpts) -> Result<(ShellSession, Arc<RequisitionHub>), CliError> {
    let hub = Arc::new(RequisitionHub::new());
    let session = ShellSession::new(build_config(global)?, Arc::clone(&hub));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let registration = hub.register(RequisitionKind::SocketStateChanged, move |r| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Requisition::SocketStateChanged(true) = r {
                let _ = tx.send(());
            }
            Ok(false)
        })
    });

    session.connect().await?;

    let deadline = Duration::from_secs(global.connect_timeout);
    let up = session.is_connected().await
        || tokio::time::timeout(deadline, rx.recv()).await.is_ok();
    hub.unregister(registration);

    if !up {
        session.shutdown().await;
        return Err(CliError::ConnectTimeout);
    }

    Ok((session, hub))
}

fn print_value(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}

// ── exec ─────────────────────────────────────────────────────────────

pub async fn exec(global: &GlobalOpts, args: ExecArgs) -> Result<(), CliError> {
    let command_args: Value = serde_json::from_str(&args.args).map_err(CliError::Args)?;

    let (session, _hub) = connect(global).await?;
    let result = run_exec(&session, &args.command, command_args).await;
    session.shutdown().await;
    result
}

async fn run_exec(
    session: &ShellSession,
    command: &str,
    args: Value,
) -> Result<(), CliError> {
    let mut reply = session.submit(command, args).await?;
    tracing::debug!(request_id = reply.request_id(), command, "request sent");

    // Stream partial payloads as they arrive, then the terminal one.
    while let Some(response) = reply.next_pending().await {
        if let Some(result) = response.result {
            print_value(&result);
        }
    }

    let done = reply.wait().await.map_err(shellgate_core::CoreError::Api)?;
    if let Some(result) = done.result {
        print_value(&result);
    }
    if !done.request_state.msg.is_empty() {
        eprintln!("{}", done.request_state.msg);
    }
    Ok(())
}

// ── listen ───────────────────────────────────────────────────────────

pub async fn listen(global: &GlobalOpts) -> Result<(), CliError> {
    let (session, hub) = connect(global).await?;

    for kind in [
        RequisitionKind::SocketStateChanged,
        RequisitionKind::WebSessionStarted,
        RequisitionKind::ShowInfo,
        RequisitionKind::ShowWarning,
        RequisitionKind::ShowError,
        RequisitionKind::Message,
    ] {
        hub.register(kind, |r| {
            Box::pin(async move {
                match serde_json::to_string(&r) {
                    Ok(text) => println!("{text}"),
                    Err(e) => tracing::warn!(error = %e, "unprintable requisition"),
                }
                Ok(false)
            })
        });
    }

    eprintln!("listening, press Ctrl-C to stop");
    let _ = tokio::signal::ctrl_c().await;

    session.shutdown().await;
    Ok(())
}

// ── info ─────────────────────────────────────────────────────────────

pub async fn info(global: &GlobalOpts) -> Result<(), CliError> {
    let (session, hub) = connect(global).await?;
    let result = run_info(global, &session, &hub).await;
    session.shutdown().await;
    result
}

async fn run_info(
    global: &GlobalOpts,
    session: &ShellSession,
    hub: &Arc<RequisitionHub>,
) -> Result<(), CliError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let registration = hub.register(RequisitionKind::WebSessionStarted, move |r| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Requisition::WebSessionStarted(data) = r {
                let _ = tx.send(data);
            }
            Ok(true)
        })
    });

    let announcement = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await;
    hub.unregister(registration);

    let Ok(Some(data)) = announcement else {
        return Err(CliError::SessionTimeout);
    };

    println!("session uuid:    {}", data.session_uuid.as_deref().unwrap_or("-"));
    println!("local user mode: {}", data.local_user_mode);

    if let Some(user) = &global.user {
        let value = session
            .execute(
                "gui.users.get_user_id",
                serde_json::json!({ "username": user }),
            )
            .await?;
        println!("user id:         {value}");
    }

    Ok(())
}
