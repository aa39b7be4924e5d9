//! CLI command implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use torsession_core::{Circuit, LifecycleState, SessionOptions, TorProcess, TorSession};

fn build_options(
    data_dir: &str,
    tor_binary: &str,
    geoip: Option<&str>,
    geoip6: Option<&str>,
) -> SessionOptions {
    let base = PathBuf::from(data_dir);
    let mut options = SessionOptions::new(
        base.join("control"),
        base.join("tor"),
        Arc::new(TorProcess::with_program(tor_binary)),
    );
    options.geoip_file = geoip.map(PathBuf::from);
    options.geoip6_file = geoip6.map(PathBuf::from);
    options
}

/// Spawn a session, log bootstrap progress and state transitions, and
/// drive it to ready.
async fn start_session(options: SessionOptions) -> Result<TorSession> {
    let session = TorSession::spawn(options);

    let mut progress = session.subscribe_bootstrap();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let percent = *progress.borrow_and_update();
            info!(percent, "bootstrap");
        }
    });

    let mut states = session.subscribe_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            match state {
                LifecycleState::Starting => info!("launching tor"),
                LifecycleState::Authenticating => info!("authenticating control channel"),
                LifecycleState::Ready => info!("control channel ready"),
                LifecycleState::Failed(e) => info!(error = %e, "session failed"),
                LifecycleState::Idle => {}
            }
        }
    });

    session.start().await.context("tor session failed to start")?;
    Ok(session)
}

/// Run the daemon until interrupted.
pub async fn run(
    data_dir: &str,
    tor_binary: &str,
    geoip: Option<&str>,
    geoip6: Option<&str>,
) -> Result<()> {
    let session = start_session(build_options(data_dir, tor_binary, geoip, geoip6)).await?;

    if let Some(proxy) = session.proxy_config().await {
        println!("SOCKS proxy listening on {}:{}", proxy.host, proxy.port);
    }
    println!("Session running; press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for interrupt")?;
    println!("Interrupted; shutting down.");
    Ok(())
}

/// Print the SOCKS proxy configuration the daemon exposes.
pub async fn proxy(data_dir: &str, tor_binary: &str) -> Result<()> {
    let session = start_session(build_options(data_dir, tor_binary, None, None)).await?;

    match session.proxy_config().await {
        Some(proxy) => println!("{}:{}", proxy.host, proxy.port),
        None => println!("no SOCKS listener configured"),
    }
    Ok(())
}

/// Wait for connectivity and print a circuit snapshot.
pub async fn circuits(
    data_dir: &str,
    tor_binary: &str,
    geoip: Option<&str>,
    geoip6: Option<&str>,
) -> Result<()> {
    let session = start_session(build_options(data_dir, tor_binary, geoip, geoip6)).await?;

    let mut progress = session.subscribe_bootstrap();
    progress
        .wait_for(|p| *p == 100)
        .await
        .context("session ended before reaching connectivity")?;

    match session.circuits().await {
        Some(circuits) if !circuits.is_empty() => {
            for circuit in &circuits {
                print_circuit(circuit);
            }
        }
        Some(_) => println!("no circuits established"),
        None => println!("control channel unavailable"),
    }
    Ok(())
}

fn print_circuit(circuit: &Circuit) {
    println!(
        "Circuit {} [{}] purpose={}",
        field(&circuit.id),
        field(&circuit.status),
        field(&circuit.purpose),
    );
    if !circuit.build_flags.is_empty() {
        println!("  flags: {}", circuit.build_flags.join(","));
    }
    for node in &circuit.path {
        println!(
            "  {:19} {} {} {}",
            field(&node.nickname),
            field(&node.fingerprint),
            field(&node.ipv4),
            field(&node.country),
        );
    }
}

fn field(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("-")
}
