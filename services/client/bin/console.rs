//! Main Entrypoint for the Therapy Simulator Console
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and command line.
//! 2. Building the HTTP gateway and spawning the session orchestrator.
//! 3. Resuming the active session, or initializing a new one.
//! 4. Relaying operator input to the orchestrator and printing its events.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use therapy_sim_client::{
    config::Config,
    credentials::StaticTokenProvider,
    error::OrchestratorError,
    gateway::ApiGateway,
    models::format_minutes,
    orchestrator::{OrchestratorHandle, SendDispatch, SessionOrchestrator},
    transport::ReqwestTransport,
};
use therapy_sim_core::{
    SessionEvent, protocol::ProtocolTemplate, snapshot::SessionSnapshot, transcript::Sender,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Terminal client for the therapy dialogue simulator.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Backend base URL. Overrides API_BASE_URL.
    #[arg(long)]
    api_url: Option<String>,
    /// Bearer token. Overrides API_TOKEN.
    #[arg(long)]
    token: Option<String>,
}

const HELP: &str = "Comandos: /estado, /checklist, /paciente, /estadisticas, /finalizar, /salir";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env_with_overrides(args.api_url, args.token)
        .context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(base_url = %config.api_base_url, "Configuration loaded");

    // --- 3. Build the Session Core ---
    let template = Arc::new(config.load_template()?);
    let transport = ReqwestTransport::new(&config.api_base_url, config.request_timeout)
        .context("Failed to build HTTP client")?;
    let gateway = ApiGateway::new(
        Arc::new(transport),
        Arc::new(StaticTokenProvider::new(config.api_token.clone())),
    );
    let (handle, mut events, orchestrator) = SessionOrchestrator::spawn(
        gateway.clone(),
        template.clone(),
        config.orchestrator_settings(),
    );

    // --- 4. Resume or Start a Session ---
    match handle.refresh_status().await? {
        Some(snapshot) => {
            println!(
                "Sesión {} en curso, quedan {} minutos.",
                snapshot.session_number.unwrap_or(1),
                snapshot.remaining_minutes
            );
        }
        None => {
            let initialized = handle
                .initialize()
                .await
                .context("Failed to initialize session")?;
            let patient = &initialized.patient;
            println!(
                "Paciente: {} ({} años), sesión {}.",
                patient.name,
                patient.age,
                patient.session_number.unwrap_or(1)
            );
        }
    }
    println!("{}", HELP);

    // --- 5. Relay Input and Events ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if !render_event(&event, &template) {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read input")? else {
                    break;
                };
                if !handle_input(line.trim(), &handle, &gateway, &template).await? {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt. Leaving the session open.");
                break;
            }
        }
    }

    handle.shutdown().await;
    if let Err(e) = orchestrator.await {
        warn!(error = %e, "Orchestrator task ended abnormally");
    }
    Ok(())
}

/// Handles one line of operator input. Returns `false` to leave.
async fn handle_input(
    input: &str,
    handle: &OrchestratorHandle,
    gateway: &ApiGateway,
    template: &ProtocolTemplate,
) -> anyhow::Result<bool> {
    match input {
        "" => {}
        "/salir" => return Ok(false),
        "/ayuda" => println!("{}", HELP),
        "/estado" => match handle.refresh_status().await? {
            Some(snapshot) => print_status(&snapshot),
            None => println!("No hay una sesión activa."),
        },
        "/checklist" => {
            let mut subscription = handle.subscribe().await?;
            match subscription.next().await.flatten() {
                Some(snapshot) => print_checklist(&snapshot, template),
                None => println!("No hay una sesión activa."),
            }
        }
        "/paciente" => match handle.patient_summary().await {
            Ok(patient) => println!("{} ({} años)", patient.name, patient.age),
            Err(OrchestratorError::Api(e)) => println!("{}", e.user_message()),
            Err(e) => return Err(e.into()),
        },
        "/estadisticas" => match gateway.fetch_statistics().await {
            Ok(stats) => {
                println!("Sesiones totales: {}", stats.total_sessions);
                println!(
                    "Checklists completados: {} ({}%)",
                    stats.sessions_with_checklist_completed,
                    stats.checklist_completion_percentage()
                );
                println!("Tiempo total: {}", format_minutes(stats.total_minutes));
                println!("Tiempo promedio: {}", format_minutes(stats.average_minutes));
            }
            Err(e) => println!("{}", e.user_message()),
        },
        "/finalizar" => {
            let result = handle.finalize().await?;
            match result.message {
                Some(message) => println!("{}", message),
                None => println!("Sesión finalizada."),
            }
            return Ok(false);
        }
        text => match handle.send(text).await {
            Ok(SendDispatch::Dispatched) => {}
            Ok(SendDispatch::Busy) => println!("Espera la respuesta del paciente."),
            Ok(SendDispatch::SessionEnded) => return Ok(false),
            Err(OrchestratorError::Api(e)) => println!("{}", e.user_message()),
            Err(e) => return Err(e.into()),
        },
    }
    Ok(true)
}

/// Prints an event. Returns `false` when the session is over for this
/// terminal.
fn render_event(event: &SessionEvent, template: &ProtocolTemplate) -> bool {
    match event {
        SessionEvent::MessageAppended(message) if message.sender == Sender::Counterpart => {
            println!("Paciente: {}", message.text);
        }
        SessionEvent::MessageAppended(_) => {}
        SessionEvent::ThresholdReached { minutes_remaining } => {
            println!("Quedan {} minutos de sesión.", minutes_remaining);
        }
        SessionEvent::ChecklistItemCompleted { id } => {
            println!("Objetivo cumplido: {}", template.resolve(id).label);
        }
        SessionEvent::SessionCompleted => {
            println!("Has completado todos los objetivos de la sesión.");
        }
        SessionEvent::SendFailed { message } => println!("No se pudo enviar: {}", message),
        SessionEvent::SessionExpired => {
            println!("El tiempo de la sesión ha terminado.");
            return false;
        }
        SessionEvent::AuthenticationRequired => {
            println!("Tu sesión ha expirado. Inicia sesión de nuevo.");
            return false;
        }
    }
    true
}

fn print_status(snapshot: &SessionSnapshot) {
    println!(
        "Tiempo transcurrido: {} min, restante: {} min.",
        snapshot.elapsed_minutes, snapshot.remaining_minutes
    );
    println!(
        "Checklist: {}/{} completado.",
        snapshot.checklist.completed_count(),
        snapshot.checklist.len()
    );
}

fn print_checklist(snapshot: &SessionSnapshot, template: &ProtocolTemplate) {
    for entry in template.entries(&snapshot.checklist) {
        let mark = if entry.completed { "x" } else { " " };
        println!("[{}] {}", mark, entry.label);
        if !entry.completed {
            for tip in &entry.tips {
                println!("      - {}", tip);
            }
        }
    }
    println!(
        "Progreso: {:.0}%",
        template.completion_percentage(&snapshot.checklist)
    );
}
