//! Wallet Guardian CLI
//!
//! Runs one scan against live providers and prints each streamed event as it
//! arrives, or pre-simulates an approval revocation.
//!
//! Usage:
//!   guardian scan 0xabc... --chain-id 1
//!   guardian simulate --subject 0xabc... --target 0xdef... --key my-key

use clap::{Parser, Subcommand};
use eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};

use wallet_guardian::api::AppState;
use wallet_guardian::core::RiskLevel;
use wallet_guardian::models::{ActionType, GuardianConfig, RemediationCandidate, ScanEvent};
use wallet_guardian::utils::{parse_address, ScanTelemetry};

#[derive(Parser)]
#[command(name = "guardian")]
#[command(about = "Wallet risk scanner with simulate-before-propose remediation", long_about = None)]
#[command(version)]
struct Cli {
    /// Print raw JSON events instead of the summary view
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a wallet and stream probe results
    Scan {
        address: String,
        #[arg(long, default_value_t = 1, env = "GUARDIAN_CHAIN_ID")]
        chain_id: u64,
    },
    /// Pre-simulate revoking approvals on a token contract
    Simulate {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        target: String,
        #[arg(long)]
        spender: Option<String>,
        #[arg(long, default_value_t = 1, env = "GUARDIAN_CHAIN_ID")]
        chain_id: u64,
        /// Idempotency key; a fresh one is generated when omitted
        #[arg(long)]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    wallet_guardian::init_tracing();
    let cli = Cli::parse();

    let config = GuardianConfig::from_env()?;
    let telemetry = Arc::new(ScanTelemetry::new());
    let state = AppState::from_config(&config, telemetry.clone()).await?;

    match cli.command {
        Commands::Scan { address, chain_id } => {
            let subject = parse_address(&address)?;
            let request_id = uuid::Uuid::new_v4().to_string();
            info!("🔍 Scanning {} on chain {}", address, chain_id);

            let mut handle = state.orchestrator.start_scan(subject, chain_id, request_id);
            while let Some(event) = handle.next_event().await {
                if cli.json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    print_event(&event);
                }
            }
        }
        Commands::Simulate {
            subject,
            target,
            spender,
            chain_id,
            key,
        } => {
            let candidate = RemediationCandidate {
                idempotency_key: key.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                subject_address: parse_address(&subject)?,
                action_type: ActionType::RevokeApproval,
                target_contract: parse_address(&target)?,
                chain_id,
                spender: spender.as_deref().map(parse_address).transpose()?,
            };
            let outcome = state.remediation.submit(candidate).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                let verdict = if outcome.result.will_succeed { "✅ will succeed" } else { "❌ will fail" };
                println!("{} ({} calls)", verdict, outcome.result.calls);
                println!("   Estimated gas: {}", outcome.result.estimated_gas);
                println!("   Score delta:   {:.1}", outcome.result.score_delta);
                if let Some(reason) = &outcome.result.revert_reason {
                    println!("   Reason:        {}", reason);
                }
            }
        }
    }

    let stats = telemetry.snapshot();
    if stats.rpc_retries > 0 || stats.rpc_failovers > 0 {
        warn!(
            "RPC retries: {}, failovers: {}",
            stats.rpc_retries, stats.rpc_failovers
        );
    }
    Ok(())
}

fn print_event(event: &ScanEvent) {
    match event {
        ScanEvent::ProbeResult {
            probe,
            contribution,
            degraded,
            error_reason,
            running_aggregate,
            ..
        } => {
            match contribution {
                Some(c) => {
                    let stale = if c.from_stale_evidence { " (stale evidence)" } else { "" };
                    println!("• {:<24} score {:>5.1}{}", probe, c.score, stale);
                    for reason in &c.reasons {
                        println!("    - {}", reason);
                    }
                }
                None => println!(
                    "• {:<24} ⚠️ {}",
                    probe,
                    error_reason.as_deref().unwrap_or("no evidence")
                ),
            }
            let running = running_aggregate
                .score
                .map(|s| format!("{:.1}", s))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    running: score {} confidence {:.2} ({}/{}){}",
                running,
                running_aggregate.confidence,
                running_aggregate.resolved,
                running_aggregate.total,
                if *degraded { " degraded" } else { "" }
            );
        }
        ScanEvent::Complete {
            aggregate_score,
            confidence,
            degraded_probes,
            request_id,
            ..
        } => {
            let level = RiskLevel::from_score(*aggregate_score);
            println!();
            println!(
                "{} {} risk {:.1}/100, confidence {:.0}%",
                level.emoji(),
                level.as_str(),
                aggregate_score,
                confidence * 100.0
            );
            println!("   {}", level.recommendation());
            if !degraded_probes.is_empty() {
                println!("   Degraded probes: {}", degraded_probes.len());
            }
            println!("   requestId: {}", request_id);
        }
        ScanEvent::Failed {
            reason, request_id, ..
        } => {
            println!();
            println!("❌ Scan failed: {}", reason);
            println!("   requestId: {}", request_id);
        }
    }
}
