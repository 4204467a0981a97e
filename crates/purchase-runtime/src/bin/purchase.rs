//! Terminal purchase flow
//!
//! Drives one payment session: prints the QR payload, reports state changes
//! and the remaining time, and abandons the session on Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use purchase_runtime::{
    HttpLicenseBackend, HttpPaymentGateway, LicenseIssuer, OrderContext, SessionController,
    SessionOutcome, SessionState, Tier,
};

#[derive(Debug, Parser)]
#[command(name = "purchase", about = "Buy a license code with a QR payment")]
struct Args {
    /// License tier (standard or premium)
    #[arg(long, default_value = "standard")]
    tier: Tier,

    /// Duration in months (1, 3, 6 or 12)
    #[arg(long, default_value_t = 1)]
    months: u32,

    /// Override the catalog price, in minor currency units
    #[arg(long)]
    amount: Option<u64>,
}

/// Wait for the session to finish, abandoning it on interrupt
///
/// An interrupt only ends the wait if it actually abandoned a live session.
/// Once payment is confirmed the license is still awaited.
async fn await_outcome(
    controller: &SessionController,
    interrupts: &mut mpsc::Receiver<()>,
) -> SessionOutcome {
    let mut updates = controller.subscribe();
    let mut countdown = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            outcome = controller.wait_for_outcome() => return outcome,
            Some(()) = interrupts.recv() => {
                if controller.abandon().await {
                    return SessionOutcome::Abandoned;
                }
                if controller.state().is_terminal() {
                    println!("Payment already received, still issuing your license code...");
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    return SessionOutcome::Abandoned;
                }
                let state = updates.borrow_and_update().state;
                if state == SessionState::Succeeded {
                    println!("Payment received, issuing license...");
                }
            }
            _ = countdown.tick() => {
                if let Some(deadline) = controller.deadline() {
                    let left = deadline.saturating_duration_since(tokio::time::Instant::now());
                    println!("Waiting for payment, {}s left", left.as_secs());
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();
    let order = match args.amount {
        Some(amount) => OrderContext::new(args.tier, args.months, amount)?,
        None => OrderContext::priced(args.tier, args.months)?,
    };

    let gateway = HttpPaymentGateway::from_env()?;
    tracing::info!("Payment API: {}", gateway.config().base_url);
    let backend = Arc::new(HttpLicenseBackend::from_env()?);
    let controller =
        SessionController::new(Arc::new(gateway), Arc::new(LicenseIssuer::new(backend)));

    tracing::info!("Order: {} ({} minor units)", order.description(), order.amount_minor_units());

    let intent = match controller.initiate(order).await {
        Ok(intent) => intent,
        Err(e) => {
            tracing::error!("{}", e.user_message());
            return Err(e.into());
        }
    };

    println!("Scan to pay (reference {}):", intent.external_reference);
    println!("  {}", intent.redeemable_payload);
    println!("Press Ctrl-C to abandon.");

    let (interrupt_tx, mut interrupts) = mpsc::channel(1);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    match await_outcome(&controller, &mut interrupts).await {
        SessionOutcome::Succeeded { license } => {
            println!("License code: {}", license.code());
            println!(
                "Tier: {}, valid for {} month(s)",
                license.record.tier, license.record.duration_months
            );
            if license.is_fallback() {
                println!(
                    "Note: keep your payment reference {} in case support asks for it.",
                    intent.external_reference
                );
            }
        }
        SessionOutcome::Failed { reason } => println!("{reason}"),
        SessionOutcome::TimedOut => println!("Payment timed out, please start again."),
        SessionOutcome::Abandoned => {}
    }

    Ok(())
}
