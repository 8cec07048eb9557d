// main.rs
// Scheduler entry point: the external cron invokes this binary on its
// cadence. It runs one invoice-generation pass followed by one
// delinquency pass and logs both summaries.

use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use matricula::state::{
    init_state, process_due_installment_invoices, process_installment_delinquencies,
};

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let state = init_state()
        .await
        .expect("failed to initialize MongoDB state");

    let generation = process_due_installment_invoices(&state)
        .await
        .expect("installment generation run failed");
    tracing::info!(
        total_due = generation.total_due,
        processed = generation.processed,
        errors = generation.errors,
        "generation run complete"
    );
    if generation.errors > 0 {
        let details = serde_json::to_string(&generation.details).unwrap_or_default();
        tracing::warn!(%details, "generation run had row failures");
    }

    let delinquency = process_installment_delinquencies(&state)
        .await
        .expect("delinquency run failed");
    tracing::info!(
        scanned = delinquency.scanned,
        penalties_applied = delinquency.penalties_applied,
        removals_applied = delinquency.removals_applied,
        errors = delinquency.errors,
        "delinquency run complete"
    );
}
