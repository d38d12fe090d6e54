//! One-shot reconciliation CLI.
//!
//! `billmirror-sync` runs a full pass over every kind; `billmirror-sync
//! <kind>` reconciles just that kind. Exits nonzero when any pass failed,
//! so cron and CI can alert on it.

use billmirror_core::{EntityKind, KindOutcome, MirrorService};
use tracing::info;

fn usage() -> ! {
    eprintln!("Usage: billmirror-sync [kind|all]");
    eprintln!();
    eprintln!("Without arguments (or with `all`), reconciles every kind in");
    eprintln!("dependency order.");
    eprint!("Kinds:");
    for kind in EntityKind::ALL {
        eprint!(" {}", kind.api_path());
    }
    eprintln!();
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let kind = match args.as_slice() {
        [] => None,
        [raw] if raw == "all" => None,
        [raw] => match EntityKind::parse(raw) {
            Some(kind) => Some(kind),
            None => {
                eprintln!("Unknown kind: {raw}");
                usage();
            }
        },
        _ => usage(),
    };

    let pool = billmirror_shared::create_pool().await?;
    billmirror_shared::run_migrations(&pool).await?;
    let service = MirrorService::from_env(pool)?;

    info!("Starting reconciliation");
    let mut failed = false;

    match kind {
        Some(kind) => match service.reconciler.sync_kind(kind).await {
            Ok(report) => {
                println!("{report}");
                failed = !report.succeeded();
            }
            Err(error) => {
                eprintln!("{kind}: {error}");
                failed = true;
            }
        },
        None => {
            for outcome in service.reconciler.sync_all().await {
                match outcome {
                    KindOutcome::Completed(report) => {
                        println!("{report}");
                        failed |= !report.succeeded();
                    }
                    KindOutcome::Failed { kind, error } => {
                        eprintln!("{kind}: aborted before delete phase: {error}");
                        failed = true;
                    }
                }
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
