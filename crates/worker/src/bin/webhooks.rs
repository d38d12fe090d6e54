//! Webhook endpoint management CLI.
//!
//! Registers this deployment's receiver with the provider, shows the
//! current registration, or removes it. The signing secret disclosed at
//! registration is persisted for the API server to verify deliveries with.

use billmirror_core::{EndpointInfo, MirrorService};

fn usage() -> ! {
    eprintln!("Usage: billmirror-webhooks <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  register <url>   Create a webhook endpoint pointing at <url>");
    eprintln!("  inspect          Show the registered endpoint, if any");
    eprintln!("  delete           Remove the registered endpoint");
    std::process::exit(2);
}

fn print_endpoint(info: &EndpointInfo) {
    println!("Endpoint:   {}", info.external_id);
    println!("URL:        {}", info.url);
    println!("Status:     {}", info.status);
    println!("Events:     {}", info.enabled_events.len());
    for event in &info.enabled_events {
        println!("  - {event}");
    }
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

    let pool = billmirror_shared::create_pool().await?;
    billmirror_shared::run_migrations(&pool).await?;
    let service = MirrorService::from_env(pool)?;

    match args.as_slice() {
        [command, url] if command == "register" => {
            let info = service.registrar.register(url).await?;
            println!("Registered webhook endpoint");
            print_endpoint(&info);
        }
        [command] if command == "inspect" => match service.registrar.inspect().await? {
            Some(info) => print_endpoint(&info),
            None => println!("No webhook endpoint registered"),
        },
        [command] if command == "delete" => {
            if service.registrar.delete().await? {
                println!("Webhook endpoint deleted");
            } else {
                println!("No webhook endpoint registered");
            }
        }
        _ => usage(),
    }

    Ok(())
}
