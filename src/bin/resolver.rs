//! Waypost resolver binary: iterative DNS resolution from the roots.

use std::process::ExitCode;

use clap::Parser;
use waypost::dns::{RecordType, Resolver};

#[derive(Parser)]
#[command(name = "resolver", version, about = "Iterative DNS resolver with a TTL cache")]
struct Args {
    /// Domain name to resolve
    name: String,

    /// Record type: A, AAAA, NS, MX, CNAME, PTR, SOA, TXT or ANY
    rtype: String,

    /// Debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Records go to stdout, so all logging goes to stderr.
    let level = if args.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("waypost={level}").parse().unwrap()),
        )
        .init();

    let Ok(qtype) = args.rtype.parse::<RecordType>() else {
        eprintln!("unsupported record type: {}", args.rtype);
        return ExitCode::FAILURE;
    };

    let resolver = Resolver::new();
    match resolver.resolve(&args.name, qtype).await {
        Ok(records) => {
            for record in &records {
                match record.preference {
                    Some(preference) => println!("{preference} {}", record.data),
                    None => println!("{}", record.data),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("resolution failed: {e}");
            ExitCode::FAILURE
        }
    }
}
