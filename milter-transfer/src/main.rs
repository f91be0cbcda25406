use std::sync::Arc;

use clap::Parser;
use miette::{Context, IntoDiagnostic, Result};
use milter::harness::{self, Fixture};
use milter::{MilterCallbacks, MilterFactory};
use tracing_subscriber::EnvFilter;

mod callbacks;
mod config;

use callbacks::{EnvelopeCallbacks, TransferCallbacks};
use config::Cfg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Handler {
    /// Emergency-transfer filter (Subject containing EMERGENCY).
    Transfer,
    /// Envelope-editing example filter.
    Envelope,
}

/// Feeds one scripted mail transaction through the filter engine and prints
/// the verdict and final envelope state.
#[derive(Parser, Debug)]
#[command(name = "milter-transfer")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<String>,

    /// Mail file providing the header list and body.
    #[arg(long)]
    mail_file: Option<String>,

    /// Envelope sender.
    #[arg(long)]
    envelope_from: String,

    /// Envelope recipient; repeatable.
    #[arg(long = "envelope-recipient")]
    envelope_recipients: Vec<String>,

    /// Which shipped filter to run.
    #[arg(long, value_enum, default_value = "transfer")]
    handler: Handler,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => Cfg::load(path).wrap_err("loading config")?,
        None => Cfg::default(),
    };
    init_logging(&cfg)?;

    let (headers, body) = match &args.mail_file {
        Some(path) => read_mail(path)?,
        None => (Vec::new(), None),
    };
    let fixture = Fixture {
        sender: args.envelope_from.clone(),
        recipients: args.envelope_recipients.clone(),
        headers,
        body,
    };

    let factory: Arc<dyn MilterFactory> = match args.handler {
        Handler::Transfer => {
            let addresses = cfg.transfer.emergency_addresses.clone();
            Arc::new(move || {
                Box::new(TransferCallbacks::new(addresses.clone())) as Box<dyn MilterCallbacks>
            })
        }
        Handler::Envelope => Arc::new(|| Box::new(EnvelopeCallbacks) as Box<dyn MilterCallbacks>),
    };

    let outcome = harness::run(factory, cfg.engine.to_engine_config(), fixture).await?;

    println!("status: {}", outcome.status);
    println!("sender: {}", outcome.sender);
    for recipient in &outcome.recipients {
        println!("recipient: {}", recipient);
    }
    for (name, value) in &outcome.headers {
        println!("header: {}: {}", name, value);
    }
    Ok(())
}

fn read_mail(path: &str) -> Result<(Vec<(String, String)>, Option<Vec<u8>>)> {
    let raw = std::fs::read(path)
        .into_diagnostic()
        .wrap_err("reading mail file")?;
    let parsed = mailparse::parse_mail(&raw)
        .into_diagnostic()
        .wrap_err("parsing mail file")?;
    let headers = parsed
        .get_headers()
        .into_iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect();
    let body = parsed.get_body_raw().into_diagnostic()?;
    let body = (!body.is_empty()).then_some(body);
    Ok((headers, body))
}

fn init_logging(cfg: &Cfg) -> Result<()> {
    let filter = EnvFilter::try_new(&cfg.log.level).into_diagnostic()?;
    if cfg.log.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}
