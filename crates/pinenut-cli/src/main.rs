use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use pinenut::{parse_to_file, DefaultFormatter, KeyPair};

/// Command-line companion to the Pinenut logging engine.
#[derive(Debug, Parser)]
#[clap(author, name = "pinenut", version)]
struct Cli {
    /// Filter for the tool's own diagnostics, e.g. "info" or "pinenut=debug".
    #[clap(long, default_value = "warn", env = "PINENUT_LOG")]
    log: String,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Subcommand {
    /// Generate a base64-encoded secp256r1 key pair. Configure loggers with
    /// the public key; keep the secret key wherever logs are parsed.
    GenKeys,
    /// Render a segment file or extracted archive as text.
    Parse(ParseArgs),
}

#[derive(Debug, clap::Args)]
struct ParseArgs {
    /// The segment file or extracted archive to parse.
    input: PathBuf,

    /// Where to write the rendered text.
    #[clap(long)]
    output: PathBuf,

    /// Base64 secret key, required for encrypted archives.
    #[clap(long)]
    secret_key: Option<String>,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&cli.log))
        .with_writer(std::io::stderr)
        .init();

    match cli.subcommand {
        Subcommand::GenKeys => {
            let pair = KeyPair::generate();
            println!("secret key: {}", pair.secret);
            println!("public key: {}", pair.public);
            Ok(())
        }
        Subcommand::Parse(args) => {
            parse_to_file(
                &args.input,
                &args.output,
                args.secret_key.as_deref(),
                &mut DefaultFormatter,
            )
            .with_context(|| format!("failed to parse {}", args.input.display()))?;
            tracing::info!(output = %args.output.display(), "archive parsed");
            Ok(())
        }
    }
}
