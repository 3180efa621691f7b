//! `tokstep`: drive the decoding engine over a synthetic workload.

mod config;
mod logging;
mod model;
mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokstep_core::config::DecoderKind;

use crate::config::{DriverConfig, Overrides};

#[derive(Parser)]
#[command(name = "tokstep", about = "Step-level LLM decoding simulator")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct ConfigArgs {
    /// Config file (default: ~/.config/tokstep/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Decoder variant: early_stop, batched, mixed, star_attention, native
    #[arg(long)]
    decoder: Option<DecoderKind>,

    /// Number of synthetic requests
    #[arg(long)]
    requests: Option<usize>,

    /// Generation budget per request
    #[arg(long)]
    max_new_tokens: Option<usize>,

    #[arg(long)]
    vocab_size: Option<usize>,

    /// Overlap each step's decode with the previous step's commit
    #[arg(long)]
    overlap: bool,

    /// Seed for the synthetic model and stochastic sampling
    #[arg(long)]
    seed: Option<u64>,
}

impl ConfigArgs {
    fn resolve(&self) -> anyhow::Result<DriverConfig> {
        let mut config = DriverConfig::load(self.config.as_deref())?;
        config.merge(&Overrides {
            decoder: self.decoder,
            requests: self.requests,
            max_new_tokens: self.max_new_tokens,
            vocab_size: self.vocab_size,
            overlap: self.overlap,
            seed: self.seed,
        });
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run a synthetic workload and print a JSON summary
    Simulate(ConfigArgs),
    /// Print the effective merged configuration as TOML
    ShowConfig {
        #[command(flatten)]
        args: ConfigArgs,

        /// Also write the configuration to this file
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref(), logging::LogFormat::from_env())?;

    match cli.command {
        Command::Simulate(args) => {
            let config = args.resolve()?;
            tracing::info!(
                decoder = %config.decoder.kind,
                overlap = config.decoder.overlap,
                requests = config.workload.requests,
                "starting simulation"
            );
            let summary = simulate::run(&config)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::ShowConfig { args, write } => {
            let config = args.resolve()?;
            if let Some(path) = write {
                config.save_to(&path)?;
                tracing::info!(path = %path.display(), "configuration written");
            }
            print!("{}", config.to_toml()?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn simulate_flags_parse() {
        let cli = Cli::try_parse_from([
            "tokstep",
            "simulate",
            "--decoder",
            "star-attention",
            "--requests",
            "3",
            "--overlap",
            "--seed",
            "9",
        ])
        .unwrap();
        let Command::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.decoder, Some(DecoderKind::StarAttention));
        assert_eq!(args.requests, Some(3));
        assert!(args.overlap);
        assert_eq!(args.seed, Some(9));
    }

    #[test]
    fn show_config_takes_write_path() {
        let cli =
            Cli::try_parse_from(["tokstep", "show-config", "--write", "out.toml", "--overlap"])
                .unwrap();
        let Command::ShowConfig { args, write } = cli.command else {
            panic!("expected show-config");
        };
        assert_eq!(write, Some(PathBuf::from("out.toml")));
        assert!(args.overlap);
    }

    #[test]
    fn unknown_decoder_is_rejected() {
        assert!(Cli::try_parse_from(["tokstep", "simulate", "--decoder", "beam"]).is_err());
    }
}
