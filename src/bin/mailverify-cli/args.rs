use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mailverify-cli", version, about = "Vérification SMTP (RCPT TO) d'adresses e-mail en masse")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,

    /// journalisation détaillée (trafic SMTP, décisions du pool)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// n'affiche que les avertissements et les erreurs
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// vérifie des adresses (une par ligne) via SMTP RCPT TO
    Verify(VerifyArgs),
    /// liste les statuts de vérification et leur description
    Statuses,
}

#[derive(Args)]
pub struct VerifyArgs {
    /// fichier d'adresses, stdin si absent ou "-"
    pub input: Option<PathBuf>,

    /// écrit le rapport dans ce fichier plutôt que sur stdout
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// format: human|csv|ndjson
    #[arg(long, default_value = "human")]
    pub format: String,

    /// configuration par hôte (hosts.yaml)
    #[cfg(feature = "with-yaml")]
    #[arg(long = "hosts-config")]
    pub hosts_config: Option<PathBuf>,

    /// proxy SOCKS5 IP:PORT
    #[arg(short = 'x', long)]
    pub proxy: Option<String>,

    /// vérifications simultanées, toutes destinations confondues
    #[arg(long, env = "MAILVERIFY_MAX_CONCURRENT", default_value = "1000")]
    pub max_concurrent: NonZeroUsize,

    /// délai de connexion (secondes, 0 = celui du système)
    #[arg(long, env = "MAILVERIFY_CONNECT_TIMEOUT", default_value_t = 30.0)]
    pub connect_timeout: f64,

    /// intervalle minimal entre deux adresses lues (ms)
    #[arg(long = "min-interval-ms")]
    pub min_interval_ms: Option<u64>,
}

impl Cli {
    /// filtre de logs utilisé quand `RUST_LOG` n'est pas défini
    pub fn default_filter(&self) -> &'static str {
        if self.verbose {
            "mailverify_lib=debug,mailverify_cli=debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

impl VerifyArgs {
    pub fn connect_timeout(&self) -> Result<Option<Duration>> {
        if self.connect_timeout == 0.0 {
            return Ok(None);
        }
        match Duration::try_from_secs_f64(self.connect_timeout) {
            Ok(timeout) => Ok(Some(timeout)),
            Err(_) => bail!("invalid --connect-timeout '{}'", self.connect_timeout),
        }
    }

    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_defaults() {
        let cli = Cli::try_parse_from(["mailverify-cli", "verify", "list.txt"]).unwrap();
        let Commands::Verify(ref args) = cli.cmd else {
            panic!("expected verify");
        };
        assert_eq!(args.input, Some(PathBuf::from("list.txt")));
        assert_eq!(args.format, "human");
        assert_eq!(args.connect_timeout().unwrap(), Some(Duration::from_secs(30)));
        assert_eq!(args.min_interval(), None);
        assert_eq!(cli.default_filter(), "info");
    }

    #[test]
    fn zero_timeout_disables_it() {
        let cli = Cli::try_parse_from([
            "mailverify-cli",
            "-v",
            "verify",
            "--connect-timeout",
            "0",
            "--max-concurrent",
            "10",
        ])
        .unwrap();
        assert!(cli.default_filter().contains("debug"));
        let Commands::Verify(args) = cli.cmd else {
            panic!("expected verify");
        };
        assert_eq!(args.connect_timeout().unwrap(), None);
        assert_eq!(args.max_concurrent.get(), 10);
    }

    #[test]
    fn rejects_zero_concurrency() {
        assert!(
            Cli::try_parse_from(["mailverify-cli", "verify", "--max-concurrent", "0"]).is_err()
        );
    }

    #[test]
    fn rejects_negative_timeout() {
        let cli = Cli::try_parse_from([
            "mailverify-cli",
            "verify",
            "--connect-timeout=-1",
        ])
        .unwrap();
        let Commands::Verify(args) = cli.cmd else {
            panic!("expected verify");
        };
        assert!(args.connect_timeout().is_err());
    }
}
