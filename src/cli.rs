//! Interface de linha de comando do trainyard baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, platforms, check)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// trainyard: submete e acompanha jobs de treino em plataformas externas.
#[derive(Debug, Parser)]
#[command(name = "trainyard", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./trainyard.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submete os jobs do manifesto e acompanha até o estado terminal.
    Run {
        /// Caminho para um arquivo JSON ou TOML com credenciais e jobs.
        #[arg(long)]
        file: PathBuf,

        /// Tempo máximo de acompanhamento, em segundos.
        #[arg(long, default_value_t = 3600)]
        timeout_secs: u64,
    },

    /// Lista as plataformas registradas e as chaves obrigatórias de cada uma.
    Platforms,

    /// Valida um manifesto sem contatar nenhuma plataforma.
    Check {
        #[arg(long)]
        file: PathBuf,
    },
}
