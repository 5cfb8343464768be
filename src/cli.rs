//! Interface de linha de comando do gatework baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (init, run, status)
//! e flags globais (--config, --max-retries, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// gatework: controlador de pipeline de build com gates de qualidade.
#[derive(Debug, Parser)]
#[command(name = "gatework", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./gatework.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Número máximo de retentativas por loop limitado.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cria o descritor do projeto e o backlog a partir de um arquivo JSON de itens.
    Init {
        /// Identificador do projeto.
        #[arg(long)]
        project_id: String,

        /// Arquivo JSON com a lista de itens de trabalho.
        #[arg(long)]
        backlog: PathBuf,

        /// Id do item meta que recebe a narrativa das sessões.
        #[arg(long)]
        meta_item: String,
    },

    /// Executa uma sessão: processa itens até concluir o backlog ou parar.
    Run,

    /// Mostra as contagens e o status de cada item.
    Status {
        /// Emite o resumo em JSON.
        #[arg(long)]
        json: bool,
    },
}
