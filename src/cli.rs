//! Interface de linha de comando do batchforge baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, status, recover)
//! e flags globais (--workers, --max-retries, --data-dir, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Overrides;

/// batchforge: geração de texto em lote sobre linhas tabulares.
#[derive(Debug, Parser)]
#[command(name = "batchforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Número de workers no pool.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Número máximo de retentativas em caso de falha transitória.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Diretório de estado e artefatos.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            workers: self.workers,
            max_retries: self.max_retries,
            data_dir: self.data_dir.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Processa um arquivo de linhas (JSON ou CSV) e gera o artefato final.
    Run {
        /// Caminho do arquivo de entrada.
        input: PathBuf,

        /// Usa o gerador offline em vez da API.
        #[arg(long)]
        dry_run: bool,

        /// Gera uma sequência de mensagens por linha, uma coluna por passo.
        #[arg(long)]
        sequence: bool,
    },

    /// Mostra o status durável de um job.
    Status {
        job_id: String,
    },

    /// Reconstrói um artefato parcial a partir dos resultados persistidos.
    Recover {
        job_id: String,
    },
}
