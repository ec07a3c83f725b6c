//! Configuração do batchforge carregada a partir de `batchforge.toml`.
//!
//! A struct [`BatchConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `ANTHROPIC_API_KEY` tem precedência sobre o arquivo,
//! e as flags da CLI têm precedência sobre ambos (ver [`BatchConfig::apply_overrides`]).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::job::{RetryConfig, Step};
use crate::worker::DEFAULT_MODELS;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "batchforge.toml";

/// Configuração de nível superior carregada de `batchforge.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Chave da API Anthropic.
    pub api_key: String,

    /// URL do endpoint de mensagens.
    pub api_url: String,

    /// Rotação de modelos distribuída entre os workers.
    pub models: Vec<String>,

    /// Quantidade de workers de longa duração no pool.
    pub worker_count: usize,

    /// Intervalo mínimo entre chamadas de um mesmo worker, em milissegundos.
    pub rate_limit_interval_ms: u64,

    /// Máximo de retentativas após a primeira tentativa.
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    pub base_delay_ms: u64,

    /// Tempo limite de cada chamada ao gerador, em segundos.
    pub request_timeout_secs: u64,

    /// Janela máxima sem nenhum relato de tarefa antes de a barreira de
    /// fan-in desistir, em segundos. Reinicia a cada tarefa concluída.
    pub join_timeout_secs: u64,

    /// Teto para a dica `retry-after` do servidor, em segundos.
    pub max_retry_after_secs: u64,

    /// Diretório de estado durável e artefatos.
    pub data_dir: PathBuf,

    /// Nome da coluna com o texto gerado no artefato final.
    pub output_column: String,

    /// Instrução enviada antes dos campos de cada linha.
    pub instruction: String,

    /// Limite de tokens da resposta.
    pub max_tokens: u32,

    /// Passos do modo sequência, em ordem (`[[sequence]]` com `column` e
    /// `instruction`). Vazio: um único passo em `output_column`.
    pub sequence: Vec<Step>,
}

/// Sequência padrão de três mensagens usada por `run --sequence`.
pub fn default_sequence() -> Vec<Step> {
    vec![
        Step::new(
            "initial_email",
            "Write a natural, conversational first email to the contact described below. \
             50-70 words, no signature.",
        ),
        Step::new(
            "followup_1",
            "Write a short follow-up email to the contact described below with a little more detail \
             on how we could help a business like theirs. 60-80 words, no signature.",
        ),
        Step::new(
            "followup_2",
            "Write a brief, light-hearted final follow-up email to the contact described below, \
             saying this is the last note. 50-70 words, no signature.",
        ),
    ]
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            models: DEFAULT_MODELS.iter().map(|m| m.to_string()).collect(),
            worker_count: 4,
            rate_limit_interval_ms: 200,
            max_retries: 3,
            base_delay_ms: 1000,
            request_timeout_secs: 60,
            join_timeout_secs: 300,
            max_retry_after_secs: 60,
            data_dir: PathBuf::from("uploads"),
            output_column: "generated_text".to_string(),
            instruction: "Write a short, friendly personalised message for the contact described below."
                .to_string(),
            max_tokens: 200,
            sequence: Vec::new(),
        }
    }
}

/// Valores da CLI que sobrescrevem o arquivo e o ambiente.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub data_dir: Option<PathBuf>,
}

impl BatchConfig {
    /// Carrega a configuração de `batchforge.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<BatchConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.is_empty() {
                config.api_key = key;
            }
        }

        Ok(config)
    }

    /// Aplica as flags da CLI e valida o resultado.
    pub fn apply_overrides(mut self, overrides: &Overrides) -> Result<Self> {
        if let Some(workers) = overrides.workers {
            self.worker_count = workers;
        }
        if let Some(retries) = overrides.max_retries {
            self.max_retries = retries;
        }
        if let Some(dir) = &overrides.data_dir {
            self.data_dir = dir.clone();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.worker_count > 0, "worker_count must be at least 1");
        anyhow::ensure!(!self.models.is_empty(), "models must list at least one model");
        anyhow::ensure!(!self.output_column.is_empty(), "output_column must not be empty");
        for (i, step) in self.sequence.iter().enumerate() {
            anyhow::ensure!(!step.column.is_empty(), "sequence step {} has an empty column", i + 1);
            anyhow::ensure!(
                !self.sequence[..i].iter().any(|s| s.column == step.column),
                "sequence column `{}` is used twice",
                step.column
            );
        }
        Ok(())
    }

    /// Liga o modo sequência com [`default_sequence`] se nenhum passo foi configurado.
    pub fn with_default_sequence(mut self) -> Self {
        if self.sequence.is_empty() {
            self.sequence = default_sequence();
        }
        self
    }

    /// Passos executados para cada linha.
    pub fn steps(&self) -> Vec<Step> {
        if self.sequence.is_empty() {
            vec![Step::new(self.output_column.as_str(), self.instruction.as_str())]
        } else {
            self.sequence.clone()
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }

    pub fn rate_limit_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_secs(self.max_retry_after_secs)
    }
}
