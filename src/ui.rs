//! Interface de terminal do batchforge: barra de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para a barra de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente
//! a execução de um job no terminal a partir das leituras de status.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::job::{JobStatus, JobStatusRecord};

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// Exibe uma barra com `progress/total` durante o processamento e uma linha
/// colorida com o status final: verde para SUCCESS, amarelo para PARTIAL e
/// vermelho para as falhas.
pub struct JobProgress {
    pb: ProgressBar,
    yellow: Style,
}

impl JobProgress {
    /// Inicia a barra para um job com `total` itens.
    pub fn start(job_id: &str, total: usize) -> Self {
        let pb = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
        pb.set_message(format!("job {job_id}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            yellow: Style::new().yellow().bold(),
        }
    }

    /// Atualiza a barra com uma leitura de status.
    pub fn update(&self, record: &JobStatusRecord) {
        self.pb.set_length(record.total as u64);
        self.pb.set_position(record.progress as u64);
    }

    /// Exibe uma linha acima da barra sem interrompê-la.
    pub fn note(&self, message: &str) {
        self.pb.println(format!("  {} {message}", self.yellow.apply_to("!")));
    }

    /// Finaliza a barra e exibe o status terminal do job.
    pub fn complete(&self, record: &JobStatusRecord) {
        self.pb.finish_and_clear();
        println!("  {}", status_line(record));
    }
}

/// Rótulo de status colorido conforme o resultado, seguido de `(progresso/total)`.
pub fn status_line(record: &JobStatusRecord) -> String {
    let style = match record.status {
        JobStatus::Success => Style::new().green().bold(),
        JobStatus::Partial { .. } | JobStatus::Queued | JobStatus::Processing => Style::new().yellow().bold(),
        _ => Style::new().red().bold(),
    };
    format!(
        "{} ({}/{})",
        style.apply_to(record.status.to_string()),
        record.progress,
        record.total
    )
}
