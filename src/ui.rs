//! Interface de terminal do trainyard: spinner e saída colorida.
//!
//! Usa `indicatif` para o spinner enquanto os jobs são acompanhados e
//! `console` para colorir o resumo final por status.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::{JobStatus, JobView};

/// Indicador visual enquanto os jobs de um manifesto são acompanhados.
pub struct FollowProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl FollowProgress {
    /// Inicia o spinner para `total` jobs.
    pub fn start(total: usize) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("following {total} job(s)"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a contagem de jobs terminais no spinner.
    pub fn update(&self, views: &[JobView]) {
        let done = views.iter().filter(|v| v.status.is_terminal()).count();
        let running = views.iter().filter(|v| v.status == JobStatus::Running).count();
        self.pb.set_message(format!(
            "{done}/{} terminal, {running} running",
            views.len()
        ));
    }

    /// Imprime uma mensagem acima do spinner.
    pub fn note(&self, message: &str) {
        self.pb.println(format!("  {} {message}", self.yellow.apply_to("!")));
    }

    /// Finaliza o spinner e exibe uma linha por job, colorida pelo status.
    pub fn finish(&self, views: &[JobView]) {
        self.pb.finish_and_clear();
        for view in views {
            let style = status_style(view.status, &self.green, &self.red, &self.yellow);
            let mark = match view.status {
                JobStatus::Completed => "✓",
                JobStatus::Failed | JobStatus::Cancelled => "✗",
                _ => "…",
            };
            let mut line = format!(
                "  {} {} {} {}",
                style.apply_to(mark),
                view.job_id,
                view.platform,
                style.apply_to(view.status)
            );
            if let Some(error) = &view.last_error {
                line.push_str(&format!(" ({error})"));
            }
            println!("{line}");
        }
    }

    /// Imprime a visão do job formatada em JSON.
    pub fn print_view(&self, view: &JobView) {
        let style = status_style(view.status, &self.green, &self.red, &self.yellow);
        println!();
        println!("{}", style.apply_to(format!("─── {} ───", view.job_id)));
        println!("{}", serde_json::to_string_pretty(view).unwrap_or_default());
    }
}

fn status_style<'a>(status: JobStatus, green: &'a Style, red: &'a Style, yellow: &'a Style) -> &'a Style {
    match status {
        JobStatus::Completed => green,
        JobStatus::Failed | JobStatus::Cancelled => red,
        _ => yellow,
    }
}
